// Webhook receiver guts: HMAC-SHA256 authentication of raw delivery bodies,
// ingestion of the enhanced-transaction envelopes they carry, and the fanout
// of derived stream events republished to connected SSE clients.

use crate::error::Result;
use crate::history::HistoryService;
use crate::models::{EnhancedTransaction, HistoryItem, StreamEnvelope, StreamEventType};
use crate::pools::{collect_collections, collect_pools};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of the raw body. What a sender puts in the signature
/// header.
pub fn sign_payload(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a delivery signature against the raw body. Any
/// malformed header value fails closed.
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// What one authenticated delivery did to the cache.
#[derive(Debug)]
pub struct DeliveryOutcome {
    /// Envelopes in the delivery body.
    pub processed: usize,
    /// Records inserted for the first time, ready for fanout.
    pub fresh: Vec<HistoryItem>,
}

/// Parse an authenticated delivery body (a JSON array of enhanced
/// transactions) and merge it through the push path.
pub async fn process_delivery(
    service: &HistoryService,
    body: &[u8],
) -> Result<DeliveryOutcome> {
    let envelopes: Vec<EnhancedTransaction> = serde_json::from_slice(body)?;
    let fresh = service.apply_live(&envelopes).await;
    tracing::info!(
        processed = envelopes.len(),
        fresh = fresh.len(),
        "webhook delivery merged"
    );
    Ok(DeliveryOutcome {
        processed: envelopes.len(),
        fresh,
    })
}

/// Stream events derived from a batch of freshly inserted records: one
/// `transaction` per record, a `poolTransaction` for records tied to a
/// pool, plus aggregate `newPools`, `newCollections` and per-pool
/// `volumeUpdate` events.
pub fn derived_envelopes(items: &[HistoryItem]) -> Vec<StreamEnvelope> {
    let mut events = Vec::new();

    for item in items {
        let data = match serde_json::to_value(item) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(signature = %item.signature, "record failed to serialize: {e}");
                continue;
            }
        };
        events.push(StreamEnvelope::now(StreamEventType::Transaction, data.clone()));
        if item.pool.is_some() {
            events.push(StreamEnvelope::now(StreamEventType::PoolTransaction, data));
        }
    }

    let refs: Vec<&HistoryItem> = items.iter().collect();
    let pools = collect_pools(&refs);
    if !pools.is_empty() {
        if let Ok(data) = serde_json::to_value(&pools) {
            events.push(StreamEnvelope::now(StreamEventType::NewPools, data));
        }
    }
    let collections = collect_collections(&refs);
    if !collections.is_empty() {
        if let Ok(data) = serde_json::to_value(&collections) {
            events.push(StreamEnvelope::now(StreamEventType::NewCollections, data));
        }
    }

    // Priced trade flow per pool in this batch, in a stable order.
    let mut traded: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
    for item in items {
        let (Some(pool), Some(price)) = (item.pool.as_deref(), item.price_lamports) else {
            continue;
        };
        if !item.is_trade() {
            continue;
        }
        let entry = traded.entry(pool).or_insert((0, 0));
        entry.0 = entry.0.saturating_add(price);
        entry.1 += 1;
    }
    for (pool, (volume, trades)) in traded {
        events.push(StreamEnvelope::now(
            StreamEventType::VolumeUpdate,
            json!({ "pool": pool, "volume_lamports": volume, "trades": trades }),
        ));
    }

    events
}

/// Push derived events onto the hub. A hub with no subscribers is fine.
pub fn publish_derived(hub: &broadcast::Sender<StreamEnvelope>, items: &[HistoryItem]) {
    for event in derived_envelopes(items) {
        let _ = hub.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackfillConfig, CacheConfig, PriceConfig, TransferSelection};
    use crate::helius_client::HistorySource;
    use crate::instruction_parser::program_schemas;
    use crate::models::{EnhancedInstruction, MarketInstruction, NativeTransfer, RecordSource};
    use async_trait::async_trait;
    use borsh::BorshSerialize;
    use chrono::Utc;
    use std::sync::Arc;

    const PROGRAM_ID: &str = "MintStreetProgram1111111111111111111111111";
    const SECRET: &str = "street-level-secret";

    struct NoSource;

    #[async_trait]
    impl HistorySource for NoSource {
        async fn fetch_page(
            &self,
            _address: &str,
            _limit: usize,
            _before: Option<&str>,
        ) -> Result<Vec<EnhancedTransaction>> {
            Ok(Vec::new())
        }
    }

    fn service() -> HistoryService {
        HistoryService::new(
            PROGRAM_ID.to_string(),
            50,
            &CacheConfig {
                max_size: 100,
                // Far larger than the age of the fixed fixture timestamps, so
                // the TTL sweep never interferes with what these tests check.
                ttl_secs: 86_400 * 365 * 100,
                snapshot_path: None,
            },
            PriceConfig {
                dust_threshold_lamports: 1_000,
                transfer_selection: TransferSelection::Largest,
            },
            BackfillConfig {
                batch_size: 5,
                inter_batch_delay_ms: 0,
            },
            Arc::new(NoSource),
        )
    }

    #[derive(BorshSerialize)]
    struct Meta {
        name: String,
        symbol: String,
        uri: String,
    }

    fn mint_envelope(sig: &str, price: u64) -> EnhancedTransaction {
        let mut data = program_schemas()[2].discriminator.to_vec();
        data.extend_from_slice(
            &borsh::to_vec(&Meta {
                name: "Street Cat".to_string(),
                symbol: "CAT".to_string(),
                uri: "https://arweave.net/cat".to_string(),
            })
            .unwrap(),
        );
        EnhancedTransaction {
            signature: sig.to_string(),
            slot: 900,
            timestamp: Some(1_700_000_000),
            fee_payer: "payer_w".to_string(),
            instructions: vec![EnhancedInstruction {
                program_id: PROGRAM_ID.to_string(),
                accounts: vec![
                    "payer_w".to_string(),
                    "pool_a".to_string(),
                    "escrow_a".to_string(),
                    format!("nft_{sig}"),
                    "metadata_a".to_string(),
                    "11111111111111111111111111111111".to_string(),
                ],
                data: bs58::encode(data).into_string(),
            }],
            native_transfers: vec![NativeTransfer {
                from_user_account: "payer_w".to_string(),
                to_user_account: "escrow_a".to_string(),
                amount: price,
            }],
            ..Default::default()
        }
    }

    fn record(sig: &str, instruction: MarketInstruction) -> HistoryItem {
        HistoryItem {
            signature: sig.to_string(),
            slot: 5,
            block_time: Some(Utc::now()),
            instruction,
            fee_payer: "payer_w".to_string(),
            account_keys: vec![],
            pool: Some("pool_a".to_string()),
            escrow: Some("escrow_a".to_string()),
            nft_mint: Some(format!("nft_{sig}")),
            price_lamports: None,
            price_load_attempted: false,
            price_load_succeeded: false,
            source: RecordSource::Push,
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_signature_round_trip_and_tamper() {
        let body = br#"[{"signature":"abc"}]"#;
        let signature = sign_payload(SECRET, body);
        assert!(verify_signature(SECRET, body, &signature));
        assert!(verify_signature(SECRET, body, &format!("  {signature} ")));

        assert!(!verify_signature(SECRET, b"tampered", &signature));
        assert!(!verify_signature("other-secret", body, &signature));
        assert!(!verify_signature(SECRET, body, "zz-not-hex"));
        assert!(!verify_signature(SECRET, body, &signature[..16]));
        assert!(!verify_signature(SECRET, body, ""));
    }

    #[tokio::test]
    async fn test_process_delivery_merges_and_dedups() {
        let svc = service();
        let body = serde_json::to_vec(&vec![
            mint_envelope("w1", 5_000_000),
            mint_envelope("w2", 7_000_000),
        ])
        .unwrap();

        let outcome = process_delivery(&svc, &body).await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.fresh.len(), 2);
        assert_eq!(outcome.fresh[0].price_lamports, Some(5_000_000));
        assert_eq!(outcome.fresh[0].source, RecordSource::Push);

        // Redelivery inserts nothing new.
        let outcome = process_delivery(&svc, &body).await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert!(outcome.fresh.is_empty());
    }

    #[tokio::test]
    async fn test_process_delivery_rejects_malformed_body() {
        let svc = service();
        assert!(process_delivery(&svc, b"{not json").await.is_err());
        assert!(process_delivery(&svc, br#"{"object":"not an array"}"#).await.is_err());
    }

    #[test]
    fn test_derived_envelopes_cover_all_event_kinds() {
        let create = record(
            "sig_pool",
            MarketInstruction::CreatePool {
                base_price_lamports: 100,
                growth_factor_bps: 50,
            },
        );
        let coll = record(
            "sig_coll",
            MarketInstruction::CreateCollectionNft {
                name: "Doodles".to_string(),
                symbol: "DOO".to_string(),
                uri: "u".to_string(),
            },
        );
        let mut mint = record(
            "sig_mint",
            MarketInstruction::MintNft {
                name: "n".to_string(),
                symbol: "s".to_string(),
                uri: "u".to_string(),
            },
        );
        mint.price_lamports = Some(9_000);

        let events = derived_envelopes(&[create, coll, mint]);
        let count = |t: StreamEventType| events.iter().filter(|e| e.event_type == t).count();

        assert_eq!(count(StreamEventType::Transaction), 3);
        assert_eq!(count(StreamEventType::PoolTransaction), 3);
        assert_eq!(count(StreamEventType::NewPools), 1);
        assert_eq!(count(StreamEventType::NewCollections), 1);
        assert_eq!(count(StreamEventType::VolumeUpdate), 1);

        let volume = events
            .iter()
            .find(|e| e.event_type == StreamEventType::VolumeUpdate)
            .unwrap();
        assert_eq!(volume.data["pool"], "pool_a");
        assert_eq!(volume.data["volume_lamports"], 9_000);
        assert_eq!(volume.data["trades"], 1);

        let pools = events
            .iter()
            .find(|e| e.event_type == StreamEventType::NewPools)
            .unwrap();
        assert_eq!(pools.data[0]["address"], "pool_a");
    }

    #[test]
    fn test_publish_derived_without_subscribers_is_quiet() {
        let (hub, _) = broadcast::channel(16);
        let rx_count_before = hub.receiver_count();
        publish_derived(&hub, &[record("s", MarketInstruction::SellNft)]);
        assert_eq!(hub.receiver_count(), rx_count_before);
    }
}
