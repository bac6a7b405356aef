use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull};

/// Where a record entered the cache: the paginated poll path or a push
/// delivery (webhook or SSE). Merges are last-write-wins by `observed_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Poll,
    Push,
}

/// Decoded marketplace instruction. `Unknown` keeps records for
/// transactions whose discriminator or argument layout we cannot read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "camelCase")]
pub enum MarketInstruction {
    CreatePool {
        base_price_lamports: u64,
        growth_factor_bps: u64,
    },
    CreateCollectionNft {
        name: String,
        symbol: String,
        uri: String,
    },
    MintNft {
        name: String,
        symbol: String,
        uri: String,
    },
    SellNft,
    Unknown,
}

impl MarketInstruction {
    pub fn name(&self) -> &'static str {
        match self {
            MarketInstruction::CreatePool { .. } => "createPool",
            MarketInstruction::CreateCollectionNft { .. } => "createCollectionNft",
            MarketInstruction::MintNft { .. } => "mintNft",
            MarketInstruction::SellNft => "sellNft",
            MarketInstruction::Unknown => "unknown",
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, MarketInstruction::Unknown)
    }
}

/// One cached history record, keyed by signature. Addresses are base58
/// strings as delivered by the indexer API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub signature: String,
    pub slot: u64,
    pub block_time: Option<DateTime<Utc>>,
    pub instruction: MarketInstruction,
    pub fee_payer: String,
    pub account_keys: Vec<String>,
    pub pool: Option<String>,
    pub escrow: Option<String>,
    pub nft_mint: Option<String>,
    pub price_lamports: Option<u64>,
    pub price_load_attempted: bool,
    pub price_load_succeeded: bool,
    pub source: RecordSource,
    pub observed_at: DateTime<Utc>,
}

impl HistoryItem {
    pub fn price_sol(&self) -> Option<f64> {
        self.price_lamports
            .map(solana_sdk::native_token::lamports_to_sol)
    }

    /// Age reference for eviction and TTL: chain time when known, otherwise
    /// the moment we first observed the record.
    pub fn age_basis(&self) -> DateTime<Utc> {
        self.block_time.unwrap_or(self.observed_at)
    }

    /// Mints and sells are trades; pool and collection creation are not.
    pub fn is_trade(&self) -> bool {
        matches!(
            self.instruction,
            MarketInstruction::MintNft { .. } | MarketInstruction::SellNft
        )
    }
}

// Wire shape of the enhanced transactions API (and of webhook deliveries,
// which carry the same envelopes). Unknown fields are ignored; nullable
// arrays deserialize to empty.

#[serde_as]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnhancedTransaction {
    pub signature: String,
    pub slot: u64,
    pub timestamp: Option<i64>,
    pub fee_payer: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub instructions: Vec<EnhancedInstruction>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    pub native_transfers: Vec<NativeTransfer>,
    pub transaction_error: Option<serde_json::Value>,
}

impl EnhancedTransaction {
    pub fn block_time(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|t| chrono::TimeZone::timestamp_opt(&Utc, t, 0).single())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EnhancedInstruction {
    pub program_id: String,
    pub accounts: Vec<String>,
    /// Instruction payload, base58 (base64 tolerated).
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NativeTransfer {
    pub from_user_account: String,
    pub to_user_account: String,
    pub amount: u64,
}

/// Minimal balance view of a confirmed transaction, flattened from the RPC
/// response: static account keys followed by loaded addresses, with the
/// matching pre/post lamport arrays.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionBalances {
    pub account_keys: Vec<String>,
    pub pre_balances: Vec<u64>,
    pub post_balances: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub address: String,
    pub creator: String,
    pub escrow: Option<String>,
    pub base_price_lamports: u64,
    pub growth_factor_bps: u64,
    pub collection: Option<String>,
    pub created_at: DateTime<Utc>,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Collection {
    pub address: String,
    /// Pool the collection was created for, when the record resolved one.
    pub pool: Option<String>,
    pub name: String,
    pub symbol: String,
    pub uri: String,
    pub created_at: DateTime<Utc>,
    pub signature: String,
}

/// Rolling 24h aggregates for one pool, recomputed from the record set on
/// each access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub pool: String,
    pub volume_24h_lamports: u64,
    pub tx_count_24h: u64,
    pub unique_traders_24h: u64,
    pub last_price_lamports: Option<u64>,
    pub computed_at: DateTime<Utc>,
}

/// One minted NFT as shown in a pool's grid view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NftGridItem {
    pub nft_mint: String,
    pub pool: String,
    pub minter: String,
    pub name: String,
    pub uri: String,
    pub price_lamports: Option<u64>,
    pub block_time: DateTime<Utc>,
    pub signature: String,
}

/// One OHLC bucket. `bucket_start` is unix seconds aligned to the interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub pool: String,
    pub interval_secs: i64,
    pub bucket_start: i64,
    pub open: u64,
    pub high: u64,
    pub low: u64,
    pub close: u64,
    pub volume_lamports: u64,
    pub trades_count: u32,
}

/// Typed envelope published to SSE clients and exchanged with the remote
/// overlay stream: `{"type": ..., "timestamp": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEnvelope {
    #[serde(rename = "type")]
    pub event_type: StreamEventType,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl StreamEnvelope {
    pub fn now(event_type: StreamEventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamEventType {
    Connection,
    Heartbeat,
    NewPools,
    NewCollections,
    VolumeUpdate,
    PoolTransaction,
    Transaction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enhanced_transaction_tolerates_null_arrays() {
        let json = r#"{
            "signature": "sig1",
            "slot": 42,
            "timestamp": 1700000000,
            "feePayer": "payer",
            "instructions": null,
            "nativeTransfers": null
        }"#;
        let tx: EnhancedTransaction = serde_json::from_str(json).unwrap();
        assert_eq!(tx.signature, "sig1");
        assert!(tx.instructions.is_empty());
        assert!(tx.native_transfers.is_empty());
        assert_eq!(tx.block_time().unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_enhanced_transaction_camel_case_fields() {
        let json = r#"{
            "signature": "sig2",
            "slot": 7,
            "feePayer": "payer",
            "nativeTransfers": [
                {"fromUserAccount": "a", "toUserAccount": "b", "amount": 5000}
            ]
        }"#;
        let tx: EnhancedTransaction = serde_json::from_str(json).unwrap();
        assert_eq!(tx.native_transfers.len(), 1);
        assert_eq!(tx.native_transfers[0].from_user_account, "a");
        assert_eq!(tx.native_transfers[0].amount, 5_000);
    }

    #[test]
    fn test_stream_envelope_type_tags() {
        let env = StreamEnvelope::now(
            StreamEventType::PoolTransaction,
            serde_json::json!({"signature": "s"}),
        );
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], "poolTransaction");

        let types = [
            (StreamEventType::Connection, "connection"),
            (StreamEventType::Heartbeat, "heartbeat"),
            (StreamEventType::NewPools, "newPools"),
            (StreamEventType::NewCollections, "newCollections"),
            (StreamEventType::VolumeUpdate, "volumeUpdate"),
            (StreamEventType::Transaction, "transaction"),
        ];
        for (t, expected) in types {
            assert_eq!(serde_json::to_value(t).unwrap(), expected);
        }
    }

    #[test]
    fn test_price_sol_conversion() {
        let item = HistoryItem {
            signature: "s".to_string(),
            slot: 1,
            block_time: None,
            instruction: MarketInstruction::SellNft,
            fee_payer: "p".to_string(),
            account_keys: vec![],
            pool: None,
            escrow: None,
            nft_mint: None,
            price_lamports: Some(50_000_000),
            price_load_attempted: true,
            price_load_succeeded: true,
            source: RecordSource::Poll,
            observed_at: Utc::now(),
        };
        assert!((item.price_sol().unwrap() - 0.05).abs() < f64::EPSILON);
    }

    #[test]
    fn test_instruction_names() {
        assert_eq!(MarketInstruction::SellNft.name(), "sellNft");
        assert_eq!(
            MarketInstruction::CreatePool {
                base_price_lamports: 0,
                growth_factor_bps: 0
            }
            .name(),
            "createPool"
        );
        assert!(MarketInstruction::Unknown.is_unknown());
    }
}
