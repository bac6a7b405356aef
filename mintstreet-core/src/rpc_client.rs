// Retrying wrapper over the nonblocking Solana RPC client. Sell pricing only
// needs pre/post lamport balances, so responses flatten to the minimal
// `TransactionBalances` view (static keys followed by loaded addresses, the
// order the balance arrays use). Also hosts the programSubscribe watcher
// that turns pool account changes into volumeUpdate envelopes.

use crate::config::RpcConfig;
use crate::error::{IndexerError, Result};
use crate::models::{StreamEnvelope, StreamEventType, TransactionBalances};
use crate::price_extractor::TransactionFetch;
use crate::throttle::{retry_request, Throttle, RPC_BACKOFF_FACTOR};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::{
    RpcAccountInfoConfig, RpcProgramAccountsConfig, RpcTransactionConfig,
};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, EncodedTransaction, UiMessage,
    UiTransactionEncoding,
};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

pub struct NetworkClient {
    rpc: RpcClient,
    config: RpcConfig,
    throttle: Arc<Throttle>,
}

impl NetworkClient {
    pub fn new(config: RpcConfig, throttle: Arc<Throttle>) -> Self {
        let rpc =
            RpcClient::new_with_commitment(config.http_url.clone(), CommitmentConfig::confirmed());
        Self {
            rpc,
            config,
            throttle,
        }
    }

    /// Fetch a confirmed transaction and flatten it to its balance view.
    /// Retries with tripling backoff; RPC rate limits burn budget fast.
    pub async fn get_transaction_balances(&self, signature: &str) -> Result<TransactionBalances> {
        let sig = Signature::from_str(signature)
            .map_err(|e| IndexerError::Decode(format!("bad signature {signature}: {e}")))?;
        retry_request(
            self.config.max_retries,
            Duration::from_millis(self.config.base_delay_ms),
            RPC_BACKOFF_FACTOR,
            || self.fetch_once(&sig),
        )
        .await
    }

    async fn fetch_once(&self, sig: &Signature) -> Result<TransactionBalances> {
        let _permit = self.throttle.acquire().await?;
        let tx = self
            .rpc
            .get_transaction_with_config(
                sig,
                RpcTransactionConfig {
                    encoding: Some(UiTransactionEncoding::Json),
                    commitment: Some(CommitmentConfig::confirmed()),
                    max_supported_transaction_version: Some(0),
                },
            )
            .await
            .map_err(classify_client_error)?;
        flatten_balances(tx)
    }

    /// Subscribe to program account changes over the websocket endpoint and
    /// publish them as volumeUpdate envelopes. Reconnects with doubling
    /// backoff until shutdown flips.
    pub async fn watch_program_accounts(
        &self,
        program_id: &str,
        hub: broadcast::Sender<StreamEnvelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let program = Pubkey::from_str(program_id)
            .map_err(|e| IndexerError::Decode(format!("bad program id {program_id}: {e}")))?;

        let mut backoff_ms: u64 = 1_000;
        let max_backoff_ms: u64 = 30_000;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match self.subscribe_once(&program, &hub, &mut shutdown).await {
                Ok(()) => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                    backoff_ms = 1_000;
                    tracing::info!("program subscription closed, resubscribing");
                }
                Err(e) => {
                    tracing::error!("program subscription error: {e}");
                    tracing::warn!("reconnecting websocket in {}ms", backoff_ms);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff_ms)) => {}
                        _ = shutdown.changed() => return Ok(()),
                    }
                    backoff_ms = (backoff_ms * 2).min(max_backoff_ms);
                }
            }
        }
    }

    async fn subscribe_once(
        &self,
        program: &Pubkey,
        hub: &broadcast::Sender<StreamEnvelope>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let pubsub = PubsubClient::new(&self.config.ws_url)
            .await
            .map_err(|e| IndexerError::Rpc(e.to_string()))?;
        let config = RpcProgramAccountsConfig {
            account_config: RpcAccountInfoConfig {
                commitment: Some(CommitmentConfig::confirmed()),
                ..Default::default()
            },
            ..Default::default()
        };
        let (mut stream, unsubscribe) = pubsub
            .program_subscribe(program, Some(config))
            .await
            .map_err(|e| IndexerError::Rpc(e.to_string()))?;
        tracing::info!(%program, "subscribed to program account updates");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                update = stream.next() => {
                    let Some(update) = update else { break };
                    let envelope = StreamEnvelope::now(
                        StreamEventType::VolumeUpdate,
                        json!({
                            "account": update.value.pubkey,
                            "lamports": update.value.account.lamports,
                            "slot": update.context.slot,
                        }),
                    );
                    let _ = hub.send(envelope);
                }
            }
        }

        drop(stream);
        unsubscribe().await;
        Ok(())
    }
}

#[async_trait]
impl TransactionFetch for NetworkClient {
    async fn fetch_balances(&self, signature: &str) -> Result<TransactionBalances> {
        self.get_transaction_balances(signature).await
    }
}

fn classify_client_error(e: ClientError) -> IndexerError {
    if let ClientErrorKind::Reqwest(req) = e.kind() {
        if req.status().map(|s| s.as_u16()) == Some(429) {
            return IndexerError::RateLimited {
                retry_after_ms: None,
            };
        }
    }
    IndexerError::Rpc(e.to_string())
}

fn flatten_balances(tx: EncodedConfirmedTransactionWithStatusMeta) -> Result<TransactionBalances> {
    let inner = tx.transaction;
    let meta = inner
        .meta
        .ok_or_else(|| IndexerError::Rpc("transaction meta missing".to_string()))?;

    let mut account_keys = match inner.transaction {
        EncodedTransaction::Json(ui) => match ui.message {
            UiMessage::Raw(raw) => raw.account_keys,
            UiMessage::Parsed(parsed) => {
                parsed.account_keys.into_iter().map(|a| a.pubkey).collect()
            }
        },
        _ => {
            return Err(IndexerError::Rpc(
                "unsupported transaction encoding".to_string(),
            ))
        }
    };
    // Loaded addresses follow the static keys, writable first, matching the
    // pre/post balance array order.
    if let OptionSerializer::Some(loaded) = meta.loaded_addresses {
        account_keys.extend(loaded.writable);
        account_keys.extend(loaded.readonly);
    }

    Ok(TransactionBalances {
        account_keys,
        pre_balances: meta.pre_balances,
        post_balances: meta.post_balances,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_sdk::message::MessageHeader;
    use solana_transaction_status::{
        EncodedTransactionWithStatusMeta, UiLoadedAddresses, UiRawMessage, UiTransaction,
        UiTransactionStatusMeta,
    };

    #[allow(deprecated)]
    fn meta(
        pre: Vec<u64>,
        post: Vec<u64>,
        loaded: Option<UiLoadedAddresses>,
    ) -> UiTransactionStatusMeta {
        UiTransactionStatusMeta {
            err: None,
            status: Ok(()),
            fee: 5_000,
            pre_balances: pre,
            post_balances: post,
            inner_instructions: OptionSerializer::None,
            log_messages: OptionSerializer::None,
            pre_token_balances: OptionSerializer::None,
            post_token_balances: OptionSerializer::None,
            rewards: OptionSerializer::None,
            loaded_addresses: match loaded {
                Some(l) => OptionSerializer::Some(l),
                None => OptionSerializer::None,
            },
            return_data: OptionSerializer::Skip,
            compute_units_consumed: OptionSerializer::Skip,
        }
    }

    fn confirmed(
        keys: Vec<&str>,
        meta: UiTransactionStatusMeta,
    ) -> EncodedConfirmedTransactionWithStatusMeta {
        EncodedConfirmedTransactionWithStatusMeta {
            slot: 1,
            transaction: EncodedTransactionWithStatusMeta {
                transaction: EncodedTransaction::Json(UiTransaction {
                    signatures: vec!["sig".to_string()],
                    message: UiMessage::Raw(UiRawMessage {
                        header: MessageHeader::default(),
                        account_keys: keys.iter().map(|k| k.to_string()).collect(),
                        recent_blockhash: String::new(),
                        instructions: vec![],
                        address_table_lookups: None,
                    }),
                }),
                meta: Some(meta),
                version: None,
            },
            block_time: Some(1_700_000_000),
        }
    }

    #[test]
    fn test_flatten_static_keys() {
        let tx = confirmed(
            vec!["seller", "escrow"],
            meta(vec![10, 20], vec![10, 15], None),
        );
        let balances = flatten_balances(tx).unwrap();
        assert_eq!(balances.account_keys, vec!["seller", "escrow"]);
        assert_eq!(balances.pre_balances, vec![10, 20]);
        assert_eq!(balances.post_balances, vec![10, 15]);
    }

    #[test]
    fn test_flatten_appends_loaded_addresses() {
        let loaded = UiLoadedAddresses {
            writable: vec!["loaded_w".to_string()],
            readonly: vec!["loaded_r".to_string()],
        };
        let tx = confirmed(
            vec!["seller", "escrow"],
            meta(vec![1, 2, 3, 4], vec![1, 2, 3, 4], Some(loaded)),
        );
        let balances = flatten_balances(tx).unwrap();
        assert_eq!(
            balances.account_keys,
            vec!["seller", "escrow", "loaded_w", "loaded_r"]
        );
    }

    #[test]
    fn test_flatten_requires_meta() {
        let mut tx = confirmed(vec!["a"], meta(vec![1], vec![1], None));
        tx.transaction.meta = None;
        assert!(matches!(
            flatten_balances(tx),
            Err(IndexerError::Rpc(msg)) if msg.contains("meta")
        ));
    }

    #[test]
    fn test_flatten_rejects_binary_encoding() {
        let mut tx = confirmed(vec!["a"], meta(vec![1], vec![1], None));
        tx.transaction.transaction =
            EncodedTransaction::LegacyBinary("AAAA".to_string());
        assert!(matches!(
            flatten_balances(tx),
            Err(IndexerError::Rpc(msg)) if msg.contains("encoding")
        ));
    }

    #[test]
    fn test_classify_client_error_defaults_to_rpc() {
        let err = ClientError::from(ClientErrorKind::Custom("node timeout".to_string()));
        let classified = classify_client_error(err);
        assert!(matches!(classified, IndexerError::Rpc(_)));
        assert!(classified.is_retryable());
    }
}
