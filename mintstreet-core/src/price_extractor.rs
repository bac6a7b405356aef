// Price reconstruction for marketplace trades. Mint prices come from the
// native transfers already present in the enhanced envelope; sell prices need
// a second RPC fetch to diff the escrow's pre/post balances. Both paths share
// one explicitly constructed cache so repeated lookups cost no network calls.

use crate::config::{PriceConfig, TransferSelection};
use crate::error::Result;
use crate::models::{EnhancedTransaction, TransactionBalances};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Most recent resolved price for an escrow, with the signature it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscrowPrice {
    pub price_lamports: u64,
    pub signature: String,
}

/// Resolved prices keyed by signature and by escrow address. Shared by the
/// mint and sell extraction paths.
#[derive(Default)]
pub struct PriceCache {
    by_signature: RwLock<HashMap<String, u64>>,
    by_escrow: RwLock<HashMap<String, EscrowPrice>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn price_for_signature(&self, signature: &str) -> Option<u64> {
        self.by_signature.read().await.get(signature).copied()
    }

    pub async fn price_for_escrow(&self, escrow: &str) -> Option<EscrowPrice> {
        self.by_escrow.read().await.get(escrow).cloned()
    }

    pub async fn record(&self, signature: &str, escrow: Option<&str>, price_lamports: u64) {
        self.by_signature
            .write()
            .await
            .insert(signature.to_string(), price_lamports);
        if let Some(escrow) = escrow {
            self.by_escrow.write().await.insert(
                escrow.to_string(),
                EscrowPrice {
                    price_lamports,
                    signature: signature.to_string(),
                },
            );
        }
    }

    pub async fn len(&self) -> usize {
        self.by_signature.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.by_signature.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.by_signature.write().await.clear();
        self.by_escrow.write().await.clear();
    }
}

/// Balance view of one confirmed transaction. The RPC client implements
/// this; tests substitute a scripted fetcher.
#[async_trait]
pub trait TransactionFetch: Send + Sync {
    async fn fetch_balances(&self, signature: &str) -> Result<TransactionBalances>;
}

fn payer_to_escrow_amounts<'a>(
    tx: &'a EnhancedTransaction,
    fee_payer: &'a str,
    escrow: &'a str,
) -> impl Iterator<Item = u64> + 'a {
    tx.native_transfers
        .iter()
        .filter(move |t| t.from_user_account == fee_payer && t.to_user_account == escrow)
        .map(|t| t.amount)
}

/// Mint price: the selected native SOL transfer from the fee payer to the
/// escrow, in lamports. No matching transfer (or a zero amount) means the
/// price stays unknown rather than guessed.
pub async fn extract_mint_price(
    tx: &EnhancedTransaction,
    fee_payer: &str,
    escrow: &str,
    cfg: &PriceConfig,
    cache: &PriceCache,
) -> Option<u64> {
    if let Some(price) = cache.price_for_signature(&tx.signature).await {
        return Some(price);
    }

    let selected = match cfg.transfer_selection {
        TransferSelection::Largest => payer_to_escrow_amounts(tx, fee_payer, escrow).max(),
        TransferSelection::First => payer_to_escrow_amounts(tx, fee_payer, escrow).next(),
    };
    let amount = selected.filter(|a| *a > 0)?;

    cache.record(&tx.signature, Some(escrow), amount).await;
    Some(amount)
}

/// Sell price: fetch the transaction and diff the escrow balance. The escrow
/// pays the seller, so the payout is `pre - post`. Deltas below the dust
/// threshold are fee noise, not a price.
pub async fn extract_sell_price(
    signature: &str,
    escrow: &str,
    fetcher: &dyn TransactionFetch,
    cfg: &PriceConfig,
    cache: &PriceCache,
) -> Result<Option<u64>> {
    if let Some(price) = cache.price_for_signature(signature).await {
        return Ok(Some(price));
    }

    let balances = fetcher.fetch_balances(signature).await?;
    let Some(idx) = balances.account_keys.iter().position(|k| k == escrow) else {
        tracing::debug!(signature, escrow, "escrow not in transaction accounts");
        return Ok(None);
    };
    let (Some(pre), Some(post)) = (
        balances.pre_balances.get(idx),
        balances.post_balances.get(idx),
    ) else {
        return Ok(None);
    };

    let delta = pre.saturating_sub(*post);
    if delta < cfg.dust_threshold_lamports {
        return Ok(None);
    }

    cache.record(signature, Some(escrow), delta).await;
    Ok(Some(delta))
}
