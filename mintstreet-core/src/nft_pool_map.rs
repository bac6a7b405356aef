// NFT-to-pool resolution for wallet views. Cached mint records answer
// first; mints the history cache has never seen fall back to bounded
// per-mint history lookups. A resolved mapping persists per wallet, keyed
// by a fingerprint of the mint list, so reloading an unchanged wallet
// costs no lookups. Long resolutions abort cooperatively through a watch
// signal.

use crate::config::MappingConfig;
use crate::error::{IndexerError, Result};
use crate::helius_client::HistorySource;
use crate::instruction_parser::decode_transaction;
use crate::models::{HistoryItem, MarketInstruction, RecordSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;

pub const MAPPING_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct MappingFile {
    version: u32,
    wallet: String,
    fingerprint: String,
    mapping: HashMap<String, String>,
    saved_at: DateTime<Utc>,
}

pub struct NftPoolMapper {
    cfg: MappingConfig,
    program_address: String,
    source: Arc<dyn HistorySource>,
}

impl NftPoolMapper {
    pub fn new(cfg: MappingConfig, program_address: String, source: Arc<dyn HistorySource>) -> Self {
        Self {
            cfg,
            program_address,
            source,
        }
    }

    /// Order-insensitive fingerprint of a mint list. The wallet cache is
    /// valid only while the wallet holds exactly this set.
    pub fn fingerprint(mints: &[String]) -> String {
        let mut sorted: Vec<&str> = mints.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        let mut hasher = Sha256::new();
        for mint in sorted {
            hasher.update(mint.as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    fn cache_path(&self, wallet: &str) -> Option<PathBuf> {
        self.cfg
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("nft-pools-{wallet}.json")))
    }

    fn load_cached(&self, wallet: &str, fingerprint: &str) -> Option<HashMap<String, String>> {
        let path = self.cache_path(wallet)?;
        let raw = std::fs::read(&path).ok()?;
        let file: MappingFile = serde_json::from_slice(&raw).ok()?;
        (file.version == MAPPING_VERSION
            && file.wallet == wallet
            && file.fingerprint == fingerprint)
            .then_some(file.mapping)
    }

    fn store(&self, wallet: &str, fingerprint: &str, mapping: &HashMap<String, String>) {
        let Some(path) = self.cache_path(wallet) else {
            return;
        };
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        let file = MappingFile {
            version: MAPPING_VERSION,
            wallet: wallet.to_string(),
            fingerprint: fingerprint.to_string(),
            mapping: mapping.clone(),
            saved_at: Utc::now(),
        };
        match serde_json::to_vec(&file) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(wallet, "nft-pool cache write failed: {e}");
                }
            }
            Err(e) => tracing::warn!(wallet, "nft-pool cache serialize failed: {e}"),
        }
    }

    /// Map each of the wallet's mints to the pool that minted it. Mints
    /// nothing minted (foreign NFTs) are absent from the result. A raised
    /// cancel signal aborts the whole resolution with `Cancelled`.
    pub async fn resolve(
        &self,
        wallet: &str,
        mints: &[String],
        records: &[HistoryItem],
        cancel: &watch::Receiver<bool>,
    ) -> Result<HashMap<String, String>> {
        let fingerprint = Self::fingerprint(mints);
        if let Some(cached) = self.load_cached(wallet, &fingerprint) {
            tracing::debug!(wallet, entries = cached.len(), "nft-pool mapping cache hit");
            return Ok(cached);
        }

        let wanted: HashSet<&str> = mints.iter().map(String::as_str).collect();
        let mut mapping: HashMap<String, String> = HashMap::new();
        for record in records {
            if !matches!(record.instruction, MarketInstruction::MintNft { .. }) {
                continue;
            }
            let (Some(mint), Some(pool)) = (record.nft_mint.as_deref(), record.pool.as_deref())
            else {
                continue;
            };
            if wanted.contains(mint) {
                mapping.entry(mint.to_string()).or_insert_with(|| pool.to_string());
            }
        }

        for mint in mints {
            if mapping.contains_key(mint) {
                continue;
            }
            if *cancel.borrow() {
                return Err(IndexerError::Cancelled);
            }
            match self.lookup_mint(mint, cancel).await {
                Ok(Some(pool)) => {
                    mapping.insert(mint.clone(), pool);
                }
                Ok(None) => {}
                Err(IndexerError::Cancelled) => return Err(IndexerError::Cancelled),
                // One stubborn mint must not sink the rest of the wallet.
                Err(e) => tracing::warn!(%mint, "mint history lookup failed: {e}"),
            }
        }

        self.store(wallet, &fingerprint, &mapping);
        Ok(mapping)
    }

    /// Walk the mint's own transaction history for the instruction that
    /// minted it. Bounded pages; exhausting them maps the mint to nothing.
    async fn lookup_mint(
        &self,
        mint: &str,
        cancel: &watch::Receiver<bool>,
    ) -> Result<Option<String>> {
        let mut before: Option<String> = None;
        for _ in 0..self.cfg.max_pages_per_mint {
            if *cancel.borrow() {
                return Err(IndexerError::Cancelled);
            }
            let page = self
                .source
                .fetch_page(mint, self.cfg.page_limit, before.as_deref())
                .await?;
            if page.is_empty() {
                return Ok(None);
            }
            for envelope in &page {
                let item = decode_transaction(&self.program_address, envelope, RecordSource::Poll);
                if matches!(item.instruction, MarketInstruction::MintNft { .. })
                    && item.nft_mint.as_deref() == Some(mint)
                {
                    return Ok(item.pool);
                }
            }
            if page.len() < self.cfg.page_limit {
                return Ok(None);
            }
            before = page.last().map(|t| t.signature.clone());
        }
        Ok(None)
    }
}
