// Transaction-history service: owns the deduplicated record cache and
// drives the three ingestion paths into it, backward pagination
// (`load_more`), newest-page polling (`poll_newest`) and push deliveries
// (`apply_live`). Mint prices resolve synchronously from the envelope;
// sell prices resolve later through `backfill_sell_prices`.

use crate::cache::{HistoryCache, MergeOutcome};
use crate::config::{BackfillConfig, CacheConfig, PriceConfig};
use crate::error::Result;
use crate::helius_client::HistorySource;
use crate::instruction_parser::decode_transaction;
use crate::models::{EnhancedTransaction, HistoryItem, MarketInstruction, RecordSource};
use crate::price_extractor::{
    extract_mint_price, extract_sell_price, PriceCache, TransactionFetch,
};
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Result of one backward-pagination step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    /// Envelopes the page returned.
    pub fetched: usize,
    /// Records inserted for the first time.
    pub fresh: usize,
    pub can_load_more: bool,
}

/// Result of one sell-price backfill sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillOutcome {
    pub scanned: usize,
    pub resolved: usize,
    /// Sell records with no escrow account; marked attempted and skipped.
    pub unresolvable: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub pages_fetched: u64,
    pub records_decoded: u64,
    pub prices_resolved: u64,
    pub live_events_applied: u64,
    pub cached_records: usize,
    pub seen_signatures: usize,
    pub price_cache_entries: usize,
    pub can_load_more: bool,
}

/// One page of history as served to API clients.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryPage {
    pub items: Vec<HistoryItem>,
    pub can_load_more: bool,
}

#[derive(Default)]
struct Counters {
    pages_fetched: AtomicU64,
    records_decoded: AtomicU64,
    prices_resolved: AtomicU64,
    live_events_applied: AtomicU64,
}

pub struct HistoryService {
    program_address: String,
    page_limit: usize,
    price_cfg: PriceConfig,
    backfill_cfg: BackfillConfig,
    source: Arc<dyn HistorySource>,
    cache: RwLock<HistoryCache>,
    price_cache: PriceCache,
    /// Signature of the oldest envelope any page returned; the `before`
    /// cursor for the next page.
    cursor: RwLock<Option<String>>,
    /// Serializes pagination so concurrent read-throughs cannot fetch the
    /// same page twice and mis-latch the exhaustion flag.
    load_lock: Mutex<()>,
    can_load_more: AtomicBool,
    counters: Counters,
}

impl HistoryService {
    pub fn new(
        program_address: String,
        page_limit: usize,
        cache_cfg: &CacheConfig,
        price_cfg: PriceConfig,
        backfill_cfg: BackfillConfig,
        source: Arc<dyn HistorySource>,
    ) -> Self {
        let cache = HistoryCache::load(cache_cfg);
        // After a warm start, pagination resumes behind the snapshot.
        let cursor = cache.oldest_signature();
        Self {
            program_address,
            page_limit: page_limit.max(1),
            price_cfg,
            backfill_cfg,
            source,
            cache: RwLock::new(cache),
            price_cache: PriceCache::new(),
            cursor: RwLock::new(cursor),
            load_lock: Mutex::new(()),
            can_load_more: AtomicBool::new(true),
            counters: Counters::default(),
        }
    }

    pub fn program_address(&self) -> &str {
        &self.program_address
    }

    pub fn can_load_more(&self) -> bool {
        self.can_load_more.load(Ordering::Relaxed)
    }

    /// Fetch the next page older than the pagination cursor and merge it.
    /// Exhaustion latches: a short page or a page with nothing unseen turns
    /// `can_load_more` off until `clear`.
    pub async fn load_more(&self) -> Result<LoadOutcome> {
        let _guard = self.load_lock.lock().await;
        if !self.can_load_more() {
            return Ok(LoadOutcome {
                fetched: 0,
                fresh: 0,
                can_load_more: false,
            });
        }

        let before = self.cursor.read().await.clone();
        let page = self
            .source
            .fetch_page(&self.program_address, self.page_limit, before.as_deref())
            .await?;
        self.counters.pages_fetched.fetch_add(1, Ordering::Relaxed);

        let fetched = page.len();
        if let Some(last) = page.last() {
            *self.cursor.write().await = Some(last.signature.clone());
        }

        let fresh = self.ingest(&page, RecordSource::Poll).await.len();
        if fetched < self.page_limit || fresh == 0 {
            self.can_load_more.store(false, Ordering::Relaxed);
            tracing::debug!(fetched, fresh, "history exhausted, load-more disabled");
        }

        Ok(LoadOutcome {
            fetched,
            fresh,
            can_load_more: self.can_load_more(),
        })
    }

    /// Fetch the newest page (no cursor) and merge anything unseen. Returns
    /// the records inserted for the first time, for event fanout.
    pub async fn poll_newest(&self) -> Result<Vec<HistoryItem>> {
        let page = self
            .source
            .fetch_page(&self.program_address, self.page_limit, None)
            .await?;
        self.counters.pages_fetched.fetch_add(1, Ordering::Relaxed);
        Ok(self.ingest(&page, RecordSource::Poll).await)
    }

    /// Merge push-delivered envelopes (webhook or SSE overlay). Unlike the
    /// poll path every envelope is decoded and offered to the cache, so a
    /// newer observation of a known signature supersedes it; the seen-set
    /// still blocks resurrecting evicted records. Returns first-time inserts.
    pub async fn apply_live(&self, envelopes: &[EnhancedTransaction]) -> Vec<HistoryItem> {
        self.ingest(envelopes, RecordSource::Push).await
    }

    async fn ingest(&self, envelopes: &[EnhancedTransaction], source: RecordSource) -> Vec<HistoryItem> {
        let candidates: Vec<&EnhancedTransaction> = if source == RecordSource::Poll {
            let cache = self.cache.read().await;
            envelopes
                .iter()
                .filter(|e| !cache.is_seen(&e.signature))
                .collect()
        } else {
            envelopes.iter().collect()
        };
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut decoded = Vec::with_capacity(candidates.len());
        for envelope in candidates {
            decoded.push(self.decode_and_price(envelope, source).await);
        }
        self.counters
            .records_decoded
            .fetch_add(decoded.len() as u64, Ordering::Relaxed);

        let mut fresh = Vec::new();
        let mut applied: u64 = 0;
        {
            let mut cache = self.cache.write().await;
            for item in decoded {
                match cache.merge(item.clone()) {
                    MergeOutcome::Inserted => {
                        applied += 1;
                        fresh.push(item);
                    }
                    MergeOutcome::Superseded => applied += 1,
                    MergeOutcome::Duplicate => {}
                }
            }
            cache.maintain(Utc::now());
            if let Err(e) = cache.persist() {
                tracing::warn!("history snapshot persist failed: {e}");
            }
        }

        if source == RecordSource::Push {
            self.counters
                .live_events_applied
                .fetch_add(applied, Ordering::Relaxed);
        }
        fresh
    }

    async fn decode_and_price(&self, envelope: &EnhancedTransaction, source: RecordSource) -> HistoryItem {
        let mut item = decode_transaction(&self.program_address, envelope, source);
        if let MarketInstruction::MintNft { .. } = item.instruction {
            // The mint envelope carries its own transfers; price now, once.
            item.price_load_attempted = true;
            if let Some(escrow) = item.escrow.clone() {
                let price = extract_mint_price(
                    envelope,
                    &item.fee_payer,
                    &escrow,
                    &self.price_cfg,
                    &self.price_cache,
                )
                .await;
                item.price_load_succeeded = price.is_some();
                item.price_lamports = price;
                if price.is_some() {
                    self.counters.prices_resolved.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        item
    }

    /// Resolve prices for sell records that never had an attempt, in fixed
    /// batches with a pause between them. Every scanned record comes out
    /// with `price_load_attempted` set, lookup failures included, so a
    /// record is priced at most once.
    pub async fn backfill_sell_prices(&self, fetcher: &dyn TransactionFetch) -> BackfillOutcome {
        let (pending, unresolvable) = {
            let cache = self.cache.read().await;
            let mut pending: Vec<(String, String)> = Vec::new();
            let mut unresolvable: Vec<String> = Vec::new();
            for item in cache.iter() {
                if !matches!(item.instruction, MarketInstruction::SellNft)
                    || item.price_load_attempted
                {
                    continue;
                }
                match &item.escrow {
                    Some(escrow) => pending.push((item.signature.clone(), escrow.clone())),
                    None => unresolvable.push(item.signature.clone()),
                }
            }
            (pending, unresolvable)
        };

        if !unresolvable.is_empty() {
            let mut cache = self.cache.write().await;
            for signature in &unresolvable {
                cache.mark_price_attempt(signature, None);
            }
        }

        let scanned = pending.len() + unresolvable.len();
        let mut resolved = 0usize;
        let delay = Duration::from_millis(self.backfill_cfg.inter_batch_delay_ms);
        let batch_size = self.backfill_cfg.batch_size.max(1);

        for (i, batch) in pending.chunks(batch_size).enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            for (signature, escrow) in batch {
                let price = match extract_sell_price(
                    signature,
                    escrow,
                    fetcher,
                    &self.price_cfg,
                    &self.price_cache,
                )
                .await
                {
                    Ok(price) => price,
                    Err(e) => {
                        tracing::warn!(%signature, "sell price lookup failed: {e}");
                        None
                    }
                };
                if price.is_some() {
                    resolved += 1;
                    self.counters.prices_resolved.fetch_add(1, Ordering::Relaxed);
                }
                self.cache.write().await.mark_price_attempt(signature, price);
            }
        }

        if scanned > 0 {
            if let Err(e) = self.cache.read().await.persist() {
                tracing::warn!("history snapshot persist failed: {e}");
            }
            tracing::info!(scanned, resolved, "sell price backfill pass done");
        }

        BackfillOutcome {
            scanned,
            resolved,
            unresolvable: unresolvable.len(),
        }
    }

    /// One page of records for the API, newest first. When the cache cannot
    /// fill the page and history is not exhausted, one more page is pulled
    /// from the source before answering.
    pub async fn history_page(&self, limit: usize, before: Option<&str>) -> Result<HistoryPage> {
        let mut items = self.page_from_cache(limit, before).await;
        if items.len() < limit && self.can_load_more() {
            self.load_more().await?;
            items = self.page_from_cache(limit, before).await;
        }
        Ok(HistoryPage {
            items,
            can_load_more: self.can_load_more(),
        })
    }

    async fn page_from_cache(&self, limit: usize, before: Option<&str>) -> Vec<HistoryItem> {
        let cache = self.cache.read().await;
        let ordered = cache.records_newest_first();
        let start = match before {
            Some(signature) => ordered
                .iter()
                .position(|r| r.signature == signature)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => 0,
        };
        ordered.into_iter().skip(start).take(limit).cloned().collect()
    }

    /// Every cached record, newest first. The aggregate views (pools,
    /// metrics, candles) fold over this.
    pub async fn records_snapshot(&self) -> Vec<HistoryItem> {
        self.cache
            .read()
            .await
            .records_newest_first()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> ServiceStats {
        let cache = self.cache.read().await;
        ServiceStats {
            pages_fetched: self.counters.pages_fetched.load(Ordering::Relaxed),
            records_decoded: self.counters.records_decoded.load(Ordering::Relaxed),
            prices_resolved: self.counters.prices_resolved.load(Ordering::Relaxed),
            live_events_applied: self.counters.live_events_applied.load(Ordering::Relaxed),
            cached_records: cache.len(),
            seen_signatures: cache.seen_len(),
            price_cache_entries: self.price_cache.len().await,
            can_load_more: self.can_load_more(),
        }
    }

    /// Drop all cached state (snapshot file included) and re-arm pagination.
    pub async fn clear(&self) -> Result<()> {
        self.cache.write().await.clear()?;
        self.price_cache.clear().await;
        *self.cursor.write().await = None;
        self.can_load_more.store(true, Ordering::Relaxed);
        tracing::info!("history cache cleared, pagination re-armed");
        Ok(())
    }
}
