// Bounded, deduplicated store of history records keyed by signature, with a
// parallel seen-signature set. Poll and push paths merge into this one map;
// conflicts resolve last-write-wins by observation time. A JSON snapshot on
// disk warm-starts the process.
//
// Age rules:
// - size eviction removes exactly the excess, oldest by chain time first,
//   and leaves the signatures in the seen-set so old pages stay deduped;
// - TTL sweeps remove expired entries from both the map and the seen-set,
//   so a record can legitimately return after it ages out.

use crate::config::CacheConfig;
use crate::error::Result;
use crate::models::HistoryItem;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    seen: Vec<String>,
    records: Vec<HistoryItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Superseded,
    Duplicate,
}

pub struct HistoryCache {
    records: HashMap<String, HistoryItem>,
    seen: HashSet<String>,
    max_size: usize,
    ttl: Duration,
    snapshot_path: Option<PathBuf>,
}

impl HistoryCache {
    pub fn new(cfg: &CacheConfig) -> Self {
        Self {
            records: HashMap::new(),
            seen: HashSet::new(),
            max_size: cfg.max_size.max(1),
            ttl: Duration::seconds(cfg.ttl_secs.min(i64::MAX as u64) as i64),
            snapshot_path: cfg.snapshot_path.clone(),
        }
    }

    /// Warm-start from the snapshot file when one exists. Missing, corrupt,
    /// or version-mismatched snapshots start an empty cache with a warning;
    /// a bad snapshot must never keep the indexer down.
    pub fn load(cfg: &CacheConfig) -> Self {
        let mut cache = Self::new(cfg);
        if let Some(path) = cache.snapshot_path.clone() {
            match read_snapshot(&path) {
                Ok(Some(snap)) if snap.version == SNAPSHOT_VERSION => {
                    cache.seen.extend(snap.seen);
                    for item in snap.records {
                        cache.seen.insert(item.signature.clone());
                        cache.records.insert(item.signature.clone(), item);
                    }
                    tracing::info!(
                        records = cache.records.len(),
                        seen = cache.seen.len(),
                        "warm-started history cache from {}",
                        path.display()
                    );
                }
                Ok(Some(snap)) => {
                    tracing::warn!(
                        found = snap.version,
                        expected = SNAPSHOT_VERSION,
                        "snapshot version mismatch, starting empty"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("unreadable snapshot {}: {e}, starting empty", path.display());
                }
            }
        }
        cache.sweep_expired(Utc::now());
        cache
    }

    /// Merge one record. Unseen signatures insert; a known signature is
    /// replaced only by a newer observation (provenance follows the winner).
    /// A resolved price survives the replacement when the newer copy has
    /// none; price resolution is a separate, slower path.
    pub fn merge(&mut self, item: HistoryItem) -> MergeOutcome {
        if let Some(existing) = self.records.get(&item.signature) {
            if item.observed_at > existing.observed_at {
                let mut incoming = item;
                if incoming.price_lamports.is_none() && existing.price_lamports.is_some() {
                    incoming.price_lamports = existing.price_lamports;
                    incoming.price_load_attempted = existing.price_load_attempted;
                    incoming.price_load_succeeded = existing.price_load_succeeded;
                }
                self.records.insert(incoming.signature.clone(), incoming);
                MergeOutcome::Superseded
            } else {
                MergeOutcome::Duplicate
            }
        } else if self.seen.contains(&item.signature) {
            // Evicted earlier; old pages must not re-grow the cache.
            MergeOutcome::Duplicate
        } else {
            self.seen.insert(item.signature.clone());
            self.records.insert(item.signature.clone(), item);
            MergeOutcome::Inserted
        }
    }

    /// In-place price resolution result. Always marks the attempt; fills the
    /// price and the success flag only when one was found.
    pub fn mark_price_attempt(&mut self, signature: &str, price_lamports: Option<u64>) -> bool {
        match self.records.get_mut(signature) {
            Some(rec) => {
                rec.price_load_attempted = true;
                if let Some(p) = price_lamports {
                    rec.price_lamports = Some(p);
                    rec.price_load_succeeded = true;
                }
                true
            }
            None => false,
        }
    }

    pub fn is_seen(&self, signature: &str) -> bool {
        self.seen.contains(signature)
    }

    pub fn get(&self, signature: &str) -> Option<&HistoryItem> {
        self.records.get(signature)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryItem> {
        self.records.values()
    }

    /// Records sorted newest-first by chain time (observation time for
    /// records without one); signature breaks ties for a stable order.
    pub fn records_newest_first(&self) -> Vec<&HistoryItem> {
        let mut all: Vec<&HistoryItem> = self.records.values().collect();
        all.sort_by(|a, b| {
            b.age_basis()
                .cmp(&a.age_basis())
                .then_with(|| b.signature.cmp(&a.signature))
        });
        all
    }

    /// Signature of the oldest record, the resume cursor after a warm start.
    pub fn oldest_signature(&self) -> Option<String> {
        self.records
            .values()
            .min_by(|a, b| {
                a.age_basis()
                    .cmp(&b.age_basis())
                    .then_with(|| a.signature.cmp(&b.signature))
            })
            .map(|r| r.signature.clone())
    }

    /// Drop entries older than the TTL from the map and the seen-set.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.ttl;
        let expired: Vec<String> = self
            .records
            .values()
            .filter(|r| r.age_basis() < cutoff)
            .map(|r| r.signature.clone())
            .collect();
        for sig in &expired {
            self.records.remove(sig);
            self.seen.remove(sig);
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "swept expired history records");
        }
        expired.len()
    }

    /// Remove exactly the excess over `max_size`, oldest by chain time
    /// first. Evicted signatures remain in the seen-set.
    pub fn evict_over_capacity(&mut self) -> usize {
        if self.records.len() <= self.max_size {
            return 0;
        }
        let excess = self.records.len() - self.max_size;
        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .records
            .values()
            .map(|r| (r.age_basis(), r.signature.clone()))
            .collect();
        by_age.sort();
        for (_, sig) in by_age.into_iter().take(excess) {
            self.records.remove(&sig);
        }
        tracing::debug!(count = excess, "evicted oldest history records");
        excess
    }

    /// Housekeeping run after each mutation batch.
    pub fn maintain(&mut self, now: DateTime<Utc>) -> (usize, usize) {
        let expired = self.sweep_expired(now);
        let evicted = self.evict_over_capacity();
        (expired, evicted)
    }

    /// Write the snapshot file via a temp-file rename. No-op without a
    /// configured path.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut seen: Vec<String> = self.seen.iter().cloned().collect();
        seen.sort();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            seen,
            records: self.records.values().cloned().collect(),
        };

        let tmp = path.with_extension("tmp");
        {
            let file = fs::File::create(&tmp)?;
            serde_json::to_writer(BufWriter::new(file), &snapshot)?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Wipe records, the seen-set, and the snapshot file.
    pub fn clear(&mut self) -> Result<()> {
        self.records.clear();
        self.seen.clear();
        if let Some(path) = &self.snapshot_path {
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = fs::File::open(path)?;
    let snapshot = serde_json::from_reader(BufReader::new(file))?;
    Ok(Some(snapshot))
}
