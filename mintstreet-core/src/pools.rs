// Aggregate views derived from the history cache: pools, collections,
// rolling 24h pool metrics, and per-pool NFT grids. Everything here is a
// pure fold over records so a recompute is always consistent with the
// cache contents at the time of the call.

use crate::models::{Collection, HistoryItem, MarketInstruction, NftGridItem, Pool, PoolMetrics};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};

/// Window over which volume, trade count and trader counts roll.
pub const METRICS_WINDOW_HOURS: i64 = 24;

fn pool_from_record(item: &HistoryItem) -> Option<Pool> {
    let MarketInstruction::CreatePool {
        base_price_lamports,
        growth_factor_bps,
    } = item.instruction
    else {
        return None;
    };
    Some(Pool {
        address: item.pool.clone()?,
        creator: item.fee_payer.clone(),
        escrow: item.escrow.clone(),
        base_price_lamports,
        growth_factor_bps,
        collection: None,
        created_at: item.age_basis(),
        signature: item.signature.clone(),
    })
}

fn collection_from_record(item: &HistoryItem) -> Option<Collection> {
    let MarketInstruction::CreateCollectionNft { name, symbol, uri } = &item.instruction else {
        return None;
    };
    Some(Collection {
        address: item.nft_mint.clone()?,
        pool: item.pool.clone(),
        name: name.clone(),
        symbol: symbol.clone(),
        uri: uri.clone(),
        created_at: item.age_basis(),
        signature: item.signature.clone(),
    })
}

/// All pools found in the records, newest first. Replays of the same pool
/// address apply oldest-to-newest so the latest observation wins, and each
/// pool picks up its collection mint when one was created for it.
pub fn collect_pools(records: &[&HistoryItem]) -> Vec<Pool> {
    let mut ordered: Vec<&HistoryItem> = records.to_vec();
    ordered.sort_by_key(|r| r.age_basis());

    let mut by_address: HashMap<String, Pool> = HashMap::new();
    for item in &ordered {
        if let Some(pool) = pool_from_record(item) {
            by_address.insert(pool.address.clone(), pool);
        }
    }
    for item in &ordered {
        if let Some(collection) = collection_from_record(item) {
            if let Some(pool_addr) = &collection.pool {
                if let Some(pool) = by_address.get_mut(pool_addr) {
                    pool.collection = Some(collection.address.clone());
                }
            }
        }
    }

    let mut pools: Vec<Pool> = by_address.into_values().collect();
    pools.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.address.cmp(&a.address)));
    pools
}

/// All collection NFTs found in the records, newest first.
pub fn collect_collections(records: &[&HistoryItem]) -> Vec<Collection> {
    let mut ordered: Vec<&HistoryItem> = records.to_vec();
    ordered.sort_by_key(|r| r.age_basis());

    let mut by_address: HashMap<String, Collection> = HashMap::new();
    for item in &ordered {
        if let Some(collection) = collection_from_record(item) {
            by_address.insert(collection.address.clone(), collection);
        }
    }

    let mut collections: Vec<Collection> = by_address.into_values().collect();
    collections.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.address.cmp(&a.address)));
    collections
}

/// Rolling metrics for one pool, recomputed from scratch on every call.
/// Volume and counts cover trades (mints and sells) inside the window;
/// the last price is the newest resolved trade price regardless of age.
pub fn pool_metrics(records: &[&HistoryItem], pool: &str, now: DateTime<Utc>) -> PoolMetrics {
    let cutoff = now - Duration::hours(METRICS_WINDOW_HOURS);

    let mut volume: u64 = 0;
    let mut tx_count: u64 = 0;
    let mut traders: HashSet<&str> = HashSet::new();
    let mut last: Option<(DateTime<Utc>, u64)> = None;

    for item in records {
        if item.pool.as_deref() != Some(pool) || !item.is_trade() {
            continue;
        }
        if let Some(price) = item.price_lamports {
            let at = item.age_basis();
            if last.map_or(true, |(t, _)| at > t) {
                last = Some((at, price));
            }
        }
        if item.age_basis() < cutoff {
            continue;
        }
        tx_count += 1;
        traders.insert(item.fee_payer.as_str());
        volume = volume.saturating_add(item.price_lamports.unwrap_or(0));
    }

    PoolMetrics {
        pool: pool.to_string(),
        volume_24h_lamports: volume,
        tx_count_24h: tx_count,
        unique_traders_24h: traders.len() as u64,
        last_price_lamports: last.map(|(_, p)| p),
        computed_at: now,
    }
}

/// Pools ranked by 24h volume, ties broken by trade count then address.
pub fn trending_pools(
    records: &[&HistoryItem],
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<(Pool, PoolMetrics)> {
    let mut ranked: Vec<(Pool, PoolMetrics)> = collect_pools(records)
        .into_iter()
        .map(|pool| {
            let metrics = pool_metrics(records, &pool.address, now);
            (pool, metrics)
        })
        .collect();
    ranked.sort_by(|(pa, ma), (pb, mb)| {
        mb.volume_24h_lamports
            .cmp(&ma.volume_24h_lamports)
            .then_with(|| mb.tx_count_24h.cmp(&ma.tx_count_24h))
            .then_with(|| pa.address.cmp(&pb.address))
    });
    ranked.truncate(limit);
    ranked
}

/// Grid of NFTs minted from one pool, newest first.
pub fn pool_nfts(records: &[&HistoryItem], pool: &str) -> Vec<NftGridItem> {
    let mut items: Vec<NftGridItem> = records
        .iter()
        .filter(|r| r.pool.as_deref() == Some(pool))
        .filter_map(|r| {
            let MarketInstruction::MintNft { name, uri, .. } = &r.instruction else {
                return None;
            };
            Some(NftGridItem {
                nft_mint: r.nft_mint.clone()?,
                pool: pool.to_string(),
                minter: r.fee_payer.clone(),
                name: name.clone(),
                uri: uri.clone(),
                price_lamports: r.price_lamports,
                block_time: r.age_basis(),
                signature: r.signature.clone(),
            })
        })
        .collect();
    items.sort_by(|a, b| b.block_time.cmp(&a.block_time).then_with(|| b.signature.cmp(&a.signature)));
    items
}
