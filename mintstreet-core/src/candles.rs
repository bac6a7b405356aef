// OHLC candle construction for pool charts. Chain-timed trades bucket by
// block time; trades that only carry an observation time (live deliveries
// the chain has not timestamped yet) fold into the series through a merge
// window so the current candle keeps moving between confirmed buckets.

use crate::models::{Candle, HistoryItem};
use std::collections::BTreeMap;

/// Fixed-interval OHLC candles for one pool from its chain-timed priced
/// trades, oldest bucket first, at most `limit` buckets from the tail.
pub fn build_candles(
    records: &[&HistoryItem],
    pool: &str,
    interval_secs: i64,
    limit: usize,
) -> Vec<Candle> {
    let interval = interval_secs.max(1);

    let mut trades: Vec<(i64, u64)> = records
        .iter()
        .filter(|r| r.pool.as_deref() == Some(pool) && r.is_trade())
        .filter_map(|r| {
            let t = r.block_time?;
            r.price_lamports.map(|p| (t.timestamp(), p))
        })
        .collect();
    trades.sort();

    let mut buckets: BTreeMap<i64, Candle> = BTreeMap::new();
    for (ts, price) in trades {
        let bucket_start = ts - ts.rem_euclid(interval);
        buckets
            .entry(bucket_start)
            .and_modify(|c| {
                c.high = c.high.max(price);
                c.low = c.low.min(price);
                c.close = price;
                c.volume_lamports = c.volume_lamports.saturating_add(price);
                c.trades_count += 1;
            })
            .or_insert_with(|| single_trade_candle(pool, interval, bucket_start, price));
    }

    let mut candles: Vec<Candle> = buckets.into_values().collect();
    if candles.len() > limit {
        candles.drain(..candles.len() - limit);
    }
    candles
}

/// Fold one live trade into an existing candle series. The trade lands in
/// the final candle when it falls in that candle's bucket or within the
/// merge window after it; anything newer opens a fresh candle. Out-of-order
/// trades older than the final bucket are dropped rather than rewriting
/// closed candles.
pub fn merge_live_trade(
    candles: &mut Vec<Candle>,
    pool: &str,
    interval_secs: i64,
    live_window_secs: i64,
    ts: i64,
    price: u64,
) {
    let interval = interval_secs.max(1);
    let bucket_start = ts - ts.rem_euclid(interval);

    if let Some(last) = candles.last_mut() {
        if bucket_start < last.bucket_start {
            return;
        }
        let window_end = last.bucket_start + interval + live_window_secs;
        if bucket_start == last.bucket_start || ts < window_end {
            last.high = last.high.max(price);
            last.low = last.low.min(price);
            last.close = price;
            last.volume_lamports = last.volume_lamports.saturating_add(price);
            last.trades_count += 1;
            return;
        }
    }

    candles.push(single_trade_candle(pool, interval, bucket_start, price));
}

/// Complete candle series for one pool: confirmed trades bucketed by chain
/// time, then still-unconfirmed live trades merged in observation order.
pub fn pool_candles(
    records: &[&HistoryItem],
    pool: &str,
    interval_secs: i64,
    live_window_secs: i64,
    limit: usize,
) -> Vec<Candle> {
    let interval = interval_secs.max(1);
    let mut candles = build_candles(records, pool, interval, limit);

    let mut live: Vec<(i64, u64)> = records
        .iter()
        .filter(|r| r.pool.as_deref() == Some(pool) && r.is_trade() && r.block_time.is_none())
        .filter_map(|r| r.price_lamports.map(|p| (r.observed_at.timestamp(), p)))
        .collect();
    live.sort();
    for (ts, price) in live {
        merge_live_trade(&mut candles, pool, interval, live_window_secs, ts, price);
    }

    if candles.len() > limit {
        candles.drain(..candles.len() - limit);
    }
    candles
}

fn single_trade_candle(pool: &str, interval: i64, bucket_start: i64, price: u64) -> Candle {
    Candle {
        pool: pool.to_string(),
        interval_secs: interval,
        bucket_start,
        open: price,
        high: price,
        low: price,
        close: price,
        volume_lamports: price,
        trades_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MarketInstruction, RecordSource};
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn trade(sig: &str, at: DateTime<Utc>, price: u64) -> HistoryItem {
        HistoryItem {
            signature: sig.to_string(),
            slot: 10,
            block_time: Some(at),
            instruction: MarketInstruction::MintNft {
                name: format!("NFT {sig}"),
                symbol: "MNT".to_string(),
                uri: "https://arweave.net/x".to_string(),
            },
            fee_payer: format!("payer_{sig}"),
            account_keys: vec![],
            pool: Some("pool_a".to_string()),
            escrow: Some("escrow_a".to_string()),
            nft_mint: Some(format!("mint_{sig}")),
            price_lamports: Some(price),
            price_load_attempted: true,
            price_load_succeeded: true,
            source: RecordSource::Poll,
            observed_at: at,
        }
    }

    #[test]
    fn test_build_candles_buckets_ohlc() {
        let base = Utc.timestamp_opt(1_700_000_040, 0).unwrap();
        // Two trades in one minute bucket, one in the next.
        let a = trade("a", base + Duration::seconds(5), 100);
        let b = trade("b", base + Duration::seconds(20), 80);
        let c = trade("c", base + Duration::seconds(70), 120);
        let records = [&a, &b, &c];

        let candles = build_candles(&records, "pool_a", 60, 100);
        assert_eq!(candles.len(), 2);

        let first = &candles[0];
        assert_eq!(first.bucket_start, 1_700_000_040);
        assert_eq!(first.open, 100);
        assert_eq!(first.high, 100);
        assert_eq!(first.low, 80);
        assert_eq!(first.close, 80);
        assert_eq!(first.volume_lamports, 180);
        assert_eq!(first.trades_count, 2);

        let second = &candles[1];
        assert_eq!(second.open, 120);
        assert_eq!(second.trades_count, 1);
        assert_eq!(second.bucket_start, first.bucket_start + 60);
    }

    #[test]
    fn test_build_candles_tail_limit() {
        let base = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        let records: Vec<HistoryItem> = (0..5)
            .map(|i| trade(&format!("s{i}"), base + Duration::seconds(i * 60), 10 + i as u64))
            .collect();
        let refs: Vec<&HistoryItem> = records.iter().collect();

        let candles = build_candles(&refs, "pool_a", 60, 2);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].open, 13);
        assert_eq!(candles[1].open, 14);
    }

    #[test]
    fn test_build_candles_skips_unpriced_and_untimed() {
        let base = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        let mut unpriced = trade("a", base, 0);
        unpriced.price_lamports = None;
        let mut untimed = trade("b", base, 50);
        untimed.block_time = None;
        let records = [&unpriced, &untimed];

        assert!(build_candles(&records, "pool_a", 60, 100).is_empty());
    }

    #[test]
    fn test_merge_live_trade_window() {
        let mut candles = build_candles(&[], "pool_a", 60, 100);
        assert!(candles.is_empty());

        merge_live_trade(&mut candles, "pool_a", 60, 120, 600, 100);
        assert_eq!(candles.len(), 1);

        // Same bucket updates in place.
        merge_live_trade(&mut candles, "pool_a", 60, 120, 630, 90);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].close, 90);
        assert_eq!(candles[0].low, 90);
        assert_eq!(candles[0].trades_count, 2);

        // Inside the live window past the bucket end still folds in.
        merge_live_trade(&mut candles, "pool_a", 60, 120, 700, 110);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].high, 110);

        // Beyond the window a new candle opens.
        merge_live_trade(&mut candles, "pool_a", 60, 120, 900, 130);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].open, 130);

        // A trade older than the final bucket is ignored.
        merge_live_trade(&mut candles, "pool_a", 60, 120, 100, 1);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].trades_count, 3);
    }

    #[test]
    fn test_pool_candles_folds_untimed_live_trades() {
        let base = Utc.timestamp_opt(1_700_000_040, 0).unwrap();
        let confirmed = trade("a", base, 100);

        // Observed moments after the confirmed bucket, no chain time yet.
        let mut live = trade("b", base + Duration::seconds(45), 140);
        live.block_time = None;
        live.source = RecordSource::Push;

        // Observed far past the window, opens its own bucket.
        let mut later = trade("c", base + Duration::seconds(700), 90);
        later.block_time = None;
        later.source = RecordSource::Push;

        let records = [&confirmed, &live, &later];
        let candles = pool_candles(&records, "pool_a", 60, 120, 100);

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].close, 140);
        assert_eq!(candles[0].trades_count, 2);
        assert_eq!(candles[1].open, 90);
        assert_eq!(candles[1].trades_count, 1);
    }
}
