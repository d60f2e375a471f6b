// =============================================================================
// Aggregator — multi-source candle merge and live price race
// =============================================================================
//
// Two reduction strategies over the source pool:
//
//   * Candles (accuracy): fan the same request out to every supporting
//     client, drop failures, union rows by open time and take the per-field
//     median. A single stale or misbehaving exchange cannot move the merged
//     value without a majority.
//   * Live price (latency): race ticker requests; the first positive price
//     wins and every losing in-flight task is aborted. A short TTL cache
//     absorbs rapid repeated reads.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::market_data::Candle;
use crate::sources::SourcePool;
use crate::types::Timeframe;

/// TTL for the short-term live price cache.
const PRICE_CACHE_TTL: Duration = Duration::from_secs(2);

/// Per-ticker-request timeout inside the price race.
const TICKER_TIMEOUT: Duration = Duration::from_secs(5);

/// Sanity ceiling for aggregated BTC closes. Breaches are logged loudly but
/// never block the pipeline.
const BTC_SANITY_CEILING: f64 = 250_000.0;

pub struct Aggregator {
    pool: Arc<SourcePool>,
    /// symbol → (price, observed-at). Sole writer is the price race.
    price_cache: RwLock<HashMap<String, (f64, Instant)>>,
}

impl Aggregator {
    pub fn new(pool: Arc<SourcePool>) -> Self {
        Self {
            pool,
            price_cache: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Candle aggregation (accuracy-oriented)
    // -------------------------------------------------------------------------

    /// Fetch candles from every pool member that supports `timeframe` and
    /// median-merge the results. Total failure yields an empty vec, never an
    /// error; the cache treats that as "nothing new".
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
        since: Option<i64>,
    ) -> Vec<Candle> {
        let clients: Vec<_> = self
            .pool
            .clients()
            .into_iter()
            .filter(|c| c.supports(timeframe))
            .collect();

        let futures = clients.iter().map(|client| async move {
            match client.fetch_candles(symbol, timeframe, limit, since).await {
                Ok(candles) if !candles.is_empty() => Some(candles),
                Ok(_) => None,
                Err(e) => {
                    debug!(source = client.id(), symbol, %timeframe, error = %e, "candle fetch failed; skipping source");
                    None
                }
            }
        });

        let results: Vec<Vec<Candle>> = join_all(futures).await.into_iter().flatten().collect();

        if results.is_empty() {
            warn!(symbol, %timeframe, "all sources failed; returning empty aggregation");
            return Vec::new();
        }

        let sources = results.len();
        let merged = median_merge(results);

        if let Some(last) = merged.last() {
            if symbol == "BTC" && last.close > BTC_SANITY_CEILING {
                error!(
                    symbol,
                    close = last.close,
                    sources,
                    "ANOMALY: aggregated BTC close above sanity ceiling"
                );
            }
        }

        debug!(symbol, %timeframe, sources, count = merged.len(), "candles aggregated");
        merged
    }

    // -------------------------------------------------------------------------
    // Live price (latency-oriented)
    // -------------------------------------------------------------------------

    /// Race ticker requests across the pool; first positive price wins and
    /// the losers are cancelled. Returns 0.0 when every source fails.
    pub async fn fetch_current_price(&self, symbol: &str) -> f64 {
        if let Some((price, at)) = self.price_cache.read().get(symbol).copied() {
            if at.elapsed() < PRICE_CACHE_TTL {
                return price;
            }
        }

        let mut tasks = JoinSet::new();
        for client in self.pool.clients() {
            let sym = symbol.to_string();
            tasks.spawn(async move {
                tokio::time::timeout(TICKER_TIMEOUT, client.fetch_ticker(&sym)).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Ok(price))) if price > 0.0 => {
                    // Winner: cancel everything still in flight.
                    tasks.abort_all();
                    self.price_cache
                        .write()
                        .insert(symbol.to_string(), (price, Instant::now()));
                    return price;
                }
                // Timeouts, provider errors and non-positive prices are all
                // local losses; keep waiting for the next finisher.
                _ => continue,
            }
        }

        warn!(symbol, "all sources failed to provide a live price");
        0.0
    }
}

// =============================================================================
// Median merge
// =============================================================================

/// Union candle rows by open time and take the per-field median across the
/// sources that reported that timestamp.
fn median_merge(series: Vec<Vec<Candle>>) -> Vec<Candle> {
    let mut by_ts: BTreeMap<i64, Vec<Candle>> = BTreeMap::new();
    for candles in series {
        for c in candles {
            by_ts.entry(c.open_time).or_default().push(c);
        }
    }

    by_ts
        .into_iter()
        .map(|(ts, rows)| Candle {
            open_time: ts,
            open: median(rows.iter().map(|c| c.open)),
            high: median(rows.iter().map(|c| c.high)),
            low: median(rows.iter().map(|c| c.low)),
            close: median(rows.iter().map(|c| c.close)),
            volume: median(rows.iter().map(|c| c.volume)),
        })
        .collect()
}

/// Median of a non-empty iterator; even counts average the two middles.
fn median(values: impl Iterator<Item = f64>) -> f64 {
    let mut xs: Vec<f64> = values.collect();
    xs.sort_by(|a, b| a.total_cmp(b));
    let n = xs.len();
    if n == 0 {
        return 0.0;
    }
    if n % 2 == 1 {
        xs[n / 2]
    } else {
        (xs[n / 2 - 1] + xs[n / 2]) / 2.0
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::mock::MockSource;
    use crate::sources::SourceClient;
    use std::sync::atomic::Ordering;

    fn candle(ts: i64, open: f64, close: f64) -> Candle {
        Candle {
            open_time: ts,
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn median_odd_and_even_counts() {
        assert_eq!(median([100.0, 102.0, 101.0].into_iter()), 101.0);
        assert_eq!(median([100.0, 102.0].into_iter()), 101.0);
        assert_eq!(median([7.0].into_iter()), 7.0);
    }

    #[test]
    fn merge_takes_median_close_per_timestamp() {
        let merged = median_merge(vec![
            vec![candle(1000, 99.0, 100.0)],
            vec![candle(1000, 99.0, 102.0)],
            vec![candle(1000, 99.0, 101.0)],
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].close, 101.0);
    }

    #[test]
    fn merge_unions_disjoint_timestamps_sorted() {
        let merged = median_merge(vec![
            vec![candle(2000, 1.0, 2.0)],
            vec![candle(1000, 3.0, 4.0), candle(3000, 5.0, 6.0)],
        ]);
        let times: Vec<i64> = merged.iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![1000, 2000, 3000]);
    }

    #[tokio::test]
    async fn price_race_first_success_wins_and_cancels_losers() {
        let slow_a = MockSource::new("slow-a", vec![], 48.0)
            .with_delay(Duration::from_millis(500));
        let fast = MockSource::new("fast", vec![], 50.0).with_delay(Duration::from_millis(10));
        let slow_b = MockSource::new("slow-b", vec![], 52.0)
            .with_delay(Duration::from_millis(500));

        let a_done = slow_a.ticker_completed.clone();
        let b_done = slow_b.ticker_completed.clone();

        let pool = Arc::new(SourcePool::with_clients(vec![
            SourceClient::Mock(slow_a),
            SourceClient::Mock(fast),
            SourceClient::Mock(slow_b),
        ]));
        let agg = Aggregator::new(pool);

        let price = agg.fetch_current_price("BTC").await;
        assert_eq!(price, 50.0);

        // Give aborted tasks a moment: they must never run to completion.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!a_done.load(Ordering::SeqCst));
        assert!(!b_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn price_race_skips_failing_sources() {
        let bad = MockSource::new("bad", vec![], 99.0).failing();
        let good = MockSource::new("good", vec![], 42.0).with_delay(Duration::from_millis(20));

        let pool = Arc::new(SourcePool::with_clients(vec![
            SourceClient::Mock(bad),
            SourceClient::Mock(good),
        ]));
        let agg = Aggregator::new(pool);

        assert_eq!(agg.fetch_current_price("ETH").await, 42.0);
    }

    #[tokio::test]
    async fn price_cache_short_circuits_repeat_reads() {
        let src = MockSource::new("counted", vec![], 10.0);
        let calls = src.ticker_calls.clone();

        let pool = Arc::new(SourcePool::with_clients(vec![SourceClient::Mock(src)]));
        let agg = Aggregator::new(pool);

        assert_eq!(agg.fetch_current_price("BTC").await, 10.0);
        assert_eq!(agg.fetch_current_price("BTC").await, 10.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn candle_aggregation_discards_failures() {
        let good = MockSource::new("good", vec![candle(1000, 1.0, 2.0)], 0.0);
        let bad = MockSource::new("bad", vec![candle(1000, 1.0, 4.0)], 0.0).failing();

        let pool = Arc::new(SourcePool::with_clients(vec![
            SourceClient::Mock(good),
            SourceClient::Mock(bad),
        ]));
        let agg = Aggregator::new(pool);

        let merged = agg.fetch_candles("BTC", Timeframe::H1, 100, None).await;
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].close, 2.0);
    }

    #[tokio::test]
    async fn candle_aggregation_total_failure_is_empty() {
        let bad = MockSource::new("bad", vec![], 0.0).failing();
        let pool = Arc::new(SourcePool::with_clients(vec![SourceClient::Mock(bad)]));
        let agg = Aggregator::new(pool);

        assert!(agg.fetch_candles("BTC", Timeframe::H1, 100, None).await.is_empty());
    }

    #[tokio::test]
    async fn unsupported_timeframe_skips_client() {
        let unsupported =
            MockSource::new("no-4h", vec![candle(1000, 1.0, 9.0)], 0.0).without_timeframe_support();
        let calls = unsupported.candle_calls.clone();

        let pool = Arc::new(SourcePool::with_clients(vec![SourceClient::Mock(
            unsupported,
        )]));
        let agg = Aggregator::new(pool);

        let merged = agg.fetch_candles("BTC", Timeframe::H4, 100, None).await;
        assert!(merged.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
