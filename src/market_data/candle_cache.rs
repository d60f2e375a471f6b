// =============================================================================
// CandleCache — incrementally updated per-(symbol, timeframe) candle store
// =============================================================================
//
// One ordered series per key, strictly increasing and unique by open time,
// bounded to the newest MAX_SERIES_LEN candles. Refreshes are serialized per
// key through a dedicated async mutex (a second refresher waits, observes the
// cooldown, and no-ops instead of duplicating upstream calls); reads see the
// latest committed series via an atomic Arc swap and never block on a refresh
// of another key.
//
// Refreshing the 1h base regenerates the derived 4h/1d series; derived keys
// themselves redirect to a base refresh.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::resample;
use crate::types::{CandleKey, Timeframe};

// ---------------------------------------------------------------------------
// Candle
// ---------------------------------------------------------------------------

/// A single OHLCV candle. `open_time` is UTC milliseconds and unique within
/// its series. Candles are immutable once superseded; only the most recent
/// one may be patched in place by the live reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

// ---------------------------------------------------------------------------
// Tuning constants
// ---------------------------------------------------------------------------

/// Hard bound per series; oldest candles are evicted first.
pub const MAX_SERIES_LEN: usize = 10_000;

/// Minimum spacing between two upstream refreshes of the same key.
pub const REFRESH_COOLDOWN: Duration = Duration::from_secs(10);

/// Upstream limit for the first fetch of an empty series.
const BOOTSTRAP_LIMIT: u32 = 1000;

/// Upstream limit for incremental catch-up fetches.
const INCREMENTAL_LIMIT: u32 = 100;

// ---------------------------------------------------------------------------
// CandleCache
// ---------------------------------------------------------------------------

pub struct CandleCache {
    aggregator: Arc<Aggregator>,
    /// Committed series per key. Replacement is a whole-Arc swap, so readers
    /// never observe a half-merged series.
    series: RwLock<HashMap<CandleKey, Arc<Vec<Candle>>>>,
    /// Per-key throttle timestamps.
    last_update: RwLock<HashMap<CandleKey, Instant>>,
    /// Per-key refresh serialization. The outer mutex only guards the map of
    /// lock handles, never any await.
    refresh_locks: Mutex<HashMap<CandleKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl CandleCache {
    pub fn new(aggregator: Arc<Aggregator>) -> Self {
        Self {
            aggregator,
            series: RwLock::new(HashMap::new()),
            last_update: RwLock::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Current series for a key, refreshing first on a cache miss so a
    /// first-time read never returns "no data" when a fetch is possible.
    pub async fn get(&self, key: &CandleKey) -> Arc<Vec<Candle>> {
        if let Some(series) = self.peek(key) {
            if !series.is_empty() {
                return series;
            }
        }

        debug!(key = %key, "cache miss; refreshing before read");
        if let Err(e) = self.refresh(key).await {
            warn!(key = %key, error = %e, "cache-miss refresh failed");
        }
        self.peek(key).unwrap_or_default()
    }

    /// Committed series without triggering a refresh.
    pub fn peek(&self, key: &CandleKey) -> Option<Arc<Vec<Candle>>> {
        self.series.read().get(key).cloned()
    }

    // -------------------------------------------------------------------------
    // Refresh
    // -------------------------------------------------------------------------

    /// Refresh one key from upstream. Derived timeframes redirect to the base
    /// series, whose refresh regenerates them.
    pub async fn refresh(&self, key: &CandleKey) -> Result<()> {
        if key.timeframe.is_derived() {
            let base = CandleKey::new(key.symbol.clone(), Timeframe::BASE);
            return Box::pin(self.refresh(&base)).await;
        }

        let lock = self.refresh_lock(key);
        let _guard = lock.lock().await;

        // Re-check the throttle inside the lock: a waiter that queued behind
        // an in-flight refresh should no-op, not refetch.
        if let Some(at) = self.last_update.read().get(key) {
            if at.elapsed() < REFRESH_COOLDOWN {
                debug!(key = %key, "refresh skipped (cooldown)");
                return Ok(());
            }
        }

        let existing = self.peek(key).unwrap_or_default();

        let fresh = if let Some(last) = existing.last() {
            // Incremental: only candles newer than what we already hold.
            self.aggregator
                .fetch_candles(&key.symbol, key.timeframe, INCREMENTAL_LIMIT, Some(last.open_time))
                .await
        } else {
            info!(key = %key, "bootstrapping empty series");
            self.aggregator
                .fetch_candles(&key.symbol, key.timeframe, BOOTSTRAP_LIMIT, None)
                .await
        };

        self.last_update.write().insert(key.clone(), Instant::now());

        if fresh.is_empty() {
            debug!(key = %key, "no new candles this round");
        } else {
            let merged = merge_series(&existing, &fresh);
            info!(key = %key, added = fresh.len(), total = merged.len(), "series updated");
            self.series.write().insert(key.clone(), Arc::new(merged));
        }

        if key.timeframe == Timeframe::BASE {
            self.regenerate_derived(&key.symbol);
        }

        Ok(())
    }

    /// Rebuild the derived 4h/1d series from the committed base series.
    fn regenerate_derived(&self, symbol: &str) {
        let base_key = CandleKey::new(symbol, Timeframe::BASE);
        let Some(base) = self.peek(&base_key) else {
            return;
        };
        if base.is_empty() {
            return;
        }

        let mut map = self.series.write();
        for tf in [Timeframe::H4, Timeframe::D1] {
            let derived = resample::resample(&base, tf);
            map.insert(CandleKey::new(symbol, tf), Arc::new(derived));
        }
    }

    fn refresh_lock(&self, key: &CandleKey) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .entry(key.clone())
            .or_default()
            .clone()
    }

    // -------------------------------------------------------------------------
    // Persistence — best effort, never fatal
    // -------------------------------------------------------------------------

    /// Persist every series as one JSON blob via tmp + atomic rename.
    pub fn save_blob(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let snapshot: HashMap<String, Vec<Candle>> = self
            .series
            .read()
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_ref().clone()))
            .collect();

        let content =
            serde_json::to_string(&snapshot).context("failed to serialise candle cache blob")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp cache blob to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp cache blob to {}", path.display()))?;

        debug!(path = %path.display(), keys = snapshot.len(), "candle cache persisted");
        Ok(())
    }

    /// Load a previously persisted blob. Unknown keys are skipped; throttle
    /// timers start cold so the first cycle refetches immediately.
    pub fn load_blob(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read cache blob from {}", path.display()))?;
        let snapshot: HashMap<String, Vec<Candle>> =
            serde_json::from_str(&content).context("failed to parse cache blob")?;

        let mut map = self.series.write();
        let mut loaded = 0usize;
        for (raw_key, mut candles) in snapshot {
            let Some(key) = CandleKey::parse(&raw_key) else {
                warn!(key = raw_key, "skipping unrecognised cache blob key");
                continue;
            };
            candles.sort_by_key(|c| c.open_time);
            candles.dedup_by_key(|c| c.open_time);
            map.insert(key, Arc::new(candles));
            loaded += 1;
        }

        info!(path = %path.display(), keys = loaded, "candle cache loaded");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// Concatenate, dedup by open time keeping the newest value, sort, and bound
/// to the newest [`MAX_SERIES_LEN`] candles.
fn merge_series(existing: &[Candle], fresh: &[Candle]) -> Vec<Candle> {
    let mut by_ts: std::collections::BTreeMap<i64, Candle> = std::collections::BTreeMap::new();
    for c in existing.iter().chain(fresh.iter()) {
        // Later inserts win: a refetched candle supersedes the cached one.
        by_ts.insert(c.open_time, *c);
    }

    let mut merged: Vec<Candle> = by_ts.into_values().collect();
    if merged.len() > MAX_SERIES_LEN {
        merged.drain(..merged.len() - MAX_SERIES_LEN);
    }
    merged
}
