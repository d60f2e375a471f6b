// =============================================================================
// Application State — shared handles for the API and the background updater
// =============================================================================

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::warn;

use crate::aggregator::Aggregator;
use crate::distribution::DistributionStore;
use crate::market_data::{Candle, CandleCache};
use crate::runtime_config::RuntimeConfig;
use crate::sources::SourcePool;
use crate::stats::{self, StatsSnapshot};
use crate::types::{CandleKey, Timeframe};
use crate::watchdog::Watchdog;

const MAX_RECENT_ERRORS: usize = 50;

/// Base timeframes the background updater keeps warm. 4h and 1d are derived
/// from 1h during refresh, so they never need their own upstream fetches.
pub const UPDATED_TIMEFRAMES: [Timeframe; 2] = [Timeframe::M15, Timeframe::H1];

/// One entry of the rolling error log surfaced by `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

pub struct AppState {
    pub config: RwLock<RuntimeConfig>,
    pub pool: Arc<SourcePool>,
    pub aggregator: Arc<Aggregator>,
    pub cache: Arc<CandleCache>,
    pub distributions: Arc<DistributionStore>,
    pub watchdog: Arc<Watchdog>,
    candle_blob_path: PathBuf,
    recent_errors: Mutex<VecDeque<ErrorEntry>>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Arc<Self> {
        Self::with_pool(config, Arc::new(SourcePool::new()))
    }

    fn with_pool(config: RuntimeConfig, pool: Arc<SourcePool>) -> Arc<Self> {
        let data_dir = PathBuf::from(&config.data_dir);
        let aggregator = Arc::new(Aggregator::new(Arc::clone(&pool)));
        let cache = Arc::new(CandleCache::new(Arc::clone(&aggregator)));
        let distributions = Arc::new(DistributionStore::load(
            data_dir.join("streak_distributions.json"),
        ));
        let watchdog = Arc::new(Watchdog::new(Arc::clone(&pool)));

        Arc::new(Self {
            config: RwLock::new(config),
            pool,
            aggregator,
            cache,
            distributions,
            watchdog,
            candle_blob_path: data_dir.join("candles.json"),
            recent_errors: Mutex::new(VecDeque::new()),
            started_at: Instant::now(),
        })
    }

    pub fn candle_blob_path(&self) -> &PathBuf {
        &self.candle_blob_path
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    pub fn push_error(&self, message: impl Into<String>) {
        let mut errors = self.recent_errors.lock();
        if errors.len() >= MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        errors.push_back(ErrorEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    pub fn recent_errors(&self) -> Vec<ErrorEntry> {
        self.recent_errors.lock().iter().cloned().collect()
    }

    /// One background refresh pass over every watched (symbol, base
    /// timeframe) key, with `spacing` between upstream calls. Returns false
    /// when the pass made no progress at all — a refresh error, or every key
    /// still empty afterwards (total source failure surfaces as empty
    /// aggregations, never as `Err`) — so the watchdog's consecutive-error
    /// trigger has a live input.
    pub async fn run_refresh_cycle(&self, spacing: Duration) -> bool {
        let symbols = self.config.read().symbols.clone();
        let mut progressed = false;
        let mut errored = false;

        for symbol in &symbols {
            for timeframe in UPDATED_TIMEFRAMES {
                let key = CandleKey::new(symbol.clone(), timeframe);
                if let Err(e) = self.cache.refresh(&key).await {
                    warn!(key = %key, error = %format!("{e:#}"), "background refresh failed");
                    self.push_error(format!("refresh {key}: {e:#}"));
                    errored = true;
                }
                if self.cache.peek(&key).is_some_and(|s| !s.is_empty()) {
                    progressed = true;
                }
                // Spread upstream calls instead of bursting every key at
                // the top of the cycle.
                tokio::time::sleep(spacing).await;
            }
        }

        progressed && !errored
    }

    // ---- delegated operations ----

    pub async fn get_candles(&self, symbol: &str, timeframe: Timeframe) -> Arc<Vec<Candle>> {
        let key = CandleKey {
            symbol: symbol.to_uppercase(),
            timeframe,
        };
        self.cache.get(&key).await
    }

    pub async fn get_current_price(&self, symbol: &str) -> f64 {
        self.aggregator.fetch_current_price(&symbol.to_uppercase()).await
    }

    pub async fn get_stats(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<StatsSnapshot>> {
        stats::get_stats(
            &self.cache,
            &self.aggregator,
            &self.distributions,
            &self.watchdog,
            &symbol.to_uppercase(),
            timeframe,
        )
        .await
    }
}
