// =============================================================================
// Mock Source — scripted provider for aggregator/cache tests
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::market_data::Candle;
use crate::types::Timeframe;

/// Test double for a provider adapter. Responds with scripted candles and a
/// scripted ticker price after an optional delay, and records how often each
/// endpoint was hit so tests can assert on call counts and cancellation.
#[derive(Clone)]
pub struct MockSource {
    id: &'static str,
    candles: Vec<Candle>,
    price: f64,
    delay: Duration,
    fail: bool,
    supports_all: bool,
    pub candle_calls: Arc<AtomicUsize>,
    pub ticker_calls: Arc<AtomicUsize>,
    /// Set once a ticker call runs to completion; an aborted task never
    /// flips it.
    pub ticker_completed: Arc<AtomicBool>,
}

impl MockSource {
    pub fn new(id: &'static str, candles: Vec<Candle>, price: f64) -> Self {
        Self {
            id,
            candles,
            price,
            delay: Duration::ZERO,
            fail: false,
            supports_all: true,
            candle_calls: Arc::new(AtomicUsize::new(0)),
            ticker_calls: Arc::new(AtomicUsize::new(0)),
            ticker_completed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn without_timeframe_support(mut self) -> Self {
        self.supports_all = false;
        self
    }

    pub fn id(&self) -> &'static str {
        self.id
    }

    pub fn supports(&self, _timeframe: Timeframe) -> bool {
        self.supports_all
    }

    pub async fn fetch_candles(
        &self,
        _symbol: &str,
        _timeframe: Timeframe,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Candle>> {
        self.candle_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            anyhow::bail!("mock source '{}' configured to fail", self.id);
        }
        let filtered: Vec<Candle> = self
            .candles
            .iter()
            .filter(|c| since.map_or(true, |ts| c.open_time >= ts))
            .copied()
            .collect();
        let start = filtered.len().saturating_sub(limit as usize);
        Ok(filtered[start..].to_vec())
    }

    pub async fn fetch_ticker(&self, _symbol: &str) -> Result<f64> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.ticker_completed.store(true, Ordering::SeqCst);
        if self.fail {
            anyhow::bail!("mock source '{}' configured to fail", self.id);
        }
        Ok(self.price)
    }
}
