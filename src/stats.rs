// =============================================================================
// Stats orchestration — the full per-key analysis pipeline
// =============================================================================
//
// One call assembles everything a dashboard needs for a (symbol, timeframe):
// cached candles, live-price reconciliation, streak grouping, continuation
// probabilities, the persistent length distribution, and the derived trading
// heuristics. Reads come from the cache; the only upstream call on this path
// is the (TTL-cached) live ticker.
// =============================================================================

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::aggregator::Aggregator;
use crate::distribution::DistributionStore;
use crate::live_sync::{expected_close_ms, reconcile};
use crate::market_data::{Candle, CandleCache};
use crate::streaks::{
    self, CandleColor, CurvePoint, Microtrends, round1, round2, round4,
};
use crate::types::{CandleKey, Timeframe};
use crate::watchdog::Watchdog;

/// Analysis window: plenty of streak history without dragging the whole
/// retained series through every request.
const ANALYSIS_WINDOW: usize = 5000;

// ---------------------------------------------------------------------------
// Response shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentStreak {
    #[serde(rename = "type")]
    pub color: CandleColor,
    pub length: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextCandleProb {
    /// Continuation probability in percent, one decimal; null when the
    /// current streak is an all-time record for its color.
    #[serde(rename = "continue")]
    pub continue_pct: Option<f64>,
    pub reverse: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakStats {
    pub volatility: f64,
    pub avg_streak: f64,
    pub max_streak: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartExit {
    pub optimal_price: f64,
    pub offset_pct: f64,
    pub liquidity_tightness: String,
    pub est_fill_time_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhipsawRisk {
    pub probability: f64,
    pub category: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmartTrading {
    pub microtrends: Microtrends,
    pub spread: f64,
    pub slippage: f64,
    pub smart_exit: SmartExit,
    pub whipsaw_risk: WhipsawRisk,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionEntry {
    pub count: u64,
    pub last_happened: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub current_price: f64,
    pub candle_open: f64,
    /// Wall-clock close time (UTC ms) of the bucket currently forming.
    pub candle_close_time: i64,
    pub is_stale: bool,
    pub current_streak: CurrentStreak,
    pub next_candle_prob: NextCandleProb,
    pub stats: StreakStats,
    pub smart_trading: SmartTrading,
    /// Streak-length histogram for the current streak's color.
    pub distribution: BTreeMap<u32, DistributionEntry>,
    pub probability_curve: Vec<CurvePoint>,
    pub total_candles: usize,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Run the full analysis for one key. `Ok(None)` means no candles could be
/// obtained at all (fresh start with every source down).
#[instrument(skip(cache, aggregator, store, watchdog), name = "stats::get_stats")]
pub async fn get_stats(
    cache: &CandleCache,
    aggregator: &Aggregator,
    store: &DistributionStore,
    watchdog: &Watchdog,
    symbol: &str,
    timeframe: Timeframe,
) -> Result<Option<StatsSnapshot>> {
    let key = CandleKey {
        symbol: symbol.to_string(),
        timeframe,
    };
    let series = cache.get(&key).await;
    if series.is_empty() {
        return Ok(None);
    }

    let start = series.len().saturating_sub(ANALYSIS_WINDOW);
    let mut candles: Vec<Candle> = series[start..].to_vec();

    let now = Utc::now();
    let now_ms = now.timestamp_millis();
    let close_time = expected_close_ms(timeframe, now);

    // Live reconciliation: patch or extend the forming candle with the
    // freshest ticker price before any streak math runs.
    let live_price = aggregator.fetch_current_price(symbol).await;
    reconcile(&mut candles, timeframe, live_price, now);

    let streak_list = streaks::group_streaks(&candles);
    let current = *streak_list
        .last()
        .context("streak grouping produced no groups for a non-empty series")?;

    let (p_cont, p_rev) =
        streaks::continuation_probability(&streak_list, current.color, current.length);

    store.fold(&key, &streak_list);
    let distribution = store
        .distribution_for(&key, current.color)
        .into_iter()
        .map(|row| {
            (
                row.length,
                DistributionEntry {
                    count: row.count,
                    last_happened: row.last_happened.unwrap_or_default(),
                },
            )
        })
        .collect();

    let volatility = streaks::volatility_pct(&candles);
    let last = candles[candles.len() - 1];

    let is_stale = streaks::is_stale(last.open_time, now_ms, timeframe);
    if is_stale {
        watchdog.on_stale(&key.to_string());
    }

    Ok(Some(StatsSnapshot {
        symbol: symbol.to_string(),
        timeframe,
        current_price: last.close,
        candle_open: last.open,
        candle_close_time: close_time,
        is_stale,
        current_streak: CurrentStreak {
            color: current.color,
            length: current.length,
        },
        next_candle_prob: NextCandleProb {
            continue_pct: p_cont.map(|p| round1(p * 100.0)),
            reverse: p_rev.map(|p| round1(p * 100.0)),
        },
        stats: StreakStats {
            volatility: round2(volatility),
            avg_streak: round1(streaks::mean_streak_length(&streak_list)),
            max_streak: streaks::max_streak_length(&streak_list),
        },
        smart_trading: smart_trading(&candles, last.close, volatility),
        distribution,
        probability_curve: streaks::probability_curve(&streak_list, current.color),
        total_candles: candles.len(),
    }))
}

/// Volatility-scaled execution heuristics.
fn smart_trading(candles: &[Candle], close: f64, volatility: f64) -> SmartTrading {
    SmartTrading {
        microtrends: streaks::microtrends(candles),
        spread: round4(volatility * 0.05),
        slippage: round4(volatility * 0.02),
        smart_exit: SmartExit {
            optimal_price: round2(close * (1.0 + volatility / 100.0 * 0.5)),
            offset_pct: round1(volatility * 0.5),
            liquidity_tightness: if volatility > 1.0 {
                "High"
            } else if volatility > 0.5 {
                "Medium"
            } else {
                "Low"
            }
            .to_string(),
            est_fill_time_ms: (200.0 + volatility * 100.0) as u64,
        },
        whipsaw_risk: WhipsawRisk {
            probability: streaks::whipsaw_probability_pct(candles),
            category: if volatility > 2.0 {
                "High"
            } else if volatility > 1.0 {
                "Normal"
            } else {
                "Low"
            }
            .to_string(),
        },
    }
}
