// =============================================================================
// Live Reconciliation — patch the cached series with the freshest price
// =============================================================================
//
// Between scheduled refreshes the last cached candle drifts behind the
// market. Before any stats read, the current bucket's wall-clock boundaries
// are computed (same Eastern anchors as the resampler) and the series is
// patched so "now" is always reflected:
//
//   * last candle == current bucket  → overwrite close, extend high/low
//   * last candle older (cache lag)  → append a synthetic candle
//   * last candle newer (clock skew) → leave the series untouched
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::market_data::Candle;
use crate::resample::{anchored_bucket_start, calendar_bucket_start};
use crate::types::Timeframe;

/// Slack when matching the last candle's start against the expected bucket
/// start, to absorb minor exchange clock drift.
pub const BUCKET_MATCH_TOLERANCE_MS: i64 = 10_000;

/// Start of the bucket containing `now` for a timeframe, UTC milliseconds.
/// 15m/1h are epoch-aligned; 4h/1d follow the Eastern anchor convention.
pub fn current_bucket_start(timeframe: Timeframe, now: DateTime<Utc>) -> i64 {
    let now_ms = now.timestamp_millis();
    anchored_bucket_start(now_ms, timeframe)
        .unwrap_or_else(|| calendar_bucket_start(now_ms, timeframe))
}

/// Expected close time of the bucket containing `now`, UTC milliseconds.
/// Computed as the next anchored boundary, so DST-stretched Eastern buckets
/// close at the right wall-clock instant.
pub fn expected_close_ms(timeframe: Timeframe, now: DateTime<Utc>) -> i64 {
    let start = current_bucket_start(timeframe, now);
    // Probe just past a nominal bucket length for the next boundary; this is
    // exact except across DST shifts, where the anchored start of the probe
    // lands on the true boundary anyway.
    let probe = start + timeframe.duration_ms() + timeframe.duration_ms() / 2;
    anchored_bucket_start(probe, timeframe).unwrap_or(start + timeframe.duration_ms())
}

/// Patch `series` in place using a fresh live price. No-op for non-positive
/// prices or an empty series.
pub fn reconcile(series: &mut Vec<Candle>, timeframe: Timeframe, price: f64, now: DateTime<Utc>) {
    if price <= 0.0 || series.is_empty() {
        return;
    }

    let expected_start = current_bucket_start(timeframe, now);
    let Some(last_open) = series.last().map(|c| c.open_time) else {
        return;
    };

    if (last_open - expected_start).abs() < BUCKET_MATCH_TOLERANCE_MS {
        // Inside the current bucket: live price becomes the close, and may
        // stretch the extremes.
        if let Some(last) = series.last_mut() {
            last.close = price;
            if price > last.high {
                last.high = price;
            }
            if price < last.low {
                last.low = price;
            }
        }
    } else if last_open < expected_start {
        // Cache lag: synthesize the missing current candle from the live
        // price with zero volume.
        debug!(
            %timeframe,
            expected_start,
            last_open,
            "appending synthetic live candle (cache lag)"
        );
        series.push(Candle {
            open_time: expected_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 0.0,
        });
    }
    // last.open_time > expected_start: clock skew / anomaly — do nothing.
}
