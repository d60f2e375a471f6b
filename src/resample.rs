// =============================================================================
// Resampler — derive 4h/1d series from the 1h base with anchored buckets
// =============================================================================
//
// Bucket boundaries follow the prediction-market settlement convention, not
// plain epoch alignment: daily candles run noon→noon US/Eastern, and 4h
// candles align to Eastern wall-clock hours 0/4/8/12/16/20. Eastern-time
// anchoring means DST is handled by the timezone database, and a 4h bucket
// spanning a transition is genuinely 3 or 5 UTC hours long.
//
// If the anchored pass yields nothing (degenerate input, unresolvable local
// times), a plain UTC calendar bucketing runs as the fallback tier before the
// resampler gives up with an empty result.
// =============================================================================

use chrono::{DateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::market_data::Candle;
use crate::types::Timeframe;

/// Timezone anchoring the external bucket convention. Business configuration,
/// not a derivable default.
pub const ANCHOR_TZ: Tz = chrono_tz::US::Eastern;

/// Daily buckets close (and open) at this local hour in [`ANCHOR_TZ`].
pub const DAILY_CLOSE_HOUR_ET: u32 = 12;

/// 4h buckets align to local hours that are multiples of this.
pub const FOUR_HOUR_BLOCK: u32 = 4;

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Resample an ascending base series into `target` buckets. The partial,
/// currently open bucket is kept as the live candle.
pub fn resample(base: &[Candle], target: Timeframe) -> Vec<Candle> {
    if base.is_empty() {
        return Vec::new();
    }

    let anchored = aggregate_buckets(base, |ts| anchored_bucket_start(ts, target));
    if !anchored.is_empty() {
        return anchored;
    }

    warn!(%target, "anchored resample produced no buckets; falling back to calendar alignment");
    aggregate_buckets(base, |ts| Some(calendar_bucket_start(ts, target)))
}

// ---------------------------------------------------------------------------
// Bucket origin functions
// ---------------------------------------------------------------------------

/// Anchored bucket start for a candle open time (both UTC milliseconds).
/// Returns `None` only when the local boundary cannot be resolved (DST gap).
pub fn anchored_bucket_start(ts_ms: i64, target: Timeframe) -> Option<i64> {
    let utc = DateTime::<Utc>::from_timestamp_millis(ts_ms)?;
    let local = utc.with_timezone(&ANCHOR_TZ);

    let (date, hour) = match target {
        Timeframe::D1 => {
            // Noon-to-noon: times before local noon belong to the bucket
            // that opened at noon the previous day.
            let date = if local.hour() >= DAILY_CLOSE_HOUR_ET {
                local.date_naive()
            } else {
                local.date_naive().pred_opt()?
            };
            (date, DAILY_CLOSE_HOUR_ET)
        }
        Timeframe::H4 => (
            local.date_naive(),
            (local.hour() / FOUR_HOUR_BLOCK) * FOUR_HOUR_BLOCK,
        ),
        // Finer timeframes are epoch-aligned, no anchoring needed.
        Timeframe::M15 | Timeframe::H1 => return Some(calendar_bucket_start(ts_ms, target)),
    };

    let naive = date.and_time(NaiveTime::from_hms_opt(hour, 0, 0)?);
    // `earliest` picks the first mapping for DST-ambiguous local times; a
    // nonexistent local time (spring-forward gap) yields None and the candle
    // is skipped.
    let start = ANCHOR_TZ.from_local_datetime(&naive).earliest()?;
    Some(start.with_timezone(&Utc).timestamp_millis())
}

/// Plain UTC epoch-aligned bucket start.
pub fn calendar_bucket_start(ts_ms: i64, target: Timeframe) -> i64 {
    let dur = target.duration_ms();
    ts_ms - ts_ms.rem_euclid(dur)
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Group an ascending series by bucket origin and aggregate OHLCV:
/// open=first, high=max, low=min, close=last, volume=sum.
fn aggregate_buckets<F>(candles: &[Candle], bucket_of: F) -> Vec<Candle>
where
    F: Fn(i64) -> Option<i64>,
{
    let mut out: Vec<Candle> = Vec::new();
    let mut current: Option<Candle> = None;

    for c in candles {
        let Some(bucket) = bucket_of(c.open_time) else {
            continue;
        };

        match current.as_mut() {
            Some(agg) if agg.open_time == bucket => {
                agg.high = agg.high.max(c.high);
                agg.low = agg.low.min(c.low);
                agg.close = c.close;
                agg.volume += c.volume;
            }
            _ => {
                if let Some(done) = current.take() {
                    out.push(done);
                }
                current = Some(Candle {
                    open_time: bucket,
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                });
            }
        }
    }

    // The trailing bucket is the currently open candle — keep it.
    if let Some(partial) = current {
        out.push(partial);
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    /// UTC milliseconds for a civil Eastern date-time (EST/EDT resolved by
    /// the tz database).
    fn et_ms(y: i32, m: u32, d: u32, h: u32) -> i64 {
        let naive = NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap();
        ANCHOR_TZ
            .from_local_datetime(&naive)
            .earliest()
            .unwrap()
            .with_timezone(&Utc)
            .timestamp_millis()
    }

    fn hourly(start_ms: i64, count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| Candle {
                open_time: start_ms + i as i64 * 3_600_000,
                open: 100.0 + i as f64,
                high: 101.0 + i as f64,
                low: 99.0 + i as f64,
                close: 100.5 + i as f64,
                volume: 2.0,
            })
            .collect()
    }

    #[test]
    fn daily_buckets_split_at_noon_eastern() {
        // 11:00 ET belongs to yesterday's noon bucket; 12:00 ET starts a new one.
        let before = anchored_bucket_start(et_ms(2024, 6, 10, 11), Timeframe::D1).unwrap();
        let after = anchored_bucket_start(et_ms(2024, 6, 10, 12), Timeframe::D1).unwrap();

        assert_eq!(before, et_ms(2024, 6, 9, 12));
        assert_eq!(after, et_ms(2024, 6, 10, 12));
    }

    #[test]
    fn four_hour_buckets_align_to_eastern_marks() {
        let b = anchored_bucket_start(et_ms(2024, 6, 10, 7), Timeframe::H4).unwrap();
        assert_eq!(b, et_ms(2024, 6, 10, 4));

        let b = anchored_bucket_start(et_ms(2024, 6, 10, 23), Timeframe::H4).unwrap();
        assert_eq!(b, et_ms(2024, 6, 10, 20));
    }

    #[test]
    fn hourly_buckets_are_epoch_aligned() {
        let ts = 1_700_003_456_789;
        assert_eq!(
            anchored_bucket_start(ts, Timeframe::H1).unwrap(),
            ts - ts % 3_600_000
        );
    }

    #[test]
    fn resample_aggregates_ohlcv() {
        // Four hourly candles starting exactly at a 4h ET mark.
        let base = hourly(et_ms(2024, 6, 10, 8), 4);
        let out = resample(&base, Timeframe::H4);

        assert_eq!(out.len(), 1);
        let agg = out[0];
        assert_eq!(agg.open_time, et_ms(2024, 6, 10, 8));
        assert_eq!(agg.open, 100.0); // first
        assert_eq!(agg.high, 104.0); // max
        assert_eq!(agg.low, 99.0); // min
        assert_eq!(agg.close, 103.5); // last
        assert_eq!(agg.volume, 8.0); // sum
    }

    #[test]
    fn partial_open_bucket_is_kept() {
        // 6 hourly candles from an ET 4h mark: one full bucket + 2h partial.
        let base = hourly(et_ms(2024, 6, 10, 8), 6);
        let out = resample(&base, Timeframe::H4);

        assert_eq!(out.len(), 2);
        assert_eq!(out[1].open_time, et_ms(2024, 6, 10, 12));
        assert_eq!(out[1].volume, 4.0); // only 2 of 4 hours present
    }

    #[test]
    fn daily_resample_spans_noon_boundary() {
        // 30 hourly candles starting 00:00 ET: buckets at prev-noon and noon.
        let base = hourly(et_ms(2024, 6, 10, 0), 30);
        let out = resample(&base, Timeframe::D1);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].open_time, et_ms(2024, 6, 9, 12));
        assert_eq!(out[1].open_time, et_ms(2024, 6, 10, 12));
    }

    #[test]
    fn calendar_tier_aligns_to_utc_days() {
        let out = aggregate_buckets(
            &hourly(et_ms(2024, 6, 10, 0), 2),
            |ts| Some(calendar_bucket_start(ts, Timeframe::D1)),
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].open_time % 86_400_000, 0);
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(resample(&[], Timeframe::D1).is_empty());
    }
}
