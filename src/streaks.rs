// =============================================================================
// Streak Engine — pure streak grouping and continuation statistics
// =============================================================================
//
// Everything here is a pure function over a candle slice; no state, no I/O.
// The color rule forward-fills flat candles with the previous color (trend
// persistence); a flat first candle defaults to Green.
//
// Continuation probability is conditional frequency: of all historical
// streaks of the current color that reached length N, what share went on to
// exceed N. With no precedent besides the current streak the answer is
// undefined (None), never zero.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::market_data::Candle;
use crate::types::Timeframe;

// ---------------------------------------------------------------------------
// Colors and streaks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleColor {
    Green,
    Red,
}

impl CandleColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleColor::Green => "green",
            CandleColor::Red => "red",
        }
    }
}

impl std::fmt::Display for CandleColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A maximal run of same-color candles. The last group of a series is the
/// current, possibly still-in-progress streak.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Streak {
    pub color: CandleColor,
    pub length: usize,
    pub start_index: usize,
    /// Open time of the streak's final candle (UTC ms).
    pub end_time: i64,
}

/// Assign a color to every candle: close>open Green, close<open Red, flat
/// inherits the previous color; a flat first candle is Green.
pub fn color_series(candles: &[Candle]) -> Vec<CandleColor> {
    let mut colors = Vec::with_capacity(candles.len());
    let mut prev = CandleColor::Green;

    for c in candles {
        let color = if c.close > c.open {
            CandleColor::Green
        } else if c.close < c.open {
            CandleColor::Red
        } else {
            prev
        };
        colors.push(color);
        prev = color;
    }
    colors
}

/// Group a series into maximal same-color runs.
pub fn group_streaks(candles: &[Candle]) -> Vec<Streak> {
    let colors = color_series(candles);
    let mut streaks: Vec<Streak> = Vec::new();

    for (i, (candle, color)) in candles.iter().zip(colors.iter()).enumerate() {
        match streaks.last_mut() {
            Some(run) if run.color == *color => {
                run.length += 1;
                run.end_time = candle.open_time;
            }
            _ => streaks.push(Streak {
                color: *color,
                length: 1,
                start_index: i,
                end_time: candle.open_time,
            }),
        }
    }
    streaks
}

// ---------------------------------------------------------------------------
// Continuation probability
// ---------------------------------------------------------------------------

/// `P(continue)` and `P(reverse)` as fractions for a streak of `color` at
/// `length`, measured against every streak in `streaks` (the current one
/// included). Both are `None` when at most one streak ever reached `length`.
pub fn continuation_probability(
    streaks: &[Streak],
    color: CandleColor,
    length: usize,
) -> (Option<f64>, Option<f64>) {
    let reaching = streaks
        .iter()
        .filter(|s| s.color == color && s.length >= length)
        .count();
    let continuing = streaks
        .iter()
        .filter(|s| s.color == color && s.length > length)
        .count();

    if reaching <= 1 {
        // Only the current streak has ever come this far — no precedent.
        (None, None)
    } else {
        let p = continuing as f64 / reaching as f64;
        (Some(p), Some(1.0 - p))
    }
}

/// One point of the conditional continuation curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CurvePoint {
    pub length: u32,
    /// Continuation probability in percent, one decimal; 0 when no streak of
    /// this color ever reached `length`.
    pub prob: f64,
}

/// Continuation percentages for thresholds 1..=12 against `color`.
pub fn probability_curve(streaks: &[Streak], color: CandleColor) -> Vec<CurvePoint> {
    (1..=12)
        .map(|i| {
            let reaching = streaks
                .iter()
                .filter(|s| s.color == color && s.length >= i)
                .count();
            let continuing = streaks
                .iter()
                .filter(|s| s.color == color && s.length > i)
                .count();
            let prob = if reaching > 0 {
                round1(continuing as f64 / reaching as f64 * 100.0)
            } else {
                0.0
            };
            CurvePoint {
                length: i as u32,
                prob,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Auxiliary metrics
// ---------------------------------------------------------------------------

/// Sample standard deviation of close-to-close percentage returns over the
/// trailing 100 candles, in percent. 0 when undefined (fewer than 3 closes).
pub fn volatility_pct(candles: &[Candle]) -> f64 {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let start = closes.len().saturating_sub(101);
    let window = &closes[start..];

    let returns: Vec<f64> = window
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }

    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (returns.len() - 1) as f64;
    var.sqrt() * 100.0
}

/// Mean streak length over all groups.
pub fn mean_streak_length(streaks: &[Streak]) -> f64 {
    if streaks.is_empty() {
        return 0.0;
    }
    streaks.iter().map(|s| s.length).sum::<usize>() as f64 / streaks.len() as f64
}

/// Longest streak over all groups.
pub fn max_streak_length(streaks: &[Streak]) -> usize {
    streaks.iter().map(|s| s.length).max().unwrap_or(0)
}

/// Short-horizon directional reads of the series tail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Microtrends {
    /// Direction of the current candle (close vs open).
    #[serde(rename = "1m")]
    pub m1: String,
    /// Close vs the close 5 candles back; "flat" when the series is too short.
    #[serde(rename = "5m")]
    pub m5: String,
    /// Close vs the close 15 candles back; "flat" when the series is too short.
    #[serde(rename = "15m")]
    pub m15: String,
}

pub fn microtrends(candles: &[Candle]) -> Microtrends {
    let n = candles.len();
    let last = candles.last();

    let m1 = match last {
        Some(c) if c.close > c.open => "up",
        Some(_) => "down",
        None => "flat",
    };

    let back = |k: usize| -> &'static str {
        if n > k {
            let cur = candles[n - 1].close;
            let then = candles[n - k].close;
            if cur > then {
                "up"
            } else {
                "down"
            }
        } else {
            "flat"
        }
    };

    Microtrends {
        m1: m1.to_string(),
        m5: back(5).to_string(),
        m15: back(15).to_string(),
    }
}

/// Share of candles (percent) whose body is under 40% of a non-zero range —
/// the wick-dominated shape that whipsaws tight stops.
pub fn whipsaw_probability_pct(candles: &[Candle]) -> f64 {
    if candles.is_empty() {
        return 0.0;
    }
    let wicky = candles
        .iter()
        .filter(|c| {
            let range = c.high - c.low;
            range > 0.0 && ((c.open - c.close).abs() / range) < 0.4
        })
        .count();
    round1(wicky as f64 / candles.len() as f64 * 100.0)
}

/// Staleness: the last candle is more than two bucket durations old.
pub fn is_stale(last_open_ms: i64, now_ms: i64, timeframe: Timeframe) -> bool {
    now_ms - last_open_ms > 2 * timeframe.duration_ms()
}

// ---------------------------------------------------------------------------
// Rounding helpers
// ---------------------------------------------------------------------------

pub fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}

pub fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn round4(x: f64) -> f64 {
    (x * 10_000.0).round() / 10_000.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candles(pairs: &[(f64, f64)]) -> Vec<Candle> {
        pairs
            .iter()
            .enumerate()
            .map(|(i, (open, close))| Candle {
                open_time: (i as i64 + 1) * 3_600_000,
                open: *open,
                high: open.max(*close),
                low: open.min(*close),
                close: *close,
                volume: 1.0,
            })
            .collect()
    }

    #[test]
    fn all_green_series_is_one_streak() {
        let cs = candles(&[(100.0, 101.0), (101.0, 102.0), (102.0, 103.0), (103.0, 104.0)]);
        let streaks = group_streaks(&cs);

        assert_eq!(streaks.len(), 1);
        let current = streaks.last().unwrap();
        assert_eq!(current.color, CandleColor::Green);
        assert_eq!(current.length, 4);
    }

    #[test]
    fn streak_break_resets_length() {
        let cs = candles(&[(100.0, 101.0), (101.0, 102.0), (102.0, 103.0), (103.0, 102.0)]);
        let streaks = group_streaks(&cs);

        assert_eq!(streaks.len(), 2);
        let current = streaks.last().unwrap();
        assert_eq!(current.color, CandleColor::Red);
        assert_eq!(current.length, 1);
    }

    #[test]
    fn streak_lengths_partition_the_series() {
        let cs = candles(&[
            (1.0, 2.0),
            (2.0, 1.5),
            (1.5, 1.5),
            (1.5, 3.0),
            (3.0, 2.0),
            (2.0, 2.0),
            (2.0, 5.0),
        ]);
        let streaks = group_streaks(&cs);
        let total: usize = streaks.iter().map(|s| s.length).sum();
        assert_eq!(total, cs.len());
    }

    #[test]
    fn flat_candle_inherits_previous_color() {
        let cs = candles(&[(100.0, 99.0), (99.0, 99.0)]);
        let colors = color_series(&cs);
        assert_eq!(colors, vec![CandleColor::Red, CandleColor::Red]);
    }

    #[test]
    fn flat_first_candle_defaults_green() {
        let cs = candles(&[(100.0, 100.0), (100.0, 99.0)]);
        let colors = color_series(&cs);
        assert_eq!(colors[0], CandleColor::Green);
        assert_eq!(colors[1], CandleColor::Red);
    }

    #[test]
    fn streak_end_time_is_last_candle_open_time() {
        let cs = candles(&[(1.0, 2.0), (2.0, 3.0), (3.0, 2.0)]);
        let streaks = group_streaks(&cs);
        assert_eq!(streaks[0].end_time, 2 * 3_600_000);
        assert_eq!(streaks[1].end_time, 3 * 3_600_000);
        assert_eq!(streaks[1].start_index, 2);
    }

    #[test]
    fn no_precedent_means_undefined_probability() {
        // One green streak of length 3 — only the current streak reaches 3.
        let cs = candles(&[(1.0, 2.0), (2.0, 3.0), (3.0, 4.0)]);
        let streaks = group_streaks(&cs);
        let (cont, rev) = continuation_probability(&streaks, CandleColor::Green, 3);
        assert_eq!(cont, None);
        assert_eq!(rev, None);
    }

    #[test]
    fn probability_counts_reaching_and_continuing() {
        // Green streaks of lengths 1, 2, 3: at length 1, three reached and
        // two continued.
        let cs = candles(&[
            (1.0, 2.0), // G len 1
            (2.0, 1.0), // R
            (1.0, 2.0),
            (2.0, 3.0), // G len 2
            (3.0, 1.0), // R
            (1.0, 2.0),
            (2.0, 3.0),
            (3.0, 4.0), // G len 3 (current)
        ]);
        let streaks = group_streaks(&cs);
        let (cont, rev) = continuation_probability(&streaks, CandleColor::Green, 1);
        assert!((cont.unwrap() - 2.0 / 3.0).abs() < 1e-12);
        assert!((rev.unwrap() - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn curve_has_twelve_points() {
        let cs = candles(&[(1.0, 2.0), (2.0, 1.0), (1.0, 2.0)]);
        let streaks = group_streaks(&cs);
        let curve = probability_curve(&streaks, CandleColor::Green);
        assert_eq!(curve.len(), 12);
        assert_eq!(curve[0].length, 1);
        assert_eq!(curve[11].length, 12);
        // No green streak ever reached 12.
        assert_eq!(curve[11].prob, 0.0);
    }

    #[test]
    fn volatility_zero_when_undefined() {
        assert_eq!(volatility_pct(&[]), 0.0);
        assert_eq!(volatility_pct(&candles(&[(1.0, 2.0)])), 0.0);
    }

    #[test]
    fn volatility_of_constant_closes_is_zero() {
        let cs = candles(&[(1.0, 2.0), (2.0, 2.0), (2.0, 2.0), (2.0, 2.0)]);
        assert_eq!(volatility_pct(&cs), 0.0);
    }

    #[test]
    fn volatility_sample_stddev() {
        // Closes 100, 110, 99: returns +10% and -10%; sample std of
        // {0.1, -0.1} is 0.141421..., i.e. 14.1421 percent.
        let cs = candles(&[(99.0, 100.0), (100.0, 110.0), (110.0, 99.0)]);
        let vol = volatility_pct(&cs);
        assert!((vol - 14.142135623730951).abs() < 1e-9);
    }

    #[test]
    fn streak_stats() {
        let cs = candles(&[(1.0, 2.0), (2.0, 3.0), (3.0, 1.0)]);
        let streaks = group_streaks(&cs);
        assert_eq!(mean_streak_length(&streaks), 1.5);
        assert_eq!(max_streak_length(&streaks), 2);
        assert_eq!(max_streak_length(&[]), 0);
    }

    #[test]
    fn microtrends_use_lookbacks() {
        // Closes 1..20 then 5.0: below both the 5-back (17.0) and the
        // 15-back (7.0) reference closes.
        let mut pairs: Vec<(f64, f64)> = (0..20).map(|i| (i as f64, i as f64 + 1.0)).collect();
        pairs.push((50.0, 5.0));
        let cs = candles(&pairs);
        let mt = microtrends(&cs);
        assert_eq!(mt.m1, "down");
        assert_eq!(mt.m5, "down");
        assert_eq!(mt.m15, "down");

        let short = candles(&[(1.0, 2.0), (2.0, 3.0)]);
        let mt = microtrends(&short);
        assert_eq!(mt.m1, "up");
        assert_eq!(mt.m5, "flat");
        assert_eq!(mt.m15, "flat");
    }

    #[test]
    fn microtrend_horizons_diverge_on_a_pullback() {
        // Closes 1..20 then 10.0: below the 5-back close (17.0) but still
        // above the 15-back close (7.0), so the two horizons disagree.
        let mut pairs: Vec<(f64, f64)> = (0..20).map(|i| (i as f64, i as f64 + 1.0)).collect();
        pairs.push((50.0, 10.0));
        let mt = microtrends(&candles(&pairs));
        assert_eq!(mt.m5, "down");
        assert_eq!(mt.m15, "up");
    }

    #[test]
    fn whipsaw_counts_wick_dominated_candles() {
        // Body 1 over range 10 → wicky; body == range → not.
        let wicky = Candle {
            open_time: 1,
            open: 100.0,
            high: 108.0,
            low: 98.0,
            close: 101.0,
            volume: 1.0,
        };
        let solid = Candle {
            open_time: 2,
            open: 100.0,
            high: 110.0,
            low: 100.0,
            close: 110.0,
            volume: 1.0,
        };
        assert_eq!(whipsaw_probability_pct(&[wicky, solid]), 50.0);
        assert_eq!(whipsaw_probability_pct(&[]), 0.0);
    }

    #[test]
    fn staleness_threshold() {
        let hour = 3_600_000;
        assert!(!is_stale(0, 2 * hour, Timeframe::H1));
        assert!(is_stale(0, 2 * hour + 1, Timeframe::H1));
    }
}
