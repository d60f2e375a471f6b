// =============================================================================
// Distribution Store — persistent streak-length frequency histograms
// =============================================================================
//
// One entry per "{symbol}_{timeframe}" key, split by color. A watermark
// (`last_processed_ts`) makes folding idempotent: refetches overlap the
// candle history constantly, so only streaks ending strictly after the
// watermark are counted. The final (in-progress) streak of a series is never
// folded — it hasn't finished yet.
//
// The file is written synchronously after every mutating fold via the usual
// tmp+rename dance; a write failure is logged and otherwise ignored.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::streaks::{CandleColor, Streak};
use crate::types::CandleKey;

// ---------------------------------------------------------------------------
// Persisted shapes
// ---------------------------------------------------------------------------

/// Frequency histogram for one color. Keys are streak lengths as strings
/// (JSON object keys), values in `last_happened` are UTC ms of the most
/// recent streak of that length.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ColorHistory {
    #[serde(default)]
    pub counts: HashMap<String, u64>,
    #[serde(default)]
    pub last_happened: HashMap<String, i64>,
}

impl ColorHistory {
    fn record(&mut self, length: usize, end_time: i64) {
        let key = length.to_string();
        *self.counts.entry(key.clone()).or_insert(0) += 1;
        let slot = self.last_happened.entry(key).or_insert(end_time);
        if end_time > *slot {
            *slot = end_time;
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyHistory {
    /// Watermark: end time (UTC ms) of the newest streak ever folded.
    #[serde(default)]
    pub last_processed_ts: i64,
    #[serde(default)]
    pub green: ColorHistory,
    #[serde(default)]
    pub red: ColorHistory,
}

/// One row of the read-side distribution view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionRow {
    pub length: u32,
    pub count: u64,
    /// `DD.MM.YYYY` of the most recent occurrence, when known.
    pub last_happened: Option<String>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct DistributionStore {
    path: PathBuf,
    history: RwLock<HashMap<String, KeyHistory>>,
}

impl DistributionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            history: RwLock::new(HashMap::new()),
        }
    }

    /// Load the histogram file if present. A missing file is a fresh start,
    /// not an error.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let history = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, KeyHistory>>(&raw) {
                Ok(map) => {
                    info!(keys = map.len(), path = %path.display(), "loaded streak distributions");
                    map
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "distribution file unreadable, starting empty");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            history: RwLock::new(history),
        }
    }

    /// Fold completed streaks into the histogram for `key`. The final streak
    /// of the slice is skipped (still in progress), and anything at or below
    /// the watermark was already counted by a previous fold.
    pub fn fold(&self, key: &CandleKey, streaks: &[Streak]) {
        let completed = match streaks.split_last() {
            Some((_current, rest)) => rest,
            None => return,
        };

        let mut dirty = false;
        {
            let mut history = self.history.write();
            let entry = history.entry(key.to_string()).or_default();

            for streak in completed {
                if streak.end_time <= entry.last_processed_ts {
                    continue;
                }
                match streak.color {
                    CandleColor::Green => entry.green.record(streak.length, streak.end_time),
                    CandleColor::Red => entry.red.record(streak.length, streak.end_time),
                }
                entry.last_processed_ts = streak.end_time;
                dirty = true;
            }
        }

        if dirty {
            debug!(%key, "folded new streaks into distribution");
            if let Err(e) = self.save() {
                warn!(error = %e, "failed to persist streak distributions");
            }
        }
    }

    /// Counts and last-occurrence dates for one color, ascending by length.
    pub fn distribution_for(&self, key: &CandleKey, color: CandleColor) -> Vec<DistributionRow> {
        let history = self.history.read();
        let Some(entry) = history.get(&key.to_string()) else {
            return Vec::new();
        };
        let side = match color {
            CandleColor::Green => &entry.green,
            CandleColor::Red => &entry.red,
        };

        // BTreeMap keyed by numeric length for the ascending order.
        let mut sorted: BTreeMap<u32, u64> = BTreeMap::new();
        for (len, count) in &side.counts {
            if let Ok(len) = len.parse::<u32>() {
                sorted.insert(len, *count);
            }
        }

        sorted
            .into_iter()
            .map(|(length, count)| DistributionRow {
                length,
                count,
                last_happened: side
                    .last_happened
                    .get(&length.to_string())
                    .and_then(|ms| format_day(*ms)),
            })
            .collect()
    }

    pub fn save(&self) -> Result<()> {
        let snapshot = self.history.read().clone();
        let json = serde_json::to_string_pretty(&snapshot)
            .context("failed to serialize streak distributions")?;
        write_atomic(&self.path, &json)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    #[cfg(test)]
    pub fn watermark(&self, key: &CandleKey) -> i64 {
        self.history
            .read()
            .get(&key.to_string())
            .map(|e| e.last_processed_ts)
            .unwrap_or(0)
    }
}

fn format_day(ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map(|dt| dt.format("%d.%m.%Y").to_string())
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
