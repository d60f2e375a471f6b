// =============================================================================
// Shared Core Types — Timeframes and series keys
// =============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// Timeframe
// =============================================================================

/// Candle bucket duration supported by the engine.
///
/// `M15` and `H1` are fetched natively from the upstream exchanges; `H4` and
/// `D1` are derived from the `H1` base series by the resampler and are never
/// requested upstream.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    M15,
    H1,
    H4,
    D1,
}

impl Timeframe {
    /// All timeframes the engine serves, in ascending duration order.
    pub const ALL: [Timeframe; 4] = [
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H4,
        Timeframe::D1,
    ];

    /// The base timeframe that derived series are resampled from.
    pub const BASE: Timeframe = Timeframe::H1;

    /// Canonical string form (matches the exchange interval notation).
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M15 => "15m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Bucket duration in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Timeframe::M15 => 15 * 60 * 1000,
            Timeframe::H1 => 60 * 60 * 1000,
            Timeframe::H4 => 4 * 60 * 60 * 1000,
            Timeframe::D1 => 24 * 60 * 60 * 1000,
        }
    }

    /// Whether this timeframe is derived from the base series instead of
    /// being fetched upstream.
    pub fn is_derived(&self) -> bool {
        matches!(self, Timeframe::H4 | Timeframe::D1)
    }
}

impl FromStr for Timeframe {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "15m" => Ok(Timeframe::M15),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => anyhow::bail!("unknown timeframe '{other}'"),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Timeframe> for String {
    fn from(tf: Timeframe) -> Self {
        tf.as_str().to_string()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CandleKey
// =============================================================================

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }

    /// Parse the persisted `"SYMBOL_tf"` form back into a key.
    pub fn parse(s: &str) -> Option<Self> {
        let (symbol, tf) = s.rsplit_once('_')?;
        Some(Self {
            symbol: symbol.to_string(),
            timeframe: tf.parse().ok()?,
        })
    }
}

impl fmt::Display for CandleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.symbol, self.timeframe)
    }
}
