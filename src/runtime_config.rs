// =============================================================================
// Runtime Configuration — service settings with atomic save
// =============================================================================
//
// Everything an operator tunes lives here: watched symbols, the HTTP bind
// address, the data directory, and the background refresh cadence.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash.  All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.  `STREAKBOARD_*` environment
// variables override the file on startup.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTC".to_string(),
        "ETH".to_string(),
        "SOL".to_string(),
        "XRP".to_string(),
    ]
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_data_dir() -> String {
    // Containers mount a volume at /data; bare-metal runs fall back to the
    // working directory.
    if Path::new("/data").is_dir() {
        "/data".to_string()
    } else {
        ".".to_string()
    }
}

fn default_refresh_interval_secs() -> u64 {
    15
}

fn default_refresh_spacing_ms() -> u64 {
    1000
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the streakboard service.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbols the background updater keeps warm (base symbols, not
    /// provider pairs).
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// HTTP listen address.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory holding the candle blob and the streak distribution file.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Seconds between background refresh cycles.
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Milliseconds between per-key refreshes inside one cycle, to spread
    /// upstream load.
    #[serde(default = "default_refresh_spacing_ms")]
    pub refresh_spacing_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            refresh_interval_secs: default_refresh_interval_secs(),
            refresh_spacing_ms: default_refresh_spacing_ms(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Apply `STREAKBOARD_*` environment overrides on top of whatever the
    /// file (or defaults) provided.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(symbols) = std::env::var("STREAKBOARD_SYMBOLS") {
            let parsed: Vec<String> = symbols
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.symbols = parsed;
            }
        }
        if let Ok(addr) = std::env::var("STREAKBOARD_BIND_ADDR") {
            if !addr.trim().is_empty() {
                self.bind_addr = addr.trim().to_string();
            }
        }
        if let Ok(dir) = std::env::var("STREAKBOARD_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = dir.trim().to_string();
            }
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols, vec!["BTC", "ETH", "SOL", "XRP"]);
        assert_eq!(cfg.bind_addr, "0.0.0.0:8000");
        assert_eq!(cfg.refresh_interval_secs, 15);
        assert_eq!(cfg.refresh_spacing_ms, 1000);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols.len(), 4);
        assert_eq!(cfg.refresh_interval_secs, 15);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["DOGE"], "refresh_interval_secs": 30 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["DOGE"]);
        assert_eq!(cfg.refresh_interval_secs, 30);
        assert_eq!(cfg.bind_addr, "0.0.0.0:8000");
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
        assert_eq!(cfg.refresh_interval_secs, cfg2.refresh_interval_secs);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.symbols = vec!["BTC".to_string()];
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["BTC"]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(RuntimeConfig::load("/definitely/not/here.json").is_err());
    }
}
