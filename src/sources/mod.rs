// =============================================================================
// Market Data Sources — provider adapters and the source pool
// =============================================================================
//
// Each upstream exchange gets its own REST adapter; `SourceClient` wraps them
// as tagged variants so the aggregator can fan out over a uniform capability
// surface (`fetch_candles` / `fetch_ticker` / `supports`). A failing client is
// always a local failure: the pool never propagates one provider's error.
// =============================================================================

pub mod binance;
pub mod coinbase;
pub mod kraken;

#[cfg(test)]
pub mod mock;

use anyhow::Result;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;

use crate::market_data::Candle;
use crate::types::Timeframe;

pub use binance::BinanceSource;
pub use coinbase::CoinbaseSource;
pub use kraken::KrakenSource;

// =============================================================================
// Symbol translation
// =============================================================================

/// Static generic-symbol → provider-pair mapping for the majors, with a
/// provider-specific default for anything unmapped.
///
/// Accepts both `BTC` and `BTC/USD`-style inputs (only the base is used).
pub fn translate_symbol(provider: &str, symbol: &str) -> String {
    let base = symbol.split('/').next().unwrap_or(symbol).to_uppercase();

    let mapped = match (provider, base.as_str()) {
        ("binance", "BTC") => Some("BTCUSDT"),
        ("binance", "ETH") => Some("ETHUSDT"),
        ("binance", "SOL") => Some("SOLUSDT"),
        ("binance", "XRP") => Some("XRPUSDT"),
        ("coinbase", "BTC") => Some("BTC-USD"),
        ("coinbase", "ETH") => Some("ETH-USD"),
        ("coinbase", "SOL") => Some("SOL-USD"),
        ("coinbase", "XRP") => Some("XRP-USD"),
        ("kraken", "BTC") => Some("XBTUSD"),
        ("kraken", "ETH") => Some("ETHUSD"),
        ("kraken", "SOL") => Some("SOLUSD"),
        ("kraken", "XRP") => Some("XRPUSD"),
        _ => None,
    };

    match mapped {
        Some(pair) => pair.to_string(),
        // Default fallback when the map misses.
        None => match provider {
            "binance" => format!("{base}USDT"),
            "coinbase" => format!("{base}-USD"),
            _ => format!("{base}USD"),
        },
    }
}

// =============================================================================
// Ticker price extraction
// =============================================================================

/// Pull the first positive price out of a ticker object, trying `keys` in
/// order. Providers disagree on naming (last trade, close, mark, index);
/// each adapter passes its own priority list.
pub fn first_price_field(ticker: &Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        let v = &ticker[*key];
        let price = if let Some(s) = v.as_str() {
            s.parse::<f64>().ok()
        } else {
            v.as_f64()
        };
        if let Some(p) = price {
            if p > 0.0 {
                return Some(p);
            }
        }
    }
    None
}

/// Parse a JSON value that may be either a string or a number into `f64`.
pub(crate) fn parse_str_f64(val: &Value) -> Result<f64> {
    if let Some(s) = val.as_str() {
        s.parse::<f64>()
            .map_err(|e| anyhow::anyhow!("failed to parse '{s}' as f64: {e}"))
    } else if let Some(n) = val.as_f64() {
        Ok(n)
    } else {
        anyhow::bail!("expected string or number, got: {val}")
    }
}

// =============================================================================
// SourceClient — tagged capability wrapper
// =============================================================================

/// One external market-data provider. Variants own their connection lifecycle
/// (a dedicated `reqwest::Client`), created at startup or on watchdog restart.
#[derive(Clone)]
pub enum SourceClient {
    Binance(BinanceSource),
    Coinbase(CoinbaseSource),
    Kraken(KrakenSource),
    #[cfg(test)]
    Mock(mock::MockSource),
}

impl SourceClient {
    /// Stable provider identifier (used for symbol mapping and logging).
    pub fn id(&self) -> &'static str {
        match self {
            SourceClient::Binance(_) => "binance",
            SourceClient::Coinbase(_) => "coinbase",
            SourceClient::Kraken(_) => "kraken",
            #[cfg(test)]
            SourceClient::Mock(m) => m.id(),
        }
    }

    /// Whether this provider can serve `timeframe` natively. Unsupported
    /// timeframes mean "skip this client", never an error.
    pub fn supports(&self, timeframe: Timeframe) -> bool {
        match self {
            SourceClient::Binance(_) => true,
            SourceClient::Coinbase(c) => c.supports(timeframe),
            SourceClient::Kraken(_) => true,
            #[cfg(test)]
            SourceClient::Mock(m) => m.supports(timeframe),
        }
    }

    /// Fetch up to `limit` candles for a generic symbol, newest last.
    /// `since` is a UTC open-time lower bound in milliseconds (inclusive).
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Candle>> {
        match self {
            SourceClient::Binance(c) => c.fetch_candles(symbol, timeframe, limit, since).await,
            SourceClient::Coinbase(c) => c.fetch_candles(symbol, timeframe, limit, since).await,
            SourceClient::Kraken(c) => c.fetch_candles(symbol, timeframe, limit, since).await,
            #[cfg(test)]
            SourceClient::Mock(m) => m.fetch_candles(symbol, timeframe, limit, since).await,
        }
    }

    /// Fetch the latest traded price for a generic symbol.
    pub async fn fetch_ticker(&self, symbol: &str) -> Result<f64> {
        match self {
            SourceClient::Binance(c) => c.fetch_ticker(symbol).await,
            SourceClient::Coinbase(c) => c.fetch_ticker(symbol).await,
            SourceClient::Kraken(c) => c.fetch_ticker(symbol).await,
            #[cfg(test)]
            SourceClient::Mock(m) => m.fetch_ticker(symbol).await,
        }
    }
}

impl std::fmt::Debug for SourceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SourceClient").field(&self.id()).finish()
    }
}

// =============================================================================
// SourcePool
// =============================================================================

/// Ordered collection of source clients shared across the engine.
///
/// `restart` swaps in freshly constructed clients behind the lock; in-flight
/// requests keep using their cloned snapshot, so a restart never blocks or
/// fails ongoing reads.
pub struct SourcePool {
    clients: RwLock<Vec<SourceClient>>,
}

impl SourcePool {
    /// Build the default pool: Coinbase → Kraken → Binance priority order.
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(Self::build_clients()),
        }
    }

    /// Build a pool from explicit clients (mock pools in tests).
    #[cfg(test)]
    pub fn with_clients(clients: Vec<SourceClient>) -> Self {
        Self {
            clients: RwLock::new(clients),
        }
    }

    fn build_clients() -> Vec<SourceClient> {
        vec![
            SourceClient::Coinbase(CoinbaseSource::new()),
            SourceClient::Kraken(KrakenSource::new()),
            SourceClient::Binance(BinanceSource::new()),
        ]
    }

    /// Snapshot of the current clients. Cloning is cheap (`reqwest::Client`
    /// is a handle); callers never hold the lock across an await.
    pub fn clients(&self) -> Vec<SourceClient> {
        self.clients.read().clone()
    }

    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    /// Drop all current clients and recreate them with fresh sessions.
    pub fn restart(&self) {
        let fresh = Self::build_clients();
        let count = fresh.len();
        *self.clients.write() = fresh;
        info!(clients = count, "source pool restarted with fresh clients");
    }
}

impl Default for SourcePool {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn translate_known_symbols() {
        assert_eq!(translate_symbol("binance", "BTC"), "BTCUSDT");
        assert_eq!(translate_symbol("coinbase", "BTC"), "BTC-USD");
        assert_eq!(translate_symbol("kraken", "BTC"), "XBTUSD");
        assert_eq!(translate_symbol("kraken", "ETH"), "ETHUSD");
    }

    #[test]
    fn translate_falls_back_per_provider() {
        assert_eq!(translate_symbol("binance", "DOGE"), "DOGEUSDT");
        assert_eq!(translate_symbol("coinbase", "DOGE"), "DOGE-USD");
        assert_eq!(translate_symbol("kraken", "DOGE"), "DOGEUSD");
    }

    #[test]
    fn translate_strips_pair_suffix() {
        assert_eq!(translate_symbol("binance", "BTC/USD"), "BTCUSDT");
    }

    #[test]
    fn price_field_priority_order() {
        let ticker = json!({ "last": null, "close": "101.5", "mark": 99.0 });
        let p = first_price_field(&ticker, &["last", "close", "mark", "index"]);
        assert_eq!(p, Some(101.5));
    }

    #[test]
    fn price_field_skips_non_positive() {
        let ticker = json!({ "last": "0", "mark": 42.0 });
        let p = first_price_field(&ticker, &["last", "close", "mark"]);
        assert_eq!(p, Some(42.0));
        assert_eq!(first_price_field(&json!({}), &["last"]), None);
    }

    #[test]
    fn pool_restart_replaces_clients() {
        let pool = SourcePool::new();
        assert_eq!(pool.len(), 3);
        pool.restart();
        assert_eq!(pool.len(), 3);
        let ids: Vec<&str> = pool.clients().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec!["coinbase", "kraken", "binance"]);
    }
}
