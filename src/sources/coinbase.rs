// =============================================================================
// Coinbase Exchange REST Adapter — public market data endpoints
// =============================================================================
//
// Candle rows come back as [time_s, low, high, open, close, volume], newest
// first, capped at 300 rows per request. The granularity set is fixed
// (60/300/900/3600/21600/86400): there is no native 4h candle, so this
// adapter reports `H4` as unsupported and the pool skips it.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;
use crate::sources::{first_price_field, translate_symbol};
use crate::types::Timeframe;

const BASE_URL: &str = "https://api.exchange.coinbase.com";

const REQUEST_TIMEOUT_SECS: u64 = 10;

/// Coinbase caps candle responses at 300 rows regardless of the requested
/// window.
const MAX_ROWS: u32 = 300;

#[derive(Clone)]
pub struct CoinbaseSource {
    client: reqwest::Client,
    base_url: String,
}

impl CoinbaseSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent("streakboard/1.0")
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: BASE_URL.to_string(),
        }
    }

    /// Native granularity in seconds, if Coinbase supports this timeframe.
    fn granularity(timeframe: Timeframe) -> Option<u32> {
        match timeframe {
            Timeframe::M15 => Some(900),
            Timeframe::H1 => Some(3600),
            Timeframe::H4 => None,
            Timeframe::D1 => Some(86400),
        }
    }

    pub fn supports(&self, timeframe: Timeframe) -> bool {
        Self::granularity(timeframe).is_some()
    }

    /// GET /products/{pair}/candles (public).
    #[instrument(skip(self), name = "coinbase::fetch_candles")]
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let granularity = Self::granularity(timeframe)
            .with_context(|| format!("Coinbase does not support {timeframe} candles"))?;

        let pair = translate_symbol("coinbase", symbol);
        let mut url = format!(
            "{}/products/{}/candles?granularity={}",
            self.base_url, pair, granularity
        );

        // Coinbase windows are expressed as ISO-8601 start/end; without them
        // it returns the most recent rows.
        if let Some(since_ms) = since {
            let rows = limit.min(MAX_ROWS) as i64;
            let start = DateTime::<Utc>::from_timestamp_millis(since_ms)
                .context("since timestamp out of range")?;
            let end_ms = since_ms + rows * i64::from(granularity) * 1000;
            let end = DateTime::<Utc>::from_timestamp_millis(end_ms.min(Utc::now().timestamp_millis()))
                .unwrap_or_else(Utc::now);
            url.push_str(&format!(
                "&start={}&end={}",
                start.to_rfc3339(),
                end.to_rfc3339()
            ));
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /products/{pair}/candles request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse candles response")?;

        if !status.is_success() {
            anyhow::bail!("Coinbase candles returned {}: {}", status, body);
        }

        let raw = body.as_array().context("candles response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("candle entry is not an array")?;
            if arr.len() < 6 {
                warn!("skipping malformed candle entry with {} elements", arr.len());
                continue;
            }

            // [time, low, high, open, close, volume], time in seconds.
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0) * 1000,
                low: arr[1].as_f64().unwrap_or(0.0),
                high: arr[2].as_f64().unwrap_or(0.0),
                open: arr[3].as_f64().unwrap_or(0.0),
                close: arr[4].as_f64().unwrap_or(0.0),
                volume: arr[5].as_f64().unwrap_or(0.0),
            });
        }

        // Newest-first on the wire; callers expect ascending open_time.
        candles.sort_by_key(|c| c.open_time);

        debug!(symbol, %timeframe, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    /// GET /products/{pair}/ticker (public).
    #[instrument(skip(self), name = "coinbase::fetch_ticker")]
    pub async fn fetch_ticker(&self, symbol: &str) -> Result<f64> {
        let pair = translate_symbol("coinbase", symbol);
        let url = format!("{}/products/{}/ticker", self.base_url, pair);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /products/{pair}/ticker request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse ticker response")?;

        if !status.is_success() {
            anyhow::bail!("Coinbase ticker returned {}: {}", status, body);
        }

        first_price_field(&body, &["price", "last", "bid"])
            .context("no usable price field in Coinbase ticker")
    }
}

impl Default for CoinbaseSource {
    fn default() -> Self {
        Self::new()
    }
}
