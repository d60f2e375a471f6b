// =============================================================================
// Binance REST Adapter — public market data endpoints
// =============================================================================
//
// Only unauthenticated endpoints are used (klines + ticker); no request
// signing is required. Kline arrays use Binance's array-of-arrays format:
//   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume, ...
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;
use crate::sources::{first_price_field, parse_str_f64, translate_symbol};
use crate::types::Timeframe;

const BASE_URL: &str = "https://api.binance.com";

/// HTTP timeout for candle requests (seconds).
const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
pub struct BinanceSource {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceSource {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Self {
            client,
            base_url: BASE_URL.to_string(),
        }
    }

    /// GET /api/v3/klines (public).
    #[instrument(skip(self), name = "binance::fetch_candles")]
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let pair = translate_symbol("binance", symbol);
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            pair,
            timeframe.as_str(),
            limit
        );
        if let Some(ts) = since {
            url.push_str(&format!("&startTime={ts}"));
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let raw = body.as_array().context("klines response is not an array")?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let arr = entry.as_array().context("kline entry is not an array")?;
            if arr.len() < 6 {
                warn!("skipping malformed kline entry with {} elements", arr.len());
                continue;
            }

            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0),
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[5])?,
            });
        }

        debug!(symbol, %timeframe, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /api/v3/ticker/24hr (public). Price priority: last trade, then
    /// previous close.
    #[instrument(skip(self), name = "binance::fetch_ticker")]
    pub async fn fetch_ticker(&self, symbol: &str) -> Result<f64> {
        let pair = translate_symbol("binance", symbol);
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.base_url, pair);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/ticker/24hr request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse ticker response")?;

        if !status.is_success() {
            anyhow::bail!(
                "Binance GET /api/v3/ticker/24hr returned {}: {}",
                status,
                body
            );
        }

        first_price_field(&body, &["lastPrice", "prevClosePrice", "weightedAvgPrice"])
            .context("no usable price field in Binance ticker")
    }
}

impl Default for BinanceSource {
    fn default() -> Self {
        Self::new()
    }
}
