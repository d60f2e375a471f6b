// =============================================================================
// Kraken REST Adapter — public market data endpoints
// =============================================================================
//
// Kraken wraps every payload as { "error": [...], "result": { ... } } and
// keys the OHLC rows under its own internal pair name (e.g. XXBTZUSD for
// XBTUSD), so the result object is scanned for the first non-"last" key.
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::market_data::Candle;
use crate::sources::{parse_str_f64, translate_symbol};
use crate::types::Timeframe;

const BASE_URL: &str = "https://api.kraken.com";

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Clone)]
pub struct KrakenSource {
    client: reqwest::Client,
    base_url: String,
}

impl KrakenSource {
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

    /// Kraken intervals are expressed in minutes.
    fn interval_minutes(timeframe: Timeframe) -> u32 {
        match timeframe {
            Timeframe::M15 => 15,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    /// Unwrap Kraken's envelope, surfacing its error array as a failure.
    fn unwrap_result(body: serde_json::Value) -> Result<serde_json::Value> {
        if let Some(errors) = body["error"].as_array() {
            if !errors.is_empty() {
                anyhow::bail!("Kraken API error: {errors:?}");
            }
        }
        body.get("result")
            .cloned()
            .context("Kraken response missing 'result'")
    }

    /// GET /0/public/OHLC (public).
    #[instrument(skip(self), name = "kraken::fetch_candles")]
    pub async fn fetch_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: u32,
        since: Option<i64>,
    ) -> Result<Vec<Candle>> {
        let pair = translate_symbol("kraken", symbol);
        let mut url = format!(
            "{}/0/public/OHLC?pair={}&interval={}",
            self.base_url,
            pair,
            Self::interval_minutes(timeframe)
        );
        if let Some(since_ms) = since {
            // Kraken takes seconds.
            url.push_str(&format!("&since={}", since_ms / 1000));
        }

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /0/public/OHLC request failed")?;

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse OHLC response")?;

        let result = Self::unwrap_result(body)?;

        // The rows live under Kraken's internal pair key; "last" is a cursor.
        let rows = result
            .as_object()
            .and_then(|obj| {
                obj.iter()
                    .find(|(k, _)| k.as_str() != "last")
                    .and_then(|(_, v)| v.as_array())
                    .cloned()
            })
            .context("no OHLC rows in Kraken result")?;

        let mut candles = Vec::with_capacity(rows.len().min(limit as usize));
        for entry in rows.iter().rev().take(limit as usize).rev() {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 7 => a,
                _ => {
                    warn!("skipping malformed OHLC row");
                    continue;
                }
            };

            // [time_s, open, high, low, close, vwap, volume, count]
            candles.push(Candle {
                open_time: arr[0].as_i64().unwrap_or(0) * 1000,
                open: parse_str_f64(&arr[1])?,
                high: parse_str_f64(&arr[2])?,
                low: parse_str_f64(&arr[3])?,
                close: parse_str_f64(&arr[4])?,
                volume: parse_str_f64(&arr[6])?,
            });
        }

        debug!(symbol, %timeframe, count = candles.len(), "OHLC fetched");
        Ok(candles)
    }

    /// GET /0/public/Ticker (public). `c[0]` is the last trade price.
    #[instrument(skip(self), name = "kraken::fetch_ticker")]
    pub async fn fetch_ticker(&self, symbol: &str) -> Result<f64> {
        let pair = translate_symbol("kraken", symbol);
        let url = format!("{}/0/public/Ticker?pair={}", self.base_url, pair);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /0/public/Ticker request failed")?;

        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse ticker response")?;

        let result = Self::unwrap_result(body)?;

        let ticker = result
            .as_object()
            .and_then(|obj| obj.values().next())
            .context("no ticker entry in Kraken result")?;

        // Priority: last trade (c), then today's open (o) as a stale fallback.
        let price = parse_str_f64(&ticker["c"][0])
            .or_else(|_| parse_str_f64(&ticker["o"]))
            .context("no usable price field in Kraken ticker")?;

        if price <= 0.0 {
            anyhow::bail!("Kraken returned non-positive price {price}");
        }
        Ok(price)
    }
}

impl Default for KrakenSource {
    fn default() -> Self {
        Self::new()
    }
}
