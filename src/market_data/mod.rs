pub mod candle_cache;

// Re-export for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_cache::{Candle, CandleCache};
