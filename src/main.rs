// =============================================================================
// Streakboard — Main Entry Point
// =============================================================================
//
// Candle-streak analytics service: merges OHLCV from several public
// exchanges, keeps a warm cache for the watched symbols, and serves streak
// statistics over HTTP.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod api;
mod app_state;
mod distribution;
mod live_sync;
mod market_data;
mod resample;
mod runtime_config;
mod sources;
mod stats;
mod streaks;
mod types;
mod watchdog;

use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::RuntimeConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║            Streakboard — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbols = ?config.symbols,
        bind_addr = %config.bind_addr,
        data_dir = %config.data_dir,
        "Configuration resolved"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = AppState::new(config);

    // Warm the cache from the last persisted blob so restarts serve data
    // before the first upstream round-trip completes.
    if let Err(e) = state.cache.load_blob(state.candle_blob_path()) {
        info!(error = %format!("{e:#}"), "no candle blob to restore, starting cold");
    }

    // ── 3. Background updater ────────────────────────────────────────────
    let updater_state = state.clone();
    tokio::spawn(async move {
        let (interval_secs, spacing_ms) = {
            let cfg = updater_state.config.read();
            (cfg.refresh_interval_secs, cfg.refresh_spacing_ms)
        };
        info!(interval_secs, "Background updater starting");

        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            interval.tick().await;

            updater_state.watchdog.check_proactive();

            if updater_state
                .run_refresh_cycle(Duration::from_millis(spacing_ms))
                .await
            {
                updater_state.watchdog.record_cycle_success();
            } else {
                updater_state.watchdog.record_cycle_error();
            }

            if let Err(e) = updater_state.cache.save_blob(updater_state.candle_blob_path()) {
                warn!(error = %format!("{e:#}"), "failed to persist candle blob");
            }
        }
    });

    // ── 4. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = state.config.read().bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.cache.save_blob(state.candle_blob_path()) {
        error!(error = %format!("{e:#}"), "Failed to save candle blob on shutdown");
    }
    if let Err(e) = state.distributions.save() {
        error!(error = %format!("{e:#}"), "Failed to save streak distributions on shutdown");
    }
    if let Err(e) = state.config.read().save("runtime_config.json") {
        error!(error = %format!("{e:#}"), "Failed to save runtime config on shutdown");
    }

    info!("Streakboard shut down complete.");
    Ok(())
}
