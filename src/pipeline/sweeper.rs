// src/pipeline/sweeper.rs

//! Periodic credential maintenance.

use std::time::Duration;

use tokio::sync::watch;

use crate::services::SweepReport;

use super::engine::Engine;

/// Close elapsed circuits, open tripped ones, then refresh tokens that are about to expire.
pub async fn sweep_once(engine: &Engine) -> SweepReport {
    let report = engine.pool.sweep().await;
    let refreshed = engine.pool.refresh_expiring(engine.auth.as_ref()).await;
    if report != SweepReport::default() || refreshed > 0 {
        log::info!(
            "Credential sweep: {} reset, {} tripped, {} tokens refreshed",
            report.reset,
            report.tripped,
            refreshed
        );
    }
    report
}

/// Sweep on the configured interval until `shutdown` flips to true.
pub async fn run_sweeper(engine: &Engine, mut shutdown: watch::Receiver<bool>) {
    let period = Duration::from_secs(engine.config.pool.sweep_interval_secs.max(1));
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                sweep_once(engine).await;
            }
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
    log::debug!("Credential sweeper stopped");
}
