//! Pipeline entry points for sync operations.
//!
//! - `run_daemon`: sweeper, periodic resyncs and fetch workers until Ctrl-C
//! - `run_resync`: one bulk resync, worked until the queues are idle
//! - `run_refresh`: one demand-driven refresh, worked until the queues are idle

pub mod engine;
pub mod scheduler;
pub mod sweeper;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::Result;
use crate::models::JobPayload;
use crate::queue::EnqueueOutcome;

pub use engine::Engine;
pub use scheduler::{CrawlScheduler, ResyncTarget, ScheduleReport};
pub use sweeper::{run_sweeper, sweep_once};
pub use worker::{BatchReport, FetchWorker, Handled};

/// Run every background task until Ctrl-C.
pub async fn run_daemon(engine: Arc<Engine>) -> Result<()> {
    log::info!("Starting sync daemon");
    sweep_once(&engine).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    {
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { run_sweeper(&engine, shutdown).await }));
    }

    let scheduler = &engine.config.scheduler;
    let schedule = [
        (ResyncTarget::Realms, scheduler.realm_interval_secs),
        (ResyncTarget::Characters, scheduler.character_interval_secs),
        (ResyncTarget::Guilds, scheduler.guild_interval_secs),
        (ResyncTarget::Items, scheduler.item_interval_secs),
        (ResyncTarget::Auctions, scheduler.auction_interval_secs),
        (ResyncTarget::Commodity, scheduler.auction_interval_secs),
    ];
    for (target, secs) in schedule {
        let engine = engine.clone();
        let shutdown = shutdown_rx.clone();
        let period = Duration::from_secs(secs.max(1));
        tasks.push(tokio::spawn(async move {
            run_periodic(&engine, target, period, shutdown).await
        }));
    }

    {
        let worker = FetchWorker::new(engine.clone());
        let idle = Duration::from_millis(engine.config.workers.idle_poll_ms);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { run_workers(worker, idle, shutdown).await }));
    }

    tokio::signal::ctrl_c().await?;
    log::info!("Shutdown requested; in-flight jobs run to completion");
    let _ = shutdown_tx.send(true);

    for task in tasks {
        if let Err(e) = task.await {
            log::error!("Background task failed: {}", e);
        }
    }
    log::info!("Sync daemon stopped");
    Ok(())
}

/// Run one bulk resync and work the queues until idle.
pub async fn run_resync(
    engine: Arc<Engine>,
    target: ResyncTarget,
) -> Result<(ScheduleReport, BatchReport)> {
    sweep_once(&engine).await;
    let scheduled = engine.scheduler.resync(target).await?;
    let worked = FetchWorker::new(engine).run_until_idle().await?;
    log::info!("Resync {} finished: {}", target, worked);
    Ok((scheduled, worked))
}

/// Run one demand-driven refresh and work the queues until idle.
pub async fn run_refresh(
    engine: Arc<Engine>,
    payload: JobPayload,
) -> Result<(EnqueueOutcome, BatchReport)> {
    sweep_once(&engine).await;
    let outcome = engine.scheduler.request_refresh(payload).await?;
    let worked = FetchWorker::new(engine).run_until_idle().await?;
    Ok((outcome, worked))
}

async fn run_periodic(
    engine: &Engine,
    target: ResyncTarget,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = engine.scheduler.resync(target).await {
                    log::warn!("Resync {} failed: {}", target, e);
                }
            }
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

async fn run_workers(worker: FetchWorker, idle: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match worker.run_once().await {
            Ok(report) if report.taken > 0 => continue,
            Ok(_) => {}
            Err(e) => log::error!("Worker pass failed: {}", e),
        }
        tokio::select! {
            _ = tokio::time::sleep(idle) => {}
            _ = shutdown.changed() => break,
        }
    }
    log::debug!("Fetch workers stopped");
}
