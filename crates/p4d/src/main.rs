mod aggregate;
mod alerts;
mod clock;
mod commands;
mod config;
mod db;
mod homematic;
mod link;
mod mail;
mod params;
mod protocol;
mod refresh;
mod scheduler;
mod sim;
mod state;
mod worker;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use clock::now_unix;
use homematic::{DisabledSysVars, SysVarSource};
use link::DeviceArbiter;
use scheduler::ControlLoop;
use sim::{Profile, SimulatedController};
use state::SystemState;
use worker::JobWorker;

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "p4d.toml".to_string());
    let mut cfg = config::load(&config_path)?;
    cfg.apply_env();
    cfg.validate()?;

    // ── Controller link ─────────────────────────────────────────────
    let profile = Profile::from_str_lossy(&env::var("SIM_PROFILE").unwrap_or_default());
    let controller = SimulatedController::heating_plant_with(profile);
    let arbiter = Arc::new(DeviceArbiter::new(&cfg.tty_device, Box::new(controller)));
    let sysvars: Arc<dyn SysVarSource> = Arc::new(DisabledSysVars);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        db = %cfg.db_url,
        device = %cfg.tty_device,
        %profile,
        "p4d starting"
    );

    // ── Shutdown ────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
        shutdown.cancel();
    });

    // ── Tasks ───────────────────────────────────────────────────────
    let shared = SystemState::shared(now_unix());

    let worker = JobWorker::new(&cfg.db_url, Arc::clone(&arbiter), Arc::clone(&shared), Arc::clone(&sysvars))
        .with_poll_interval(Duration::from_secs(cfg.job_poll_interval))
        .start(cancel.child_token());

    ControlLoop::new(cfg, arbiter, shared, sysvars).run(cancel).await;

    if !worker.stop().await {
        warn!("job worker aborted");
    }
    info!("p4d stopped");
    Ok(())
}
