//! Control loop: polls the controller, stores samples and runs the periodic
//! housekeeping (alerts, aggregation, HomeMatic sync).
//!
//! ## Phases
//!
//! ```text
//! Initializing ──[store open]──▶ Connected ──▶ Polling ⇄ Standby
//!      ▲                                          │         │
//!      └──────────[store lost]────────────────────┴─────────┘
//!
//! any phase ──[cancel]──▶ ShuttingDown
//! ```
//!
//! Standby sleeps toward the next tick in 1s steps. Each step it handles
//! trigger flags set by the job worker, and every `state_check_interval`
//! seconds it asks the controller whether its state changed, which cuts
//! the standby short.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregate::{aggregate, next_aggregate_at};
use crate::alerts::AlertEngine;
use crate::clock::now_unix;
use crate::config::{Config, RuntimeConfig};
use crate::db::{
    Db, ValueFact, STATUS_MODE, STATUS_STATE, TYPE_ANL_OUT, TYPE_DIG_IN, TYPE_DIG_OUT,
    TYPE_STATUS, TYPE_VALUE,
};
use crate::homematic::{sync_sys_vars, SysVarSource};
use crate::link::DeviceArbiter;
use crate::mail::{send_mail, MIME_HTML, MIME_TEXT};
use crate::params::MenuKind;
use crate::protocol::{ControllerStatus, ProtocolClient, ProtocolResult};
use crate::refresh::{init_menu, update_schema_conf, update_value_facts};
use crate::state::SharedState;

const STANDBY_STEP: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Connected,
    Polling,
    Standby,
    ShuttingDown,
}

/// One stored reading of a poll cycle.
#[derive(Debug, Clone, PartialEq)]
struct Reading {
    kind: String,
    address: i64,
    value: f64,
    factor: i64,
    text: Option<String>,
}

struct Cycle {
    status: ControllerStatus,
    readings: Vec<Reading>,
}

pub struct ControlLoop {
    cfg: Config,
    arbiter: Arc<DeviceArbiter>,
    shared: SharedState,
    sysvars: Arc<dyn SysVarSource>,
    runtime: RuntimeConfig,
    alerts: AlertEngine,
    phase: Phase,
    next_at: i64,
    next_aggregate: Option<i64>,
    next_hm_sync: i64,
    last_state: Option<i32>,
    time_sync_pending: bool,
}

impl ControlLoop {
    pub fn new(
        cfg: Config,
        arbiter: Arc<DeviceArbiter>,
        shared: SharedState,
        sysvars: Arc<dyn SysVarSource>,
    ) -> Self {
        let runtime = RuntimeConfig::default();
        Self {
            alerts: AlertEngine::new(&runtime),
            cfg,
            arbiter,
            shared,
            sysvars,
            runtime,
            phase: Phase::Initializing,
            next_at: 0,
            next_aggregate: None,
            next_hm_sync: 0,
            last_state: None,
            time_sync_pending: false,
        }
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "control loop phase");
            self.phase = phase;
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            device = %self.arbiter.device(),
            interval_sec = self.cfg.interval,
            "control loop started"
        );

        'connect: loop {
            self.enter(Phase::Initializing);
            let Some(db) = Db::connect_with_retry(&self.cfg.db_url, &cancel, "control loop").await else {
                break;
            };

            self.enter(Phase::Connected);
            if let Err(e) = self.on_connected(&db, now_unix()).await {
                warn!(error = %format!("{e:#}"), "initialization after connect incomplete");
            }

            loop {
                if cancel.is_cancelled() {
                    db.close().await;
                    break 'connect;
                }
                if !db.ping().await {
                    warn!("control loop lost its store connection, reconnecting");
                    db.close().await;
                    continue 'connect;
                }

                self.enter(Phase::Polling);
                if let Err(e) = self.tick(&db, now_unix()).await {
                    warn!(error = %format!("{e:#}"), "poll cycle failed");
                }

                self.enter(Phase::Standby);
                if !self.standby(&db, &cancel).await {
                    db.close().await;
                    break 'connect;
                }
            }
        }

        self.enter(Phase::ShuttingDown);
        info!("control loop stopped");
    }

    // -----------------------------------------------------------------------
    // Connected
    // -----------------------------------------------------------------------

    async fn on_connected(&mut self, db: &Db, now: i64) -> Result<()> {
        self.reload_config(db, now).await?;

        if db.count_menu_items().await? == 0 {
            if let Err(e) = init_menu(db, &self.arbiter).await {
                warn!(error = %format!("{e:#}"), "menu initialization failed");
            }
        }
        if db.value_facts(false).await?.is_empty() {
            if let Err(e) = update_value_facts(db, &self.arbiter).await {
                warn!(error = %format!("{e:#}"), "value fact initialization failed");
            }
        }
        Ok(())
    }

    async fn reload_config(&mut self, db: &Db, now: i64) -> Result<()> {
        self.runtime = RuntimeConfig::load(db).await?;
        self.alerts.configure(&self.runtime);
        self.schedule_aggregate(now);
        self.next_hm_sync = now;
        debug!(runtime = ?self.runtime, "runtime config loaded");
        Ok(())
    }

    fn schedule_aggregate(&mut self, now: i64) {
        self.next_aggregate =
            next_aggregate_at(now, self.cfg.aggregate_interval, self.cfg.aggregate_history);
        if let Some(at) = self.next_aggregate {
            debug!(at, "next aggregation scheduled");
        }
    }

    // -----------------------------------------------------------------------
    // Polling
    // -----------------------------------------------------------------------

    async fn tick(&mut self, db: &Db, now: i64) -> Result<()> {
        let facts = db.value_facts(true).await?;
        let sync_time = std::mem::take(&mut self.time_sync_pending);

        let cycle = match self
            .arbiter
            .request(|c| read_cycle(c, &facts, sync_time, now))
            .await
        {
            Ok(cycle) => cycle,
            Err(e) => {
                warn!(error = %e, "controller not reachable, skipping poll");
                self.time_sync_pending |= sync_time;
                self.schedule_next(now).await;
                return Ok(());
            }
        };

        for r in &cycle.readings {
            db.insert_sample(now, &r.kind, r.address, r.value, r.factor, r.text.as_deref())
                .await?;
        }
        self.shared.write().await.record_status(cycle.status.clone());
        debug!(samples = cycle.readings.len(), state = cycle.status.state, "poll done");

        self.check_state_mail(db, &cycle.status).await;
        self.check_drift(&cycle.status, now);

        if let Err(e) = self.alerts.sensor_alert_check(db, now).await {
            warn!(error = %format!("{e:#}"), "sensor alert check failed");
        }
        self.maybe_aggregate(db, now).await;
        self.maybe_sync_homematic(db, now).await;

        self.schedule_next(now).await;
        Ok(())
    }

    async fn schedule_next(&mut self, now: i64) {
        self.next_at = now + self.cfg.interval as i64;
        self.shared.write().await.next_at = self.next_at;
    }

    fn check_drift(&mut self, status: &ControllerStatus, now: i64) {
        let drift = status.time - now;
        if drift.abs() <= self.runtime.max_time_leak {
            return;
        }
        if self.runtime.tsync {
            info!(drift, "controller clock drifted, time sync scheduled");
            self.time_sync_pending = true;
        } else {
            warn!(drift, "controller clock drifted, time sync disabled");
        }
    }

    /// Mail when the controller enters one of the configured states.
    async fn check_state_mail(&mut self, db: &Db, status: &ControllerStatus) {
        let previous = self.last_state.replace(status.state);
        let entered = previous.is_some_and(|p| p != status.state);
        if !entered || !self.runtime.mail || !self.runtime.state_mail_states.contains(&status.state) {
            return;
        }

        let (sep, mime) = if self.runtime.html_mail {
            ("<br/>\n", MIME_HTML)
        } else {
            ("\n", MIME_TEXT)
        };
        let body = match state_mail_body(db, status, sep).await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "state mail body failed");
                return;
            }
        };
        let subject = format!("Heizung - Status: {}", status.state_info);
        info!(state = status.state, info = %status.state_info, "state change mail");
        if let Err(e) = send_mail(db, &self.runtime.state_mail_to, &subject, &body, mime).await {
            warn!(error = %e, "state mail failed");
        }
    }

    async fn maybe_aggregate(&mut self, db: &Db, now: i64) {
        let Some(at) = self.next_aggregate else {
            return;
        };
        if now < at {
            return;
        }
        if let Err(e) = aggregate(db, now, self.cfg.aggregate_interval, self.cfg.aggregate_history).await {
            warn!(error = %format!("{e:#}"), "aggregation failed");
        }
        self.schedule_aggregate(now);
    }

    async fn maybe_sync_homematic(&mut self, db: &Db, now: i64) {
        if self.runtime.hm_interval <= 0 || now < self.next_hm_sync {
            return;
        }
        self.next_hm_sync = now + self.runtime.hm_interval * 60;
        if let Err(e) = sync_sys_vars(db, &self.sysvars).await {
            warn!(error = %format!("{e:#}"), "homematic sync failed");
        }
    }

    // -----------------------------------------------------------------------
    // Standby
    // -----------------------------------------------------------------------

    /// Wait for the next tick. Returns `false` when cancelled.
    async fn standby(&mut self, db: &Db, cancel: &CancellationToken) -> bool {
        let mut last_state_check = now_unix();
        loop {
            self.handle_triggers(db, now_unix()).await;

            let now = now_unix();
            if now >= self.next_at {
                return true;
            }
            if now - last_state_check >= self.cfg.state_check_interval as i64 {
                last_state_check = now;
                if self.state_changed().await {
                    info!("controller state changed, polling now");
                    return true;
                }
            }

            let left = Duration::from_secs((self.next_at - now) as u64);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(STANDBY_STEP.min(left)) => {}
            }
        }
    }

    async fn state_changed(&self) -> bool {
        let known = self.shared.read().await.status.state;
        match self.arbiter.request(|c| c.get_status()).await {
            Ok(s) => s.state != known,
            Err(e) => {
                debug!(error = %e, "state check skipped");
                false
            }
        }
    }

    async fn handle_triggers(&mut self, db: &Db, now: i64) {
        let triggers = self.shared.write().await.take_triggers();
        if triggers.is_empty() {
            return;
        }
        debug!(?triggers, "handling triggers");

        if triggers.update_config {
            if let Err(e) = self.reload_config(db, now).await {
                warn!(error = %format!("{e:#}"), "config reload failed");
            }
        }
        if triggers.init_menu {
            if let Err(e) = init_menu(db, &self.arbiter).await {
                warn!(error = %format!("{e:#}"), "menu initialization failed");
            }
        }
        if triggers.update_value_facts {
            if let Err(e) = update_value_facts(db, &self.arbiter).await {
                warn!(error = %format!("{e:#}"), "value fact update failed");
            }
        }
        if triggers.update_schema_conf {
            if let Err(e) = update_schema_conf(db).await {
                warn!(error = %format!("{e:#}"), "schema conf update failed");
            }
        }
        for id in triggers.alert_tests {
            if let Err(e) = self.alerts.perform_alert_check_test(db, id, now).await {
                warn!(rule = id, error = %format!("{e:#}"), "alert test failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Controller side of a tick (runs inside the device bracket)
// ---------------------------------------------------------------------------

fn read_cycle(
    c: &mut dyn ProtocolClient,
    facts: &[ValueFact],
    sync_time: bool,
    now: i64,
) -> ProtocolResult<Cycle> {
    if sync_time {
        match c.sync_time(now) {
            Ok(()) => info!("controller time synchronized"),
            Err(e) => warn!(error = %e, "time sync failed"),
        }
    }

    let status = c.get_status()?;
    let mut readings = Vec::with_capacity(facts.len());
    for f in facts {
        match read_fact(c, f, &status) {
            Ok(Some(r)) => readings.push(r),
            Ok(None) => {}
            Err(e) => warn!(kind = %f.kind, address = f.address, error = %e, "reading failed"),
        }
    }
    Ok(Cycle { status, readings })
}

fn read_fact(
    c: &mut dyn ProtocolClient,
    f: &ValueFact,
    status: &ControllerStatus,
) -> ProtocolResult<Option<Reading>> {
    let Ok(address) = u16::try_from(f.address) else {
        return Ok(None);
    };
    let (value, text) = match f.kind.as_str() {
        TYPE_VALUE => (c.get_value(address)? as f64 / f.factor() as f64, None),
        TYPE_DIG_OUT => (c.get_digital_out(address)?.state as f64, None),
        TYPE_DIG_IN => (c.get_digital_in(address)?.state as f64, None),
        TYPE_ANL_OUT => (c.get_analog_out(address)?.state as f64, None),
        TYPE_STATUS if f.address == STATUS_STATE => {
            (status.state as f64, Some(status.state_info.clone()))
        }
        TYPE_STATUS if f.address == STATUS_MODE => (0.0, Some(status.mode_info.clone())),
        _ => return Ok(None),
    };
    Ok(Some(Reading {
        kind: f.kind.clone(),
        address: f.address,
        value,
        factor: f.factor(),
        text,
    }))
}

async fn state_mail_body(db: &Db, status: &ControllerStatus, sep: &str) -> Result<String> {
    let mut lines = vec![
        format!("Status: {}", status.state_info),
        format!("Modus: {}", status.mode_info),
        String::new(),
    ];
    for item in db.menu_items().await? {
        if MenuKind::from_code(item.kind).is_parameter() && !item.value.is_empty() {
            lines.push(format!("{}: {} {}", item.title, item.value, item.unit).trim_end().to_string());
        }
    }
    Ok(lines.join(sep))
}

#[cfg(test)]
impl ControlLoop {
    pub fn phase(&self) -> Phase {
        self.phase
    }
}

// ===========================================================================
// Tests
// ===========================================================================
