//! Job command handlers.
//!
//! The web front end writes a row into `jobs`; the worker claims it and
//! calls [`dispatch`]. Results go back as `success:<payload>` or
//! `fail:<reason>`, with `#` instead of `:` for the parameter and time
//! range commands, which is the format the front end parses.

use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};
use sysinfo::System;
use tokio::process::Command;
use tracing::{info, warn};

use crate::clock::{format_elapsed, format_hms, format_long_date, now_unix};
use crate::db::{Db, Job, TYPE_VALUE};
use crate::homematic::{sync_sys_vars, SysVarSource};
use crate::link::DeviceArbiter;
use crate::mail::{send_mail, MailError, MIME_TEXT};
use crate::params::{to_nice, to_value, unit_for, MenuKind, SLOTS};
use crate::protocol::{ConfigParameter, ProtocolError};
use crate::refresh::{update_menu, update_time_range_data};
use crate::state::{SharedState, Trigger};

pub const DEFAULT_USER: &str = "p4";
/// Seed of the default `passwd` config item (stored as sha256 hex).
pub const DEFAULT_PASSWORD_SEED: &str = "p4-3200";

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Fail,
}

/// Structured job result; rendered to the wire string with `Display`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub outcome: Outcome,
    pub delim: char,
    pub payload: String,
}

impl JobResult {
    pub fn ok(payload: impl Into<String>) -> Self {
        Self { outcome: Outcome::Success, delim: ':', payload: payload.into() }
    }

    pub fn fail(payload: impl Into<String>) -> Self {
        Self { outcome: Outcome::Fail, delim: ':', payload: payload.into() }
    }

    pub fn ok_hash(payload: impl Into<String>) -> Self {
        Self { delim: '#', ..Self::ok(payload) }
    }

    pub fn fail_hash(payload: impl Into<String>) -> Self {
        Self { delim: '#', ..Self::fail(payload) }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Success
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.outcome {
            Outcome::Success => "success",
            Outcome::Fail => "fail",
        };
        write!(f, "{tag}{}{}", self.delim, self.payload)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobCommand {
    TestMail,
    TestAlertMail,
    CheckLogin,
    CallScript,
    UpdateSchemaConf,
    WriteConfig,
    ReadConfig,
    GetParameter,
    SetParameter,
    GetTimeRange,
    SetTimeRange,
    GetValue,
    InitMenu,
    UpdateHomematic,
    DaemonState,
    ControllerState,
    InitValueFacts,
    UpdateMenu,
}

impl JobCommand {
    pub fn parse(s: &str) -> Option<Self> {
        let cmd = match s.trim().to_ascii_lowercase().as_str() {
            "test-mail" => Self::TestMail,
            "test-alert-mail" => Self::TestAlertMail,
            "check-login" => Self::CheckLogin,
            "call-script" => Self::CallScript,
            "update-schemacfg" => Self::UpdateSchemaConf,
            "write-config" => Self::WriteConfig,
            "read-config" => Self::ReadConfig,
            "getp" => Self::GetParameter,
            "setp" => Self::SetParameter,
            "gettrp" => Self::GetTimeRange,
            "settrp" => Self::SetTimeRange,
            "getv" => Self::GetValue,
            "initmenu" => Self::InitMenu,
            "updatehm" => Self::UpdateHomematic,
            "p4d-state" => Self::DaemonState,
            "s3200-state" => Self::ControllerState,
            "initvaluefacts" => Self::InitValueFacts,
            "updatemenu" => Self::UpdateMenu,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Everything a handler may touch.
pub struct JobContext<'a> {
    pub db: &'a Db,
    pub arbiter: &'a DeviceArbiter,
    pub shared: &'a SharedState,
    pub sysvars: &'a Arc<dyn SysVarSource>,
}

/// Run one job. Never fails: store errors become `fail:<error>`.
pub async fn dispatch(ctx: &JobContext<'_>, job: &Job) -> JobResult {
    let Some(cmd) = JobCommand::parse(&job.command) else {
        warn!(job = job.id, command = %job.command, "ignoring unknown job");
        return JobResult::fail("unknown command");
    };
    match handle(ctx, cmd, job).await {
        Ok(r) => r,
        Err(e) => {
            warn!(job = job.id, ?cmd, error = %format!("{e:#}"), "job failed");
            JobResult::fail(format!("{e}"))
        }
    }
}

async fn handle(ctx: &JobContext<'_>, cmd: JobCommand, job: &Job) -> Result<JobResult> {
    let data = job.data.as_str();
    match cmd {
        JobCommand::TestMail => test_mail(ctx.db, data).await,
        JobCommand::TestAlertMail => {
            let Ok(id) = data.trim().parse::<i64>() else {
                return Ok(JobResult::fail("invalid request syntax"));
            };
            info!(rule = id, "test mail for alert requested");
            trigger(ctx, Trigger::AlertTest(id)).await;
            Ok(JobResult::ok("check mail triggert"))
        }
        JobCommand::CheckLogin => check_login(ctx.db, data).await,
        JobCommand::CallScript => call_script(ctx.db, data.trim()).await,
        JobCommand::UpdateSchemaConf => {
            trigger(ctx, Trigger::UpdateSchemaConf).await;
            Ok(JobResult::ok("done"))
        }
        JobCommand::WriteConfig => {
            let Some((name, value)) = data.split_once(':') else {
                return Ok(JobResult::fail("invalid request syntax"));
            };
            info!(name, value, "storing config item");
            ctx.db.set_config_item(name, value).await?;
            trigger(ctx, Trigger::UpdateConfig).await;
            Ok(JobResult::ok("stored"))
        }
        JobCommand::ReadConfig => {
            let (name, default) = data.split_once(':').unwrap_or((data, ""));
            let value = ctx.db.get_config_item(name, default).await?;
            Ok(JobResult::ok(value))
        }
        JobCommand::GetParameter => get_parameter(ctx, job.address).await,
        JobCommand::SetParameter => set_parameter(ctx, job.address, data).await,
        JobCommand::GetTimeRange => get_time_range(ctx.db, job.address, data).await,
        JobCommand::SetTimeRange => set_time_range(ctx, job.address, data).await,
        JobCommand::GetValue => get_value(ctx, job.address).await,
        JobCommand::InitMenu => {
            trigger(ctx, Trigger::InitMenu).await;
            Ok(JobResult::ok("done"))
        }
        JobCommand::UpdateHomematic => match sync_sys_vars(ctx.db, ctx.sysvars).await {
            Ok(_) => Ok(JobResult::ok("done")),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "homematic sync failed");
                Ok(JobResult::fail("error"))
            }
        },
        JobCommand::DaemonState => Ok(daemon_state(ctx.shared).await),
        JobCommand::ControllerState => {
            let status = ctx.shared.read().await.status.clone();
            Ok(JobResult::ok(format!(
                "{}#{}#{}#{}",
                format_long_date(status.time),
                status.state,
                status.state_info,
                status.mode_info
            )))
        }
        JobCommand::InitValueFacts => {
            trigger(ctx, Trigger::UpdateValueFacts).await;
            Ok(JobResult::ok("done"))
        }
        JobCommand::UpdateMenu => {
            let refreshed = async {
                update_menu(ctx.db, ctx.arbiter).await?;
                update_time_range_data(ctx.db, ctx.arbiter).await
            };
            match refreshed.await {
                Ok(_) => Ok(JobResult::ok("done")),
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "menu update failed");
                    Ok(JobResult::fail("communication error"))
                }
            }
        }
    }
}

async fn trigger(ctx: &JobContext<'_>, t: Trigger) {
    ctx.shared.write().await.request(t);
}

/// Maps a failed controller write to its wire reason.
fn write_failure(e: &ProtocolError) -> &'static str {
    match e {
        ProtocolError::NonUpdate => "no update",
        ProtocolError::OutOfRange => "out of range",
        _ => "communication error",
    }
}

// ---------------------------------------------------------------------------
// Mail, login, scripts
// ---------------------------------------------------------------------------

async fn test_mail(db: &Db, data: &str) -> Result<JobResult> {
    let Some((subject, body)) = data.split_once(':') else {
        return Ok(JobResult::fail("invalid request syntax"));
    };
    let receiver = db.get_config_item("stateMailTo", "").await?;
    info!(subject, "test mail requested");

    let result = match send_mail(db, &receiver, subject, body, MIME_TEXT).await {
        Ok(()) => JobResult::ok("mail sended"),
        Err(MailError::MissingScript) => JobResult::fail("missing mailscript"),
        Err(MailError::ScriptNotFound(_)) => JobResult::fail("mail-script not found"),
        Err(MailError::MissingReceiver) => JobResult::fail("missing-receiver"),
        Err(e) => {
            warn!(error = %e, "test mail failed");
            JobResult::fail("send failed")
        }
    };
    Ok(result)
}

pub fn default_password_hash() -> String {
    format!("{:x}", Sha256::digest(DEFAULT_PASSWORD_SEED.as_bytes()))
}

async fn check_login(db: &Db, data: &str) -> Result<JobResult> {
    let user = db.get_config_item("user", DEFAULT_USER).await?;
    let passwd = db.get_config_item("passwd", &default_password_hash()).await?;

    let confirmed = data
        .split_once(':')
        .is_some_and(|(u, p)| u == user && p == passwd);
    Ok(if confirmed {
        JobResult::ok("login-confirmed")
    } else {
        JobResult::fail("login-denied")
    })
}

async fn call_script(db: &Db, name: &str) -> Result<JobResult> {
    let Some(path) = db.script_path(name).await? else {
        warn!(script = name, "script not found in store");
        return Ok(JobResult::fail("script name not found"));
    };
    if !Path::new(&path).exists() {
        warn!(script = name, path = %path, "script path not found");
        return Ok(JobResult::fail("path not found"));
    }

    match Command::new(&path).stdin(Stdio::null()).status().await {
        Ok(status) => {
            info!(script = name, path = %path, %status, "script called");
            Ok(JobResult::ok("done"))
        }
        Err(e) => {
            warn!(script = name, path = %path, error = %e, "script call failed");
            Ok(JobResult::fail("call failed"))
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

enum SetFailure {
    Format,
    Protocol(ProtocolError),
}

fn parameter_result(kind: MenuKind, p: &ConfigParameter) -> String {
    format!(
        "{}#{}#{}#{}#{}#{}",
        to_nice(p.value, kind, p),
        unit_for(kind, p),
        p.default,
        p.min,
        p.max,
        p.digits
    )
}

/// Menu item behind `menu_id`, if it is a readable parameter.
async fn parameter_item(db: &Db, menu_id: i64) -> Result<Option<(MenuKind, u16)>> {
    let Some(item) = db.menu_item(menu_id).await? else {
        return Ok(None);
    };
    let kind = MenuKind::from_code(item.kind);
    match u16::try_from(item.address) {
        Ok(address) if kind.is_parameter() => Ok(Some((kind, address))),
        _ => Ok(None),
    }
}

async fn get_parameter(ctx: &JobContext<'_>, menu_id: i64) -> Result<JobResult> {
    let Some((kind, address)) = parameter_item(ctx.db, menu_id).await? else {
        return Ok(JobResult::fail_hash("id not found"));
    };

    let read = ctx
        .arbiter
        .request(|c| {
            let mut p = ConfigParameter::new(address);
            c.get_parameter(&mut p)?;
            Ok(p)
        })
        .await;

    Ok(match read {
        Ok(p) => JobResult::ok_hash(parameter_result(kind, &p)),
        Err(e) => {
            warn!(menu = menu_id, address, error = %e, "parameter read failed");
            JobResult::fail_hash("communication error")
        }
    })
}

async fn set_parameter(ctx: &JobContext<'_>, menu_id: i64, text: &str) -> Result<JobResult> {
    let Some((kind, address)) = parameter_item(ctx.db, menu_id).await? else {
        warn!(menu = menu_id, "set of parameter failed, id not found");
        return Ok(JobResult::fail_hash("id not found"));
    };

    let written = ctx
        .arbiter
        .with_device_link(|c| -> Result<ConfigParameter, SetFailure> {
            let mut p = ConfigParameter::new(address);
            c.get_parameter(&mut p).map_err(SetFailure::Protocol)?;
            let value = to_value(text, kind, &p).ok_or(SetFailure::Format)?;
            if p.min < p.max && (value < p.min || value > p.max) {
                return Err(SetFailure::Protocol(ProtocolError::OutOfRange));
            }
            info!(address, text, value, "storing parameter");
            p.value = value;
            c.set_parameter(&mut p).map_err(SetFailure::Protocol)?;
            Ok(p)
        })
        .await;

    let p = match written {
        Ok(Ok(p)) => p,
        Ok(Err(SetFailure::Format)) => {
            warn!(address, text, "set of parameter failed, wrong format");
            return Ok(JobResult::fail_hash("format error"));
        }
        Ok(Err(SetFailure::Protocol(e))) | Err(e) => {
            warn!(address, error = %e, "set of parameter failed");
            return Ok(JobResult::fail_hash(write_failure(&e)));
        }
    };

    let nice = to_nice(p.value, kind, &p);
    let unit = unit_for(kind, &p);
    ctx.db.update_menu_value(menu_id, &nice, &unit).await?;
    Ok(JobResult::ok_hash(parameter_result(kind, &p)))
}

// ---------------------------------------------------------------------------
// Time ranges & values
// ---------------------------------------------------------------------------

fn parse_slot(s: &str) -> Option<usize> {
    s.trim().parse().ok().filter(|n| (1..=SLOTS).contains(n))
}

/// Reads the stored copy; the controller is not asked.
async fn get_time_range(db: &Db, address: i64, data: &str) -> Result<JobResult> {
    let t = match db.time_ranges(address).await? {
        None => return Ok(JobResult::fail_hash("id not found")),
        Some(Err(e)) => {
            warn!(address, error = %e, "stored time range is invalid");
            return Ok(JobResult::fail_hash("format error"));
        }
        Some(Ok(t)) => t,
    };
    let Some(w) = parse_slot(data).and_then(|n| t.slot(n - 1)) else {
        return Ok(JobResult::fail_hash("format error"));
    };
    Ok(JobResult::ok_hash(format!("{}#{}#Zeitraum", w.from, w.to)))
}

/// `data` is `slot#from#to` with a 1-based slot.
async fn set_time_range(ctx: &JobContext<'_>, address: i64, data: &str) -> Result<JobResult> {
    let mut parts = data.splitn(3, '#');
    let (Some(slot), Some(from), Some(to)) = (
        parts.next().and_then(parse_slot),
        parts.next(),
        parts.next(),
    ) else {
        warn!(address, data, "parsing of time range request failed");
        return Ok(JobResult::fail_hash("format error"));
    };

    // All four windows go to the controller, so every stored one must be valid.
    let mut t = match ctx.db.time_ranges(address).await? {
        None => {
            warn!(address, "set of time range failed, address not found");
            return Ok(JobResult::fail_hash("id not found"));
        }
        Some(Err(e)) => {
            warn!(address, error = %e, "set of time range failed, stored windows invalid");
            return Ok(JobResult::fail_hash("format error"));
        }
        Some(Ok(t)) => t,
    };
    if let Err(e) = t.set_range(slot - 1, from, to) {
        warn!(address, error = %e, "set of time range failed, wrong format");
        return Ok(JobResult::fail_hash("format error"));
    }
    let Some(w) = t.slot(slot - 1).cloned() else {
        return Ok(JobResult::fail_hash("format error"));
    };

    info!(address, slot, from = %w.from, to = %w.to, "storing time range");
    if let Err(e) = ctx.arbiter.request(|c| c.set_time_ranges(&t)).await {
        warn!(address, error = %e, "set of time range failed");
        return Ok(JobResult::fail_hash(write_failure(&e)));
    }

    ctx.db.update_time_range_slot(address, slot, &w.from, &w.to).await?;
    Ok(JobResult::ok_hash(format!("{}#{}#Zeitbereich", w.from, w.to)))
}

async fn get_value(ctx: &JobContext<'_>, address: i64) -> Result<JobResult> {
    let fact = ctx.db.value_fact(TYPE_VALUE, address).await?;
    let (Some(fact), Ok(addr)) = (fact, u16::try_from(address)) else {
        return Ok(JobResult::fail("id not found"));
    };

    Ok(match ctx.arbiter.request(|c| c.get_value(addr)).await {
        Ok(raw) => JobResult::ok(format!("{:.2}{}", raw as f64 / fact.factor() as f64, fact.unit)),
        Err(e) => {
            warn!(address, error = %e, "value read failed");
            JobResult::fail("communication error")
        }
    })
}

async fn daemon_state(shared: &SharedState) -> JobResult {
    let now = now_unix();
    let (next_at, uptime) = {
        let s = shared.read().await;
        (s.next_at, s.uptime(now))
    };
    let load = System::load_average();
    JobResult::ok(format!(
        "{}#{}#{}#{:3.2} {:3.2} {:3.2}",
        format_hms(next_at),
        env!("CARGO_PKG_VERSION"),
        format_elapsed(uptime),
        load.one,
        load.five,
        load.fifteen
    ))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::homematic::DisabledSysVars;
    use crate::mail::testing::{recording_mail_script, script};
    use crate::params::TimeRanges;
    use crate::refresh::init_menu;
    use crate::sim::{SimHandle, SimulatedController};
    use crate::state::SystemState;

    struct Fixture {
        db: Db,
        arbiter: DeviceArbiter,
        shared: SharedState,
        sysvars: Arc<dyn SysVarSource>,
        sim: SimHandle,
    }

    impl Fixture {
        async fn new() -> Self {
            let db = Db::memory().await;
            let controller = SimulatedController::heating_plant();
            let sim = controller.handle();
            let arbiter = DeviceArbiter::new("/dev/sim", Box::new(controller));
            init_menu(&db, &arbiter).await.unwrap();
            Self {
                db,
                arbiter,
                shared: SystemState::shared(now_unix()),
                sysvars: Arc::new(DisabledSysVars),
                sim,
            }
        }

        async fn run(&self, command: &str, address: i64, data: &str) -> String {
            let ctx = JobContext {
                db: &self.db,
                arbiter: &self.arbiter,
                shared: &self.shared,
                sysvars: &self.sysvars,
            };
            let job = Job {
                id: 1,
                req_at: now_unix(),
                state: "P".into(),
                command: command.into(),
                address,
                data: data.into(),
                done_at: None,
                result: None,
            };
            dispatch(&ctx, &job).await.to_string()
        }
    }

    #[test]
    fn result_rendering() {
        assert_eq!(JobResult::ok("done").to_string(), "success:done");
        assert_eq!(JobResult::fail_hash("no update").to_string(), "fail#no update");
        assert!(!JobResult::fail("x").is_success());
    }

    #[test]
    fn commands_case_insensitive() {
        assert_eq!(JobCommand::parse("GetP"), Some(JobCommand::GetParameter));
        assert_eq!(JobCommand::parse("P4D-STATE"), Some(JobCommand::DaemonState));
        assert_eq!(JobCommand::parse("reboot"), None);
    }

    #[tokio::test]
    async fn unknown_command() {
        let f = Fixture::new().await;
        assert_eq!(f.run("launch-rockets", 0, "").await, "fail:unknown command");
    }

    #[tokio::test]
    async fn login() {
        let f = Fixture::new().await;
        assert_eq!(f.run("check-login", 0, "p4:wrongpass").await, "fail:login-denied");
        let ok = format!("p4:{}", default_password_hash());
        assert_eq!(f.run("check-login", 0, &ok).await, "success:login-confirmed");
        assert_eq!(f.run("check-login", 0, "nocolon").await, "fail:login-denied");
    }

    #[tokio::test]
    async fn test_mail_paths() {
        let f = Fixture::new().await;
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("mails.log");

        assert_eq!(f.run("test-mail", 0, "no colon").await, "fail:invalid request syntax");

        // Default script path does not exist.
        assert_eq!(f.run("test-mail", 0, "Hello:World").await, "fail:mail-script not found");

        f.db.set_config_item("mailScript", "").await.unwrap();
        assert_eq!(f.run("test-mail", 0, "Hello:World").await, "fail:missing mailscript");

        let s = recording_mail_script(dir.path(), &log);
        f.db.set_config_item("mailScript", s.to_str().unwrap()).await.unwrap();
        assert_eq!(f.run("test-mail", 0, "Hello:World").await, "fail:missing-receiver");

        f.db.set_config_item("stateMailTo", "me@example.org").await.unwrap();
        assert_eq!(f.run("test-mail", 0, "Hello:World").await, "success:mail sended");
        assert_eq!(
            std::fs::read_to_string(&log).unwrap(),
            "me@example.org|Hello|text/plain|World\n"
        );
    }

    #[tokio::test]
    async fn call_script_paths() {
        let f = Fixture::new().await;
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("called");
        let s = script(dir.path(), "touch.sh", &format!("touch '{}'", marker.display()));

        assert_eq!(f.run("call-script", 0, "touch").await, "fail:script name not found");
        f.db.upsert_script("gone", "/nonexistent/script.sh").await.unwrap();
        assert_eq!(f.run("call-script", 0, "gone").await, "fail:path not found");

        f.db.upsert_script("touch", s.to_str().unwrap()).await.unwrap();
        assert_eq!(f.run("call-script", 0, "touch").await, "success:done");
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn config_items_and_triggers() {
        let f = Fixture::new().await;
        assert_eq!(f.run("write-config", 0, "interval:120").await, "success:stored");
        assert_eq!(f.run("read-config", 0, "interval").await, "success:120");
        assert_eq!(f.run("read-config", 0, "missing:dflt").await, "success:dflt");
        assert_eq!(f.db.get_config_item("missing", "").await.unwrap(), "dflt");
        assert_eq!(f.run("write-config", 0, "bad").await, "fail:invalid request syntax");

        assert_eq!(f.run("initmenu", 0, "").await, "success:done");
        assert_eq!(f.run("update-schemacfg", 0, "").await, "success:done");
        assert_eq!(f.run("initvaluefacts", 0, "").await, "success:done");
        assert_eq!(f.run("test-alert-mail", 0, "7").await, "success:check mail triggert");

        let t = f.shared.write().await.take_triggers();
        assert!(t.update_config && t.init_menu && t.update_schema_conf && t.update_value_facts);
        assert_eq!(t.alert_tests, vec![7]);
    }

    #[tokio::test]
    async fn get_parameter_paths() {
        let f = Fixture::new().await;
        assert_eq!(f.run("getp", 2, "").await, "success#60#°#55#40#75#0");
        assert_eq!(f.run("getp", 3, "").await, "success#5.0#°#6#0#40#1");
        assert_eq!(f.run("getp", 4, "").await, "success#06:00#Uhr#360#0#1439#0");
        assert_eq!(f.run("getp", 99, "").await, "fail#id not found");
        // Not a parameter.
        assert_eq!(f.run("getp", 6, "").await, "fail#id not found");

        f.sim.model().fail_requests = true;
        assert_eq!(f.run("getp", 2, "").await, "fail#communication error");
    }

    #[tokio::test]
    async fn set_parameter_paths() {
        let f = Fixture::new().await;
        assert_eq!(f.run("setp", 2, "65").await, "success#65#°#55#40#75#0");
        assert_eq!(f.db.menu_item(2).await.unwrap().unwrap().value, "65");
        assert_eq!(f.sim.model().parameters[&0x10].value, 65);

        assert_eq!(f.run("setp", 2, "65").await, "fail#no update");
        assert_eq!(f.run("setp", 2, "abc").await, "fail#format error");
        assert_eq!(f.run("setp", 99, "1").await, "fail#id not found");

        // Scaled parameter with decimal comma.
        assert_eq!(f.run("setp", 3, "7,5").await, "success#7.5#°#6#0#40#1");
        assert_eq!(f.sim.model().parameters[&0x11].value, 15);

        assert_eq!(f.run("setp", 4, "05:30").await, "success#05:30#Uhr#360#0#1439#0");

        f.sim.model().fail_open = true;
        assert_eq!(f.run("setp", 2, "50").await, "fail#communication error");
    }

    #[tokio::test]
    async fn set_parameter_out_of_range_leaves_menu() {
        let f = Fixture::new().await;
        f.db.update_menu_value(2, "60", "°").await.unwrap();
        assert_eq!(f.run("setp", 2, "99").await, "fail#out of range");
        let item = f.db.menu_item(2).await.unwrap().unwrap();
        assert_eq!((item.value.as_str(), item.unit.as_str()), ("60", "°"));
        assert_eq!(f.sim.model().parameters[&0x10].value, 60);
    }

    #[tokio::test]
    async fn time_range_round_trip() {
        let f = Fixture::new().await;
        let mut neighbour = TimeRanges::new(0x21);
        neighbour.set_range(1, "10:00", "11:00").unwrap();
        f.sim.model().time_ranges.insert(0x20, TimeRanges::new(0x20));
        f.sim.model().time_ranges.insert(0x21, neighbour.clone());
        let mut stored = TimeRanges::new(0x20);
        stored.set_range(0, "05:00", "08:00").unwrap();
        f.db.store_time_ranges(&stored).await.unwrap();
        f.db.store_time_ranges(&neighbour).await.unwrap();

        assert_eq!(f.run("settrp", 0x20, "2#06:00#22:00").await, "success#06:00#22:00#Zeitbereich");

        let t = f.db.time_ranges(0x20).await.unwrap().unwrap().unwrap();
        assert_eq!(t.slot(0).unwrap().from, "05:00");
        assert_eq!(t.slot(1).unwrap().to, "22:00");
        assert_eq!(t.slot(2).unwrap().from, "nn:nn");
        assert_eq!(f.sim.model().time_ranges[&0x20].slot(1).unwrap().from, "06:00");

        // The other address is untouched on both sides.
        assert_eq!(f.db.time_ranges(0x21).await.unwrap().unwrap(), Ok(neighbour.clone()));
        assert_eq!(f.sim.model().time_ranges[&0x21], neighbour);

        assert_eq!(f.run("gettrp", 0x20, "2").await, "success#06:00#22:00#Zeitraum");
        assert_eq!(f.run("gettrp", 0x20, "5").await, "fail#format error");
        assert_eq!(f.run("gettrp", 0x99, "1").await, "fail#id not found");
    }

    #[tokio::test]
    async fn time_range_failures() {
        let f = Fixture::new().await;
        f.db.store_time_ranges(&TimeRanges::new(0x21)).await.unwrap();
        assert_eq!(f.run("settrp", 0x21, "2#06:00").await, "fail#format error");
        assert_eq!(f.run("settrp", 0x21, "9#06:00#07:00").await, "fail#format error");
        assert_eq!(f.run("settrp", 0x21, "1#25:00#07:00").await, "fail#format error");
        assert_eq!(f.run("settrp", 0x50, "1#06:00#07:00").await, "fail#id not found");
        // Known to the store but not to the controller.
        assert_eq!(f.run("settrp", 0x21, "1#06:00#07:00").await, "fail#communication error");
        let t = f.db.time_ranges(0x21).await.unwrap().unwrap().unwrap();
        assert_eq!(t.slot(0).unwrap().from, "nn:nn");
    }

    #[tokio::test]
    async fn corrupt_stored_window_blocks_time_range_write() {
        let f = Fixture::new().await;
        let mut live = TimeRanges::new(0x20);
        live.set_range(0, "05:00", "08:00").unwrap();
        f.sim.model().time_ranges.insert(0x20, live.clone());
        f.db.store_time_ranges(&live).await.unwrap();
        f.db.update_time_range_slot(0x20, 1, "5:00h", "08:00").await.unwrap();

        assert_eq!(f.run("settrp", 0x20, "2#06:00#22:00").await, "fail#format error");
        assert_eq!(f.run("gettrp", 0x20, "2").await, "fail#format error");

        // Controller never saw a write.
        assert_eq!(f.sim.model().time_ranges[&0x20], live);
    }

    #[tokio::test]
    async fn get_value_scaled_by_fact() {
        let f = Fixture::new().await;
        f.sim.model().add_value_spec(0x10, "Testwert", "°C", 10, 255);
        f.db.upsert_value_fact(TYPE_VALUE, 0x10, "Testwert", "Testwert", "°C", 10).await.unwrap();

        assert_eq!(f.run("getv", 0x10, "").await, "success:25.50°C");
        assert_eq!(f.run("getv", 0x30, "").await, "fail:id not found");

        f.sim.model().fail_requests = true;
        assert_eq!(f.run("getv", 0x10, "").await, "fail:communication error");
    }

    #[tokio::test]
    async fn state_reports() {
        let f = Fixture::new().await;
        let r = f.run("p4d-state", 0, "").await;
        let parts: Vec<&str> = r.trim_start_matches("success:").split('#').collect();
        assert!(r.starts_with("success:"));
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[1], env!("CARGO_PKG_VERSION"));
        assert_eq!(parts[3].split(' ').count(), 3);

        f.shared.write().await.record_status(crate::protocol::ControllerStatus {
            time: 1_700_000_000,
            state: 3,
            state_info: "Heizen".into(),
            mode_info: "Automatik".into(),
            version: String::new(),
        });
        let r = f.run("s3200-state", 0, "").await;
        assert!(r.ends_with("#3#Heizen#Automatik"), "{r}");
    }

    #[tokio::test]
    async fn update_menu_and_homematic() {
        let f = Fixture::new().await;
        assert_eq!(f.run("updatemenu", 0, "").await, "success:done");
        assert_eq!(f.db.menu_item(2).await.unwrap().unwrap().value, "60");
        assert!(matches!(f.db.time_ranges(0).await.unwrap(), Some(Ok(_))));

        assert_eq!(f.run("updatehm", 0, "").await, "success:done");

        f.sim.model().fail_open = true;
        assert_eq!(f.run("updatemenu", 0, "").await, "fail:communication error");
    }
}
