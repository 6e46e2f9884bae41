//! Sensor alert evaluation.
//!
//! Each top-level rule is walked together with its chain of sub-rules. The
//! walk is an explicit state machine:
//!
//! ```text
//! Normal ──[violated]──▶ Violated ──[chain still violated]──▶ Escalated
//!   ▲                        │                                   │
//!   └───────[combined verdict false]─────────────────────────────┘
//!
//! TestForced (sticky, set when a test mail was requested)
//! ```
//!
//! Rules that end in a non-normal state add one line per violated rule to
//! the receiver's pending mail. Pending mails go out once per sweep.

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::clock::format_short;
use crate::config::RuntimeConfig;
use crate::db::{Db, SensorAlertRule};
use crate::mail::{send_mail, MIME_HTML, MIME_TEXT};

/// Longest rule chain followed from one top-level rule.
pub const MAX_CHAIN: usize = 10;

const DEFAULT_SUBJECT: &str = "Sensor alert: %title%";
const DEFAULT_BODY: &str = "%title% is %value%%unit% (min %min%, max %max%) at %time%";

// ---------------------------------------------------------------------------
// Escalation state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Normal,
    Violated,
    Escalated,
    TestForced,
}

impl Escalation {
    fn start(force: bool) -> Self {
        if force {
            Self::TestForced
        } else {
            Self::Normal
        }
    }

    fn advance(self, verdict: bool) -> Self {
        match (self, verdict) {
            (Self::TestForced, _) => Self::TestForced,
            (_, false) => Self::Normal,
            (Self::Normal, true) => Self::Violated,
            (Self::Violated | Self::Escalated, true) => Self::Escalated,
        }
    }

    pub fn fires(self) -> bool {
        self != Self::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl LogicalOp {
    fn parse(s: Option<&str>) -> Self {
        match s.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "or" => Self::Or,
            _ => Self::And,
        }
    }

    fn combine(self, a: bool, b: bool) -> bool {
        match self {
            Self::And => a && b,
            Self::Or => a || b,
        }
    }
}

// ---------------------------------------------------------------------------
// Mail accumulator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertMail {
    pub subject: String,
    pub lines: Vec<String>,
}

/// Outcome of checking one rule against the stored samples.
#[derive(Debug, Clone)]
struct RuleCheck {
    value: Option<f64>,
    violated: bool,
    title: String,
    unit: String,
}

pub struct AlertEngine {
    mailbox: BTreeMap<String, AlertMail>,
    mail_enabled: bool,
    html: bool,
    fallback_receiver: String,
}

impl AlertEngine {
    pub fn new(runtime: &RuntimeConfig) -> Self {
        let mut engine = Self {
            mailbox: BTreeMap::new(),
            mail_enabled: false,
            html: false,
            fallback_receiver: String::new(),
        };
        engine.configure(runtime);
        engine
    }

    pub fn configure(&mut self, runtime: &RuntimeConfig) {
        self.mail_enabled = runtime.mail;
        self.html = runtime.html_mail;
        self.fallback_receiver = runtime.error_mail_to.clone();
    }

    /// Evaluate every active top-level rule, then send the collected mails.
    /// Returns the number of rules that fired.
    pub async fn sensor_alert_check(&mut self, db: &Db, now: i64) -> Result<usize> {
        let rules = db.top_level_alert_rules().await?;
        let mut fired = 0;
        for rule in &rules {
            match self.perform_alert_check(db, rule, now, false).await {
                Ok(state) if state.fires() => fired += 1,
                Ok(_) => {}
                Err(e) => warn!(rule = rule.id, error = %format!("{e:#}"), "alert check failed"),
            }
        }
        self.send_alert_mails(db).await;
        debug!(rules = rules.len(), fired, "sensor alert check done");
        Ok(fired)
    }

    /// Evaluate one rule with `force`, as requested by a test-alert-mail
    /// job, and send the result right away.
    pub async fn perform_alert_check_test(&mut self, db: &Db, id: i64, now: i64) -> Result<bool> {
        let Some(rule) = db.alert_rule(id).await? else {
            warn!(rule = id, "test alert for unknown rule");
            return Ok(false);
        };
        self.perform_alert_check(db, &rule, now, true).await?;
        self.send_alert_mails(db).await;
        Ok(true)
    }

    /// Walk `rule` and its sub-rules and queue mail lines if the chain
    /// ends violated (or `force` is set) and the repeat gate is open.
    pub async fn perform_alert_check(
        &mut self,
        db: &Db,
        rule: &SensorAlertRule,
        now: i64,
        force: bool,
    ) -> Result<Escalation> {
        let mut state = Escalation::start(force);
        let mut verdict: Option<bool> = None;
        let mut op = LogicalOp::And;
        let mut hits: Vec<(SensorAlertRule, RuleCheck)> = Vec::new();
        let mut visited: Vec<i64> = Vec::new();
        let mut current = Some(rule.clone());

        while let Some(r) = current.take() {
            if visited.len() >= MAX_CHAIN || visited.contains(&r.id) {
                warn!(rule = rule.id, at = r.id, "alert rule chain truncated");
                break;
            }
            visited.push(r.id);

            let check = evaluate(db, &r, now).await?;
            let v = match verdict {
                None => check.violated,
                Some(prev) => op.combine(prev, check.violated),
            };
            verdict = Some(v);
            state = state.advance(v);

            op = LogicalOp::parse(r.lgop.as_deref());
            current = match r.subid {
                Some(id) => db.alert_rule(id).await?.filter(|s| s.state == "A"),
                None => None,
            };
            if check.violated || force {
                hits.push((r, check));
            }
        }

        if !state.fires() {
            return Ok(state);
        }
        if !force && !repeat_gate_open(rule, now) {
            debug!(rule = rule.id, last = rule.lastalert, "alert suppressed by repeat gate");
            return Ok(state);
        }

        let receiver = if rule.mailto.trim().is_empty() {
            self.fallback_receiver.clone()
        } else {
            rule.mailto.clone()
        };
        if receiver.trim().is_empty() {
            warn!(rule = rule.id, "alert fired but no receiver configured");
            return Ok(state);
        }

        info!(rule = rule.id, ?state, violated = hits.len(), "sensor alert");
        let mut stamped: Vec<i64> = Vec::new();
        for (r, check) in &hits {
            self.add_to_alert_mail(&receiver, rule, r, check, now);
            stamped.push(r.id);
        }
        if !stamped.contains(&rule.id) {
            stamped.push(rule.id);
        }
        for id in stamped {
            db.stamp_alert_rule(id, now).await?;
        }
        Ok(state)
    }

    fn add_to_alert_mail(
        &mut self,
        receiver: &str,
        top: &SensorAlertRule,
        rule: &SensorAlertRule,
        check: &RuleCheck,
        now: i64,
    ) {
        let subject_tpl = non_empty(&top.msubject).unwrap_or(DEFAULT_SUBJECT);
        let body_tpl = non_empty(&rule.mbody)
            .or_else(|| non_empty(&top.mbody))
            .unwrap_or(DEFAULT_BODY);

        let line = substitute(body_tpl, rule, check, now);
        let mail = self
            .mailbox
            .entry(receiver.to_string())
            .or_insert_with(|| AlertMail {
                subject: substitute(subject_tpl, rule, check, now),
                lines: Vec::new(),
            });
        mail.lines.push(line);
    }

    /// Send and clear every pending mail. Failures are logged only.
    async fn send_alert_mails(&mut self, db: &Db) {
        let mails = std::mem::take(&mut self.mailbox);
        if mails.is_empty() {
            return;
        }
        if !self.mail_enabled {
            debug!(receivers = mails.len(), "mail disabled, dropping alert mails");
            return;
        }

        let (sep, mime) = if self.html {
            ("<br/>\n", MIME_HTML)
        } else {
            ("\n", MIME_TEXT)
        };
        for (receiver, mail) in mails {
            let body = mail.lines.join(sep);
            if let Err(e) = send_mail(db, &receiver, &mail.subject, &body, mime).await {
                warn!(receiver = %receiver, error = %e, "alert mail failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Rule evaluation
// ---------------------------------------------------------------------------

fn repeat_gate_open(rule: &SensorAlertRule, now: i64) -> bool {
    rule.lastalert <= 0 || rule.maxrepeat <= 0 || now >= rule.lastalert + rule.maxrepeat * 60
}

async fn evaluate(db: &Db, r: &SensorAlertRule, now: i64) -> Result<RuleCheck> {
    let (title, unit) = match db.value_fact(&r.value_type, r.address).await? {
        Some(f) => (f.label().to_string(), f.unit.clone()),
        None => (format!("{}:0x{:02x}", r.value_type, r.address), String::new()),
    };

    let Some(latest) = db.latest_sample(&r.value_type, r.address).await? else {
        return Ok(RuleCheck {
            value: None,
            violated: false,
            title,
            unit,
        });
    };
    let value = latest.value;

    let mut violated = r.min.is_some_and(|min| value < min) || r.max.is_some_and(|max| value > max);

    if let (Some(range), Some(delta)) = (r.rangem, r.delta) {
        if range > 0 && delta > 0 {
            let earlier = db
                .sample_at_or_before(&r.value_type, r.address, now - range * 60)
                .await?;
            if let Some(old) = earlier.filter(|s| s.value != 0.0) {
                let pct = ((value - old.value) / old.value).abs() * 100.0;
                if pct > delta as f64 {
                    violated = true;
                }
            }
        }
    }

    Ok(RuleCheck {
        value: Some(value),
        violated,
        title,
        unit,
    })
}

fn non_empty(s: &str) -> Option<&str> {
    (!s.trim().is_empty()).then_some(s)
}

fn opt(v: Option<impl ToString>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn substitute(tpl: &str, r: &SensorAlertRule, check: &RuleCheck, now: i64) -> String {
    tpl.replace("%title%", &check.title)
        .replace("%value%", &check.value.map(|v| format!("{v:.2}")).unwrap_or_else(|| "-".into()))
        .replace("%unit%", &check.unit)
        .replace("%min%", &opt(r.min))
        .replace("%max%", &opt(r.max))
        .replace("%delta%", &opt(r.delta))
        .replace("%range%", &opt(r.rangem))
        .replace("%time%", &format_short(now))
        .replace("%repeat%", &r.maxrepeat.to_string())
}

#[cfg(test)]
impl AlertEngine {
    /// Receivers with a pending mail.
    pub fn pending(&self) -> usize {
        self.mailbox.len()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
