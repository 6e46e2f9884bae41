//! Daemon configuration.
//!
//! Two layers: the TOML file read once at startup ([`Config`]), and the
//! runtime tunables kept as config items in the store ([`RuntimeConfig`]),
//! which are re-read whenever a `write-config` job asks for it.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::db::Db;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_url: String,
    /// Serial device of the controller.
    pub tty_device: String,
    /// Seconds between two poll ticks.
    pub interval: u64,
    /// Seconds between controller state checks while in standby.
    pub state_check_interval: u64,
    /// Aggregation bucket width in minutes.
    pub aggregate_interval: i64,
    /// Days of raw samples to keep; 0 disables aggregation.
    pub aggregate_history: i64,
    /// Seconds the job worker sleeps between queue scans.
    pub job_poll_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_url: "sqlite:p4.db".to_string(),
            tty_device: "/dev/ttyUSB0".to_string(),
            interval: 60,
            state_check_interval: 10,
            aggregate_interval: 15,
            aggregate_history: 0,
            job_poll_interval: 50,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.db_url.trim().is_empty() {
            errors.push("db_url is empty".to_string());
        }
        if self.tty_device.trim().is_empty() {
            errors.push("tty_device is empty".to_string());
        }
        if self.interval == 0 {
            errors.push("interval must be positive".to_string());
        }
        if self.state_check_interval == 0 {
            errors.push("state_check_interval must be positive".to_string());
        }
        if !(1..=1440).contains(&self.aggregate_interval) {
            errors.push(format!(
                "aggregate_interval {} out of range [1, 1440]",
                self.aggregate_interval
            ));
        }
        if self.aggregate_history < 0 {
            errors.push(format!(
                "aggregate_history must not be negative, got {}",
                self.aggregate_history
            ));
        }
        if self.job_poll_interval == 0 {
            errors.push("job_poll_interval must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// `DB_URL` and `TTY_DEVICE` win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("DB_URL") {
            self.db_url = url;
        }
        if let Ok(dev) = std::env::var("TTY_DEVICE") {
            self.tty_device = dev;
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. A missing file yields the defaults;
/// an unreadable or malformed one is an error.
pub fn load(path: &str) -> Result<Config> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path, "config file not found, using defaults");
            return Ok(Config::default());
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))
}

// ---------------------------------------------------------------------------
// Runtime tunables (config items in the store)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub mail: bool,
    pub html_mail: bool,
    pub state_mail_to: String,
    /// Controller state codes that trigger a state mail when entered.
    pub state_mail_states: Vec<i32>,
    /// Receiver for alert rules without their own.
    pub error_mail_to: String,
    pub tsync: bool,
    /// Tolerated controller clock drift in seconds.
    pub max_time_leak: i64,
    /// Minutes between HomeMatic syncs; 0 disables.
    pub hm_interval: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mail: false,
            html_mail: false,
            state_mail_to: String::new(),
            state_mail_states: Vec::new(),
            error_mail_to: String::new(),
            tsync: false,
            max_time_leak: 10,
            hm_interval: 0,
        }
    }
}

impl RuntimeConfig {
    pub async fn load(db: &Db) -> Result<Self> {
        let d = Self::default();
        Ok(Self {
            mail: db.get_config_bool("mail", d.mail).await?,
            html_mail: db.get_config_bool("htmlMail", d.html_mail).await?,
            state_mail_to: db.get_config_item("stateMailTo", "").await?,
            state_mail_states: parse_state_list(&db.get_config_item("stateMailStates", "").await?),
            error_mail_to: db.get_config_item("errorMailTo", "").await?,
            tsync: db.get_config_bool("tsync", d.tsync).await?,
            max_time_leak: db.get_config_int("maxTimeLeak", d.max_time_leak).await?,
            hm_interval: db.get_config_int("hmInterval", d.hm_interval).await?.max(0),
        })
    }
}

/// `"0, 3,19"` → `[0, 3, 19]`; junk entries are skipped.
pub fn parse_state_list(s: &str) -> Vec<i32> {
    s.split(|c: char| c == ',' || c.is_whitespace())
        .filter_map(|t| t.trim().parse().ok())
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_partial_config() {
        let config: Config = toml::from_str(
            r#"
tty_device = "/dev/ttyS1"
interval = 120
aggregate_history = 30
"#,
        )
        .unwrap();
        assert_eq!(config.tty_device, "/dev/ttyS1");
        assert_eq!(config.interval, 120);
        assert_eq!(config.aggregate_history, 30);
        assert_eq!(config.aggregate_interval, 15);
        config.validate().unwrap();
    }

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.interval, 60);
        config.validate().unwrap();
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.job_poll_interval, 50);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "interval = \"soon\"").unwrap();
        let err = load(path.to_str().unwrap()).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config"));
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn zero_interval_rejected() {
        let cfg = Config { interval: 0, ..Config::default() };
        assert_validation_err(&cfg, "interval must be positive");
    }

    #[test]
    fn aggregate_interval_bounds() {
        let cfg = Config { aggregate_interval: 0, ..Config::default() };
        assert_validation_err(&cfg, "aggregate_interval 0 out of range");
        let cfg = Config { aggregate_interval: 1441, ..Config::default() };
        assert_validation_err(&cfg, "aggregate_interval 1441 out of range");
        Config { aggregate_interval: 1440, ..Config::default() }.validate().unwrap();
    }

    #[test]
    fn all_errors_reported_together() {
        let cfg = Config {
            tty_device: " ".into(),
            state_check_interval: 0,
            aggregate_history: -1,
            ..Config::default()
        };
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("(3 errors)"), "{msg}");
        assert!(msg.contains("tty_device is empty"));
        assert!(msg.contains("state_check_interval must be positive"));
        assert!(msg.contains("aggregate_history must not be negative"));
    }

    // -- Runtime config ---------------------------------------------------

    #[test]
    fn state_list_parsing() {
        assert_eq!(parse_state_list("0, 3,19"), vec![0, 3, 19]);
        assert_eq!(parse_state_list(""), Vec::<i32>::new());
        assert_eq!(parse_state_list("1,x, 2"), vec![1, 2]);
    }

    #[tokio::test]
    async fn runtime_config_defaults_are_persisted() {
        let db = Db::memory().await;
        let rc = RuntimeConfig::load(&db).await.unwrap();
        assert_eq!(rc, RuntimeConfig::default());
        assert_eq!(db.get_config_item("maxTimeLeak", "x").await.unwrap(), "10");

        db.set_config_item("stateMailStates", "0,19").await.unwrap();
        db.set_config_item("mail", "1").await.unwrap();
        let rc = RuntimeConfig::load(&db).await.unwrap();
        assert!(rc.mail);
        assert_eq!(rc.state_mail_states, vec![0, 19]);
    }
}
