mod alerts;
mod jobs;
mod menu;
mod samples;

pub use alerts::SensorAlertRule;
pub use jobs::Job;
pub use menu::MenuItem;
pub use samples::{
    ValueFact, STATUS_MODE, STATUS_STATE, TYPE_ANL_OUT, TYPE_DIG_IN, TYPE_DIG_OUT, TYPE_STATUS,
    TYPE_VALUE,
};

#[cfg(test)]
pub use jobs::JOB_DONE;
#[cfg(test)]
pub use samples::{AGGREGATE_AVG, AGGREGATE_RAW};

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owner column for every config item this daemon reads or writes.
pub const CONFIG_OWNER: &str = "p4d";

/// Fixed backoff between store connection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// One pool per execution context; never shared between the control loop
/// and the job worker.
#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// HomeMatic system variable as mirrored into `hmsysvars`.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct HmSysVar {
    pub id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    pub kind: i64,
    pub unit: String,
    pub visible: bool,
    pub min: String,
    pub max: String,
    pub time: i64,
    pub value: String,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/p4d/p4.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // An in-memory database lives and dies with its connection: pin one.
        let pool = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(4)
        }
        .connect_with(options)
        .await
        .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Connect and migrate until it works or `cancel` fires.
    pub async fn connect_with_retry(
        db_url: &str,
        cancel: &CancellationToken,
        who: &str,
    ) -> Option<Self> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            match Self::open(db_url).await {
                Ok(db) => {
                    info!(context = who, "store connected");
                    return Some(db);
                }
                Err(e) => {
                    warn!(context = who, error = %format!("{e:#}"), "store connect failed, retrying in {}s", RECONNECT_DELAY.as_secs());
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }

    /// Connect and bring the schema up to date.
    pub async fn open(db_url: &str) -> Result<Self> {
        let db = Self::connect(db_url).await?;
        db.migrate().await?;
        Ok(db)
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    /// Cheap liveness probe used before each cycle.
    pub async fn ping(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Config items
    // ----------------------------

    /// Read a config item; a missing item is stored with `default` and the
    /// default returned.
    pub async fn get_config_item(&self, name: &str, default: &str) -> Result<String> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM config WHERE owner = ? AND name = ?")
                .bind(CONFIG_OWNER)
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .context("get_config_item failed")?;

        match value {
            Some(v) => Ok(v),
            None => {
                self.set_config_item(name, default).await?;
                Ok(default.to_string())
            }
        }
    }

    pub async fn set_config_item(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO config (owner, name, value) VALUES (?, ?, ?)
            ON CONFLICT(owner, name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(CONFIG_OWNER)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("set_config_item failed")?;
        Ok(())
    }

    /// Integer config item; unparsable stored values yield `default`.
    pub async fn get_config_int(&self, name: &str, default: i64) -> Result<i64> {
        let raw = self.get_config_item(name, &default.to_string()).await?;
        Ok(raw.trim().parse().unwrap_or(default))
    }

    pub async fn get_config_bool(&self, name: &str, default: bool) -> Result<bool> {
        let raw = self
            .get_config_item(name, if default { "1" } else { "0" })
            .await?;
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        })
    }

    // ----------------------------
    // Scripts
    // ----------------------------

    pub async fn script_path(&self, name: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT path FROM scripts WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .context("script_path failed")
    }

    // ----------------------------
    // HomeMatic system variables
    // ----------------------------

    pub async fn upsert_hm_sys_var(&self, v: &HmSysVar) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hmsysvars (id, name, type, unit, visible, min, max, time, value)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              name=excluded.name,
              type=excluded.type,
              unit=excluded.unit,
              visible=excluded.visible,
              min=excluded.min,
              max=excluded.max,
              time=excluded.time,
              value=excluded.value
            "#,
        )
        .bind(v.id)
        .bind(&v.name)
        .bind(v.kind)
        .bind(&v.unit)
        .bind(v.visible)
        .bind(&v.min)
        .bind(&v.max)
        .bind(v.time)
        .bind(&v.value)
        .execute(&self.pool)
        .await
        .context("upsert_hm_sys_var failed")?;
        Ok(())
    }
}

#[cfg(test)]
impl Db {
    /// Fresh migrated in-memory database.
    pub async fn memory() -> Self {
        Self::open("sqlite::memory:").await.unwrap()
    }

    pub async fn upsert_script(&self, name: &str, path: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scripts (name, path) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET path = excluded.path
            "#,
        )
        .bind(name)
        .bind(path)
        .execute(&self.pool)
        .await
        .context("upsert_script failed")?;
        Ok(())
    }

    pub async fn hm_sys_vars(&self) -> Result<Vec<HmSysVar>> {
        sqlx::query_as::<_, HmSysVar>(
            "SELECT id, name, type, unit, visible, min, max, time, value FROM hmsysvars ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("hm_sys_vars failed")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
