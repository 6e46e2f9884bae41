use anyhow::{Context, Result};

use super::Db;

pub const AGGREGATE_RAW: &str = "S";
pub const AGGREGATE_AVG: &str = "A";

/// Value fact types.
pub const TYPE_VALUE: &str = "VA";
pub const TYPE_DIG_OUT: &str = "DO";
pub const TYPE_DIG_IN: &str = "DI";
pub const TYPE_ANL_OUT: &str = "AO";
/// Controller status pseudo facts, see [`STATUS_STATE`] and [`STATUS_MODE`].
pub const TYPE_STATUS: &str = "UD";
pub const STATUS_STATE: i64 = 0;
pub const STATUS_MODE: i64 = 1;

pub const FACT_ACTIVE: &str = "A";
pub const FACT_DISABLED: &str = "D";

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Sample {
    pub time: i64,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub address: i64,
    pub aggregate: String,
    /// Already scaled by `factor`.
    pub value: f64,
    pub factor: i64,
    pub text: Option<String>,
    pub samples: i64,
}

/// Scaling and labelling for one (type, address) value source.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ValueFact {
    #[sqlx(rename = "type")]
    pub kind: String,
    pub address: i64,
    pub name: String,
    pub title: String,
    pub unit: String,
    pub factor: i64,
    pub state: String,
}

impl ValueFact {
    pub fn factor(&self) -> i64 {
        self.factor.max(1)
    }

    /// Title for mails and menus, falling back to the technical name.
    pub fn label(&self) -> &str {
        if self.title.is_empty() {
            &self.name
        } else {
            &self.title
        }
    }
}

impl Db {
    // ----------------------------
    // Samples
    // ----------------------------

    pub async fn insert_sample(
        &self,
        time: i64,
        kind: &str,
        address: i64,
        value: f64,
        factor: i64,
        text: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO samples (time, type, address, aggregate, value, factor, text, samples)
            VALUES (?, ?, ?, ?, ?, ?, ?, 1)
            "#,
        )
        .bind(time)
        .bind(kind)
        .bind(address)
        .bind(AGGREGATE_RAW)
        .bind(value)
        .bind(factor)
        .bind(text)
        .execute(&self.pool)
        .await
        .context("insert_sample failed")?;
        Ok(())
    }

    /// Newest raw sample at or before `time`.
    pub async fn sample_at_or_before(&self, kind: &str, address: i64, time: i64) -> Result<Option<Sample>> {
        sqlx::query_as::<_, Sample>(
            r#"
            SELECT time, type, address, aggregate, value, factor, text, samples
            FROM samples
            WHERE type = ? AND address = ? AND aggregate = ? AND time <= ?
            ORDER BY time DESC
            LIMIT 1
            "#,
        )
        .bind(kind)
        .bind(address)
        .bind(AGGREGATE_RAW)
        .bind(time)
        .fetch_optional(&self.pool)
        .await
        .context("sample_at_or_before failed")
    }

    pub async fn latest_sample(&self, kind: &str, address: i64) -> Result<Option<Sample>> {
        self.sample_at_or_before(kind, address, i64::MAX).await
    }

    /// Condense raw samples older than `before` into one averaged row per
    /// (type, address, bucket) and delete the condensed rows, atomically.
    /// `before` is rounded down to a bucket boundary so a bucket is only
    /// ever condensed whole. Returns (aggregate rows written, raw rows
    /// removed).
    pub async fn aggregate_samples(&self, before: i64, bucket_secs: i64) -> Result<(u64, u64)> {
        let bucket = bucket_secs.max(60);
        let before = before.div_euclid(bucket) * bucket;
        let mut tx = self.pool.begin().await.context("aggregate begin failed")?;

        let written = sqlx::query(
            r#"
            INSERT INTO samples (time, type, address, aggregate, value, factor, text, samples)
            SELECT (time / ?) * ?, type, address, ?, AVG(value), MAX(factor), NULL, SUM(samples)
            FROM samples
            WHERE aggregate = ? AND time < ?
            GROUP BY (time / ?), type, address
            "#,
        )
        .bind(bucket)
        .bind(bucket)
        .bind(AGGREGATE_AVG)
        .bind(AGGREGATE_RAW)
        .bind(before)
        .bind(bucket)
        .execute(&mut *tx)
        .await
        .context("aggregate insert failed")?
        .rows_affected();

        let removed = sqlx::query("DELETE FROM samples WHERE aggregate = ? AND time < ?")
            .bind(AGGREGATE_RAW)
            .bind(before)
            .execute(&mut *tx)
            .await
            .context("aggregate delete failed")?
            .rows_affected();

        tx.commit().await.context("aggregate commit failed")?;
        Ok((written, removed))
    }

    // ----------------------------
    // Value facts
    // ----------------------------

    /// Insert or refresh a fact's labelling. New facts start disabled; the
    /// state of an existing fact is left alone.
    pub async fn upsert_value_fact(
        &self,
        kind: &str,
        address: i64,
        name: &str,
        title: &str,
        unit: &str,
        factor: i64,
    ) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO valuefacts (type, address, name, title, unit, factor, state)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(type, address) DO NOTHING
            "#,
        )
        .bind(kind)
        .bind(address)
        .bind(name)
        .bind(title)
        .bind(unit)
        .bind(factor)
        .bind(FACT_DISABLED)
        .execute(&self.pool)
        .await
        .context("upsert_value_fact insert failed")?
        .rows_affected()
            == 1;

        if !inserted {
            sqlx::query(
                r#"
                UPDATE valuefacts SET name = ?, title = ?, unit = ?, factor = ?
                WHERE type = ? AND address = ?
                "#,
            )
            .bind(name)
            .bind(title)
            .bind(unit)
            .bind(factor)
            .bind(kind)
            .bind(address)
            .execute(&self.pool)
            .await
            .context("upsert_value_fact update failed")?;
        }
        Ok(inserted)
    }

    pub async fn value_fact(&self, kind: &str, address: i64) -> Result<Option<ValueFact>> {
        sqlx::query_as::<_, ValueFact>(
            r#"
            SELECT type, address, name, title, unit, factor, state
            FROM valuefacts
            WHERE type = ? AND address = ?
            "#,
        )
        .bind(kind)
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .context("value_fact failed")
    }

    pub async fn value_facts(&self, active_only: bool) -> Result<Vec<ValueFact>> {
        sqlx::query_as::<_, ValueFact>(
            r#"
            SELECT type, address, name, title, unit, factor, state
            FROM valuefacts
            WHERE (? = 0 OR state = ?)
            ORDER BY type, address
            "#,
        )
        .bind(active_only)
        .bind(FACT_ACTIVE)
        .fetch_all(&self.pool)
        .await
        .context("value_facts failed")
    }

    // ----------------------------
    // Schema conf
    // ----------------------------

    /// Ensure a schemaconf row exists; returns `true` if one was added.
    pub async fn ensure_schema_conf(&self, kind: &str, address: i64) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO schemaconf (type, address, kind, state) VALUES (?, ?, 'value', 'A')
            ON CONFLICT(type, address) DO NOTHING
            "#,
        )
        .bind(kind)
        .bind(address)
        .execute(&self.pool)
        .await
        .context("ensure_schema_conf failed")?;
        Ok(res.rows_affected() == 1)
    }
}

#[cfg(test)]
impl Db {
    pub async fn samples_for(&self, kind: &str, address: i64) -> Result<Vec<Sample>> {
        sqlx::query_as::<_, Sample>(
            r#"
            SELECT time, type, address, aggregate, value, factor, text, samples
            FROM samples
            WHERE type = ? AND address = ?
            ORDER BY time, aggregate
            "#,
        )
        .bind(kind)
        .bind(address)
        .fetch_all(&self.pool)
        .await
        .context("samples_for failed")
    }

    pub async fn set_value_fact_state(&self, kind: &str, address: i64, active: bool) -> Result<()> {
        sqlx::query("UPDATE valuefacts SET state = ? WHERE type = ? AND address = ?")
            .bind(if active { FACT_ACTIVE } else { FACT_DISABLED })
            .bind(kind)
            .bind(address)
            .execute(&self.pool)
            .await
            .context("set_value_fact_state failed")?;
        Ok(())
    }

    pub async fn count_schema_conf(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM schemaconf")
            .fetch_one(&self.pool)
            .await
            .context("count_schema_conf failed")
    }
}

#[cfg(test)]
impl ValueFact {
    pub fn is_active(&self) -> bool {
        self.state == FACT_ACTIVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn latest_and_windowed_lookup() {
        let db = Db::memory().await;
        db.insert_sample(100, "VA", 1, 20.0, 2, None).await.unwrap();
        db.insert_sample(200, "VA", 1, 25.0, 2, None).await.unwrap();
        db.insert_sample(300, "VA", 1, 30.0, 2, None).await.unwrap();
        db.insert_sample(300, "VA", 2, 99.0, 1, None).await.unwrap();

        assert_eq!(db.latest_sample("VA", 1).await.unwrap().unwrap().value, 30.0);
        assert_eq!(db.sample_at_or_before("VA", 1, 250).await.unwrap().unwrap().time, 200);
        assert!(db.sample_at_or_before("VA", 1, 50).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn aggregation_condenses_old_rows() {
        let db = Db::memory().await;
        // Two samples in bucket [0, 900), one in [900, 1800), one recent.
        db.insert_sample(100, "VA", 1, 10.0, 1, None).await.unwrap();
        db.insert_sample(200, "VA", 1, 20.0, 1, None).await.unwrap();
        db.insert_sample(1000, "VA", 1, 40.0, 1, None).await.unwrap();
        db.insert_sample(5000, "VA", 1, 50.0, 1, None).await.unwrap();

        let (written, removed) = db.aggregate_samples(2000, 900).await.unwrap();
        assert_eq!((written, removed), (2, 3));

        let rows = db.samples_for("VA", 1).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].aggregate, AGGREGATE_AVG);
        assert_eq!(rows[0].time, 0);
        assert_eq!(rows[0].value, 15.0);
        assert_eq!(rows[0].samples, 2);
        assert_eq!(rows[1].time, 900);
        assert_eq!(rows[2].aggregate, AGGREGATE_RAW);
        assert_eq!(rows[2].time, 5000);

        // Re-running leaves aggregated rows alone.
        assert_eq!(db.aggregate_samples(2000, 900).await.unwrap(), (0, 0));
    }

    #[tokio::test]
    async fn value_fact_state_survives_refresh() {
        let db = Db::memory().await;
        assert!(db.upsert_value_fact("VA", 0, "temp", "Kessel", "°", 2).await.unwrap());
        db.set_value_fact_state("VA", 0, true).await.unwrap();

        assert!(!db.upsert_value_fact("VA", 0, "temp", "Kesseltemperatur", "°", 2).await.unwrap());
        let f = db.value_fact("VA", 0).await.unwrap().unwrap();
        assert!(f.is_active());
        assert_eq!(f.label(), "Kesseltemperatur");

        db.upsert_value_fact("VA", 1, "o2", "", "%", 10).await.unwrap();
        assert_eq!(db.value_facts(true).await.unwrap().len(), 1);
        assert_eq!(db.value_facts(false).await.unwrap().len(), 2);
        assert_eq!(db.value_fact("VA", 1).await.unwrap().unwrap().label(), "o2");
    }

    #[tokio::test]
    async fn schema_conf_is_idempotent() {
        let db = Db::memory().await;
        assert!(db.ensure_schema_conf("VA", 0).await.unwrap());
        assert!(!db.ensure_schema_conf("VA", 0).await.unwrap());
        assert_eq!(db.count_schema_conf().await.unwrap(), 1);
    }
}
