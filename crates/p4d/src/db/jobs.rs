use anyhow::{Context, Result};

use super::Db;

pub const JOB_PENDING: &str = "P";
pub const JOB_DONE: &str = "D";

/// One row of the web front end's command queue.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub req_at: i64,
    pub state: String,
    pub command: String,
    pub address: i64,
    pub data: String,
    pub done_at: Option<i64>,
    pub result: Option<String>,
}

impl Db {

    /// All pending jobs in insertion order.
    pub async fn pending_jobs(&self) -> Result<Vec<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT id, req_at, state, command, address, data, done_at, result
            FROM jobs
            WHERE state = ?
            ORDER BY id
            "#,
        )
        .bind(JOB_PENDING)
        .fetch_all(&self.pool)
        .await
        .context("pending_jobs failed")
    }

    /// Mark a job done before it is handled. Returns `false` if the row is
    /// gone or no longer pending, in which case it must not be dispatched.
    pub async fn claim_job(&self, id: i64, done_at: i64) -> Result<bool> {
        let res = sqlx::query("UPDATE jobs SET state = ?, done_at = ? WHERE id = ? AND state = ?")
            .bind(JOB_DONE)
            .bind(done_at)
            .bind(id)
            .bind(JOB_PENDING)
            .execute(&self.pool)
            .await
            .context("claim_job failed")?;
        Ok(res.rows_affected() == 1)
    }

    pub async fn store_job_result(&self, id: i64, result: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET result = ? WHERE id = ?")
            .bind(result)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("store_job_result failed")?;
        Ok(())
    }

    /// Delete jobs requested before `before` (unix seconds), in any state.
    pub async fn cleanup_jobs(&self, before: i64) -> Result<u64> {
        let res = sqlx::query("DELETE FROM jobs WHERE req_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await
            .context("cleanup_jobs failed")?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
impl Db {
    pub async fn insert_job(&self, req_at: i64, command: &str, address: i64, data: &str) -> Result<i64> {
        let id = sqlx::query(
            r#"
            INSERT INTO jobs (req_at, state, command, address, data)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(req_at)
        .bind(JOB_PENDING)
        .bind(command)
        .bind(address)
        .bind(data)
        .execute(&self.pool)
        .await
        .context("insert_job failed")?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>> {
        sqlx::query_as::<_, Job>(
            r#"
            SELECT id, req_at, state, command, address, data, done_at, result
            FROM jobs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("get_job failed")
    }
}
