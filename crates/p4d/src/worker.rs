//! Job queue worker.
//!
//! Runs next to the control loop with its own store connection. Each cycle
//! waits for the poll interval (or a [`WorkerHandle::wake`] nudge), then
//! claims and runs every pending job in id order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::now_unix;
use crate::commands::{dispatch, JobContext};
use crate::db::{Db, Job};
use crate::homematic::SysVarSource;
use crate::link::DeviceArbiter;
use crate::state::SharedState;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(50);

/// Wall-clock seconds between job table cleanups.
pub const CLEANUP_EVERY: i64 = 6 * 60 * 60;
/// Jobs requested longer ago than this are purged.
pub const JOB_RETENTION: i64 = 2 * 24 * 60 * 60;

const STOP_TIMEOUT: Duration = Duration::from_secs(3);

pub struct JobWorker {
    db_url: String,
    arbiter: Arc<DeviceArbiter>,
    shared: SharedState,
    sysvars: Arc<dyn SysVarSource>,
    poll_interval: Duration,
}

pub struct WorkerHandle {
    cancel: CancellationToken,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Cut the current wait short.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Cancel the worker and wait up to 3s for it. Returns `false` if the
    /// task had to be aborted.
    pub async fn stop(self) -> bool {
        self.cancel.cancel();
        self.wake();

        let mut task = self.task;
        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(_) => true,
            Err(_) => {
                warn!("job worker did not stop in time, aborting");
                task.abort();
                false
            }
        }
    }
}

impl JobWorker {
    pub fn new(
        db_url: impl Into<String>,
        arbiter: Arc<DeviceArbiter>,
        shared: SharedState,
        sysvars: Arc<dyn SysVarSource>,
    ) -> Self {
        Self {
            db_url: db_url.into(),
            arbiter,
            shared,
            sysvars,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn start(self, cancel: CancellationToken) -> WorkerHandle {
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(self.run(cancel.clone(), Arc::clone(&wake)));
        WorkerHandle { cancel, wake, task }
    }

    async fn run(self, cancel: CancellationToken, wake: Arc<Notify>) {
        info!(poll_sec = self.poll_interval.as_secs(), "job worker started");
        let mut last_cleanup = now_unix();

        'connect: loop {
            let Some(db) = Db::connect_with_retry(&self.db_url, &cancel, "job worker").await else {
                break;
            };
            let ctx = JobContext {
                db: &db,
                arbiter: &self.arbiter,
                shared: &self.shared,
                sysvars: &self.sysvars,
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        db.close().await;
                        break 'connect;
                    }
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }

                if !db.ping().await {
                    warn!("job worker lost its store connection, reconnecting");
                    db.close().await;
                    continue 'connect;
                }

                if let Err(e) = perform_requests(&ctx).await {
                    warn!(error = %format!("{e:#}"), "performing job requests failed");
                }

                let now = now_unix();
                if now - last_cleanup >= CLEANUP_EVERY {
                    match cleanup(&db, now).await {
                        Ok(n) => info!(removed = n, "job table cleaned up"),
                        Err(e) => warn!(error = %format!("{e:#}"), "job cleanup failed"),
                    }
                    last_cleanup = now;
                }
            }
        }
        info!("job worker stopped");
    }
}

/// Fetch all pending jobs and run them.
pub async fn perform_requests(ctx: &JobContext<'_>) -> Result<usize> {
    let jobs = ctx.db.pending_jobs().await?;
    if jobs.is_empty() {
        return Ok(0);
    }
    process_jobs(ctx, jobs).await
}

/// Claim and run `jobs`. A job that is no longer pending when its turn
/// comes (finished elsewhere or purged) is skipped.
pub async fn process_jobs(ctx: &JobContext<'_>, jobs: Vec<Job>) -> Result<usize> {
    let mut processed = 0;
    for job in jobs {
        if !ctx.db.claim_job(job.id, now_unix()).await? {
            debug!(job = job.id, "job no longer pending, skipping");
            continue;
        }
        info!(
            job = job.id,
            command = %job.command,
            address = %format!("0x{:04x}", job.address),
            data = %job.data,
            "processing job"
        );

        let started = Instant::now();
        let result = dispatch(ctx, &job).await;
        ctx.db.store_job_result(job.id, &result.to_string()).await?;
        processed += 1;

        info!(
            job = job.id,
            success = result.is_success(),
            result = %result,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "job done"
        );
    }
    Ok(processed)
}

/// Drop jobs requested more than [`JOB_RETENTION`] seconds before `now`.
pub async fn cleanup(db: &Db, now: i64) -> Result<u64> {
    db.cleanup_jobs(now - JOB_RETENTION).await
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::JOB_DONE;
    use crate::homematic::DisabledSysVars;
    use crate::refresh::init_menu;
    use crate::sim::SimulatedController;
    use crate::state::SystemState;

    fn parts() -> (Arc<DeviceArbiter>, SharedState, Arc<dyn SysVarSource>) {
        let arbiter = DeviceArbiter::new("/dev/sim", Box::new(SimulatedController::heating_plant()));
        (Arc::new(arbiter), SystemState::shared(now_unix()), Arc::new(DisabledSysVars))
    }

    fn well_formed(result: &str) -> bool {
        ["success:", "success#", "fail:", "fail#"]
            .iter()
            .any(|p| result.starts_with(p))
    }

    #[tokio::test]
    async fn every_pending_job_ends_done() {
        let db = Db::memory().await;
        let (arbiter, shared, sysvars) = parts();
        init_menu(&db, &arbiter).await.unwrap();
        let ctx = JobContext { db: &db, arbiter: &arbiter, shared: &shared, sysvars: &sysvars };

        let now = now_unix();
        for (cmd, addr, data) in [
            ("getp", 2, ""),
            ("setp", 2, "99"),
            ("check-login", 0, "p4:wrong"),
            ("bogus", 0, ""),
            ("read-config", 0, "user"),
        ] {
            db.insert_job(now, cmd, addr, data).await.unwrap();
        }

        assert_eq!(perform_requests(&ctx).await.unwrap(), 5);
        assert!(db.pending_jobs().await.unwrap().is_empty());
        for id in 1..=5 {
            let job = db.get_job(id).await.unwrap().unwrap();
            assert_eq!(job.state, JOB_DONE);
            assert!(job.done_at.is_some());
            let result = job.result.unwrap();
            assert!(well_formed(&result), "job {id}: {result}");
        }
        assert_eq!(perform_requests(&ctx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cleanup_keeps_recent_jobs() {
        let db = Db::memory().await;
        let now = 10 * JOB_RETENTION;
        let old = db.insert_job(now - JOB_RETENTION - 1, "getv", 0, "").await.unwrap();
        let edge = db.insert_job(now - JOB_RETENTION, "getv", 0, "").await.unwrap();
        let fresh = db.insert_job(now - 60, "getv", 0, "").await.unwrap();

        assert_eq!(cleanup(&db, now).await.unwrap(), 1);
        assert!(db.get_job(old).await.unwrap().is_none());
        assert!(db.get_job(edge).await.unwrap().is_some());
        assert!(db.get_job(fresh).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn purged_job_is_not_dispatched() {
        let db = Db::memory().await;
        let (arbiter, shared, sysvars) = parts();
        let ctx = JobContext { db: &db, arbiter: &arbiter, shared: &shared, sysvars: &sysvars };

        let now = now_unix();
        db.insert_job(now - 3 * 24 * 60 * 60, "initmenu", 0, "").await.unwrap();
        db.insert_job(now, "initvaluefacts", 0, "").await.unwrap();

        let fetched = db.pending_jobs().await.unwrap();
        assert_eq!(fetched.len(), 2);
        cleanup(&db, now).await.unwrap();

        assert_eq!(process_jobs(&ctx, fetched.clone()).await.unwrap(), 1);
        let triggers = shared.write().await.take_triggers();
        assert!(!triggers.init_menu);
        assert!(triggers.update_value_facts);

        // Same batch again: nothing is pending any more.
        assert_eq!(process_jobs(&ctx, fetched).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn worker_runs_jobs_on_wake_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("p4.db").display());
        let db = Db::open(&url).await.unwrap();
        let (arbiter, shared, sysvars) = parts();

        let handle = JobWorker::new(&url, arbiter, shared, sysvars).start(CancellationToken::new());
        let id = db.insert_job(now_unix(), "check-login", 0, "p4:nope").await.unwrap();
        handle.wake();

        let mut result = None;
        for _ in 0..250 {
            result = db.get_job(id).await.unwrap().and_then(|j| j.result);
            if result.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(result.as_deref(), Some("fail:login-denied"));
        assert!(handle.stop().await);
    }

    #[tokio::test]
    async fn stop_while_store_unreachable() {
        let (arbiter, shared, sysvars) = parts();
        let handle = JobWorker::new("sqlite:/nonexistent/dir/p4.db", arbiter, shared, sysvars)
            .start(CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.stop().await);
    }
}
