//! Recurring re-tests of cached proxies, one job per configuration and tester.
//!
//! Jobs are created on first use by a batch and live for the whole process.
//! A job keeps its identity across reconfiguration: a changed cron
//! expression or test target reschedules it in place. Runs of the same job
//! are queued behind a per-job lock, so a cron tick and an out-of-band
//! refresh never overlap.

use crate::cache::{CacheKey, CronJobKey, KeyedCache, ProxyKey};
use crate::config::{Conf, CRON_ITEM_DELAY, CRON_PROGRESS_INTERVAL, RESULT_TTL};
use crate::error::{LabError, Result};
use crate::proxy::checker::Dialer;
use crate::proxy::models::ProxyRecord;
use crate::tester::TesterRegistry;
use chrono::Local;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn scheduler_error(err: JobSchedulerError) -> LabError {
    LabError::Scheduler(err.to_string())
}

/// Accepts classic 5-field expressions by prepending a seconds field.
pub fn normalize_cron(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct CronOptions {
    /// Pause between two proxies of one run
    pub item_delay: Duration,
    pub result_ttl: Duration,
}

impl Default for CronOptions {
    fn default() -> Self {
        Self {
            item_delay: CRON_ITEM_DELAY,
            result_ttl: RESULT_TTL,
        }
    }
}

/// Persisted form of a job, restored at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobSnapshot {
    pub key: CronJobKey,
    pub cron_expr: String,
    pub conf: Conf,
}

struct JobState {
    cron_expr: String,
    conf: Conf,
    schedule: Option<Uuid>,
}

/// One recurring job. Handed out as `Arc<CronJob>`; the same allocation is
/// returned for the lifetime of the registry.
pub struct CronJob {
    key: CronJobKey,
    state: Mutex<JobState>,
    run_lock: Mutex<()>,
}

impl CronJob {
    fn new(key: CronJobKey, cron_expr: &str, conf: &Conf) -> Self {
        Self {
            key,
            state: Mutex::new(JobState {
                cron_expr: cron_expr.to_string(),
                conf: conf.clone(),
                schedule: None,
            }),
            run_lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &CronJobKey {
        &self.key
    }

    pub async fn cron_expr(&self) -> String {
        self.state.lock().await.cron_expr.clone()
    }

    pub async fn conf(&self) -> Conf {
        self.state.lock().await.conf.clone()
    }

    pub async fn schedule_id(&self) -> Option<Uuid> {
        self.state.lock().await.schedule
    }

    async fn snapshot(&self) -> CronJobSnapshot {
        let state = self.state.lock().await;
        CronJobSnapshot {
            key: self.key.clone(),
            cron_expr: state.cron_expr.clone(),
            conf: state.conf.clone(),
        }
    }
}

/// Outcome counters of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// The run stopped early because the registry is shutting down
    pub cancelled: bool,
}

struct Inner {
    scheduler: JobScheduler,
    jobs: Mutex<HashMap<CronJobKey, Arc<CronJob>>>,
    cache: KeyedCache,
    testers: TesterRegistry,
    dialer: Arc<dyn Dialer>,
    options: CronOptions,
    shutting_down: AtomicBool,
}

/// Owner of every recurring job. Cloning shares the same registry.
#[derive(Clone)]
pub struct CronRegistry {
    inner: Arc<Inner>,
}

impl CronRegistry {
    pub async fn new(
        cache: KeyedCache,
        testers: TesterRegistry,
        dialer: Arc<dyn Dialer>,
        options: CronOptions,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        Ok(Self {
            inner: Arc::new(Inner {
                scheduler,
                jobs: Mutex::new(HashMap::new()),
                cache,
                testers,
                dialer,
                options,
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn testers(&self) -> &TesterRegistry {
        &self.inner.testers
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<()> {
        self.inner.scheduler.start().await.map_err(scheduler_error)
    }

    pub async fn job(&self, key: &CronJobKey) -> Option<Arc<CronJob>> {
        self.inner.jobs.lock().await.get(key).cloned()
    }

    pub async fn job_count(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }

    /// Returns the job for `key`, creating or updating it as needed.
    ///
    /// An existing job whose cron expression and test target are unchanged
    /// is returned untouched. Otherwise it is updated in place and
    /// rescheduled; scheduling failures are logged and leave the job
    /// unscheduled but usable for out-of-band runs.
    pub async fn get_or_upsert(
        &self,
        key: &CronJobKey,
        cron_expr: &str,
        conf: &Conf,
    ) -> Result<Arc<CronJob>> {
        let mut jobs = self.inner.jobs.lock().await;

        if let Some(job) = jobs.get(key).cloned() {
            let unchanged = {
                let state = job.state.lock().await;
                state.cron_expr == cron_expr && state.conf.same_test_target(conf)
            };
            if unchanged {
                return Ok(job);
            }
            let old = {
                let mut state = job.state.lock().await;
                info!(job = %key, old = %state.cron_expr, new = cron_expr, "updating cron job");
                state.cron_expr = cron_expr.to_string();
                state.conf = conf.clone();
                state.schedule.take()
            };
            if let Some(old) = old {
                if let Err(err) = self.inner.scheduler.remove(&old).await {
                    warn!(job = %key, error = %err, "failed to remove old schedule");
                }
            }
            let schedule = self.schedule_logged(&job, cron_expr).await;
            job.state.lock().await.schedule = schedule;
            self.persist(&job).await?;
            return Ok(job);
        }

        let job = Arc::new(CronJob::new(key.clone(), cron_expr, conf));
        let schedule = self.schedule_logged(&job, cron_expr).await;
        job.state.lock().await.schedule = schedule;
        jobs.insert(key.clone(), Arc::clone(&job));
        info!(job = %key, cron = cron_expr, "cron job created");
        self.persist(&job).await?;
        Ok(job)
    }

    async fn schedule_logged(&self, job: &Arc<CronJob>, cron_expr: &str) -> Option<Uuid> {
        match self.schedule(job, cron_expr).await {
            Ok(id) => Some(id),
            Err(err) => {
                error!(job = %job.key, cron = cron_expr, error = %err, "failed to schedule job");
                None
            }
        }
    }

    async fn schedule(&self, job: &Arc<CronJob>, cron_expr: &str) -> Result<Uuid> {
        let expr = normalize_cron(cron_expr);
        let registry: Weak<Inner> = Arc::downgrade(&self.inner);
        let key = job.key.clone();
        // expressions are read in the host's local time, not UTC
        let scheduled = Job::new_async_tz(expr.as_str(), Local, move |_id, _scheduler| {
            let registry = registry.clone();
            let key = key.clone();
            Box::pin(async move {
                let Some(inner) = registry.upgrade() else {
                    return;
                };
                CronRegistry { inner }.run_scheduled(&key).await;
            })
        })
        .map_err(scheduler_error)?;
        self.inner.scheduler.add(scheduled).await.map_err(scheduler_error)
    }

    async fn persist(&self, job: &CronJob) -> Result<()> {
        let snapshot = job.snapshot().await;
        self.inner.cache.set(&job.key, &snapshot, None).await
    }

    /// Re-creates and schedules every persisted job.
    pub async fn restore(&self) -> Result<usize> {
        let mut snapshots: Vec<CronJobSnapshot> = Vec::new();
        let scan = self
            .inner
            .cache
            .scan_prefix(
                CronJobKey::PREFIX.as_bytes(),
                |_, snapshot: CronJobSnapshot| {
                    snapshots.push(snapshot);
                    Ok(())
                },
                false,
            )
            .await;
        if let Err(err) = scan {
            warn!(error = %err, "some cron jobs could not be restored");
        }

        let mut restored = 0;
        for mut snapshot in snapshots {
            if self.inner.testers.get(snapshot.key.tester).is_none() {
                debug!(job = %snapshot.key, "tester disabled, job not restored");
                continue;
            }
            snapshot.conf.resolve_icons();
            self.get_or_upsert(&snapshot.key, &snapshot.cron_expr, &snapshot.conf)
                .await?;
            restored += 1;
        }
        info!(restored, "cron jobs restored");
        Ok(restored)
    }

    async fn run_scheduled(&self, key: &CronJobKey) {
        match self.job(key).await {
            Some(job) => {
                self.run_task(&job, None).await;
            }
            None => warn!(job = %key, "scheduled job no longer registered"),
        }
    }

    /// Starts a full run in the background.
    pub fn spawn_run(&self, job: Arc<CronJob>) -> JoinHandle<RunSummary> {
        let registry = self.clone();
        tokio::spawn(async move { registry.run_task(&job, None).await })
    }

    /// Starts a run limited to `filter` in the background.
    pub fn spawn_filtered(
        &self,
        job: Arc<CronJob>,
        filter: HashSet<ProxyKey>,
    ) -> JoinHandle<RunSummary> {
        let registry = self.clone();
        tokio::spawn(async move { registry.run_task(&job, Some(&filter)).await })
    }

    /// Re-tests the job's cached proxies one by one.
    ///
    /// Only keys in `filter` are tested when it is given. A failure or panic
    /// on one proxy is logged and the run moves on to the next.
    pub async fn run_task(&self, job: &CronJob, filter: Option<&HashSet<ProxyKey>>) -> RunSummary {
        let _running = job.run_lock.lock().await;
        let mut summary = RunSummary::default();
        if self.is_shutting_down() {
            summary.cancelled = true;
            return summary;
        }

        let Some(tester) = self.inner.testers.get(job.key.tester).cloned() else {
            warn!(job = %job.key, "tester not registered, skipping run");
            return summary;
        };
        let conf = job.conf().await;

        let mut queue: Vec<(ProxyKey, ProxyRecord)> = Vec::new();
        let scan = self
            .inner
            .cache
            .scan_prefix(
                &job.key.proxy_prefix(),
                |raw, record: ProxyRecord| {
                    let key = ProxyKey::from_key(&raw)?;
                    if filter.map_or(true, |keys| keys.contains(&key)) {
                        queue.push((key, record));
                    }
                    Ok(())
                },
                false,
            )
            .await;
        if let Err(err) = scan {
            warn!(job = %job.key, error = %err, "skipped unreadable cached proxies");
        }

        summary.total = queue.len();
        info!(
            job = %job.key,
            total = summary.total,
            filtered = filter.is_some(),
            "cron run started"
        );

        let result_ttl = Some(self.inner.options.result_ttl);
        for (index, (key, record)) in queue.iter().enumerate() {
            if self.is_shutting_down() {
                summary.cancelled = true;
                break;
            }
            if index > 0 {
                tokio::time::sleep(self.inner.options.item_delay).await;
            }

            let outcome = AssertUnwindSafe(tester.run_test(record, &conf, self.inner.dialer.as_ref()))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(LabError::TesterPanic {
                        tester: tester.name().to_string(),
                        proxy: key.to_string(),
                        message: panic_message(panic.as_ref()),
                    })
                });

            let stored = match outcome {
                Ok(result) => {
                    self.inner
                        .cache
                        .set(&key.result_key(tester.tester_type()), &result, result_ttl)
                        .await
                }
                Err(err) => Err(err),
            };
            match stored {
                Ok(()) => summary.succeeded += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(job = %job.key, proxy = %key, error = %err, "test failed");
                }
            }

            let done = index + 1;
            if index == 0 || done % CRON_PROGRESS_INTERVAL == 0 || done == summary.total {
                info!(job = %job.key, done, total = summary.total, "cron progress");
            }
        }

        info!(
            job = %job.key,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "cron run finished"
        );
        summary
    }

    /// Stops new runs, waits for in-flight runs to reach a stopping point,
    /// then stops the scheduler.
    pub async fn shutdown(&self) -> Result<()> {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("cron registry shutting down");
        let jobs: Vec<Arc<CronJob>> = self.inner.jobs.lock().await.values().cloned().collect();
        for job in jobs {
            let _drained = job.run_lock.lock().await;
        }
        let mut scheduler = self.inner.scheduler.clone();
        scheduler.shutdown().await.map_err(scheduler_error)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
