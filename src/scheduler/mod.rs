//! Historical job scheduler
//!
//! One background worker drains ticker×date tasks from the job store,
//! paginates the running-trade endpoint, and writes pages through the CSV
//! sink. Progress is durable: the pagination cursor is persisted with each
//! page, so pause, cancel, crash and auth expiry all resume from the last
//! acknowledged page instead of re-downloading.

use crate::auth::TokenManager;
use crate::client::StockbitApi;
use crate::db::models::{Job, JobStatus, Task, TaskStatus};
use crate::db::JobStore;
use crate::error::{AppError, Result};
use crate::storage::{CsvSink, Dataset};
use chrono::{NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Idle poll interval when no task is runnable.
const IDLE_POLL: Duration = Duration::from_millis(500);
/// Bound on shutdown: the worker acknowledges the stop signal at every
/// sleep and between pages.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// What the worker should do with the current task after a safe point.
enum TaskVerdict {
    Continue,
    Requeue,
    Abandon,
}

struct SchedulerInner {
    store: Arc<JobStore>,
    client: Arc<dyn StockbitApi>,
    sink: Arc<CsvSink>,
    credentials: Arc<TokenManager>,
    rest_backoff_base: Duration,
    rest_backoff_max: Duration,
    rest_max_attempts: u32,
    shutdown: watch::Receiver<bool>,
}

/// Control handle for the background worker.
pub struct JobScheduler {
    store: Arc<JobStore>,
    shutdown_tx: watch::Sender<bool>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl JobScheduler {
    /// Spawn the worker task.
    pub fn start(
        store: Arc<JobStore>,
        client: Arc<dyn StockbitApi>,
        sink: Arc<CsvSink>,
        credentials: Arc<TokenManager>,
        rest_backoff_base: Duration,
        rest_backoff_max: Duration,
        rest_max_attempts: u32,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inner = SchedulerInner {
            store: store.clone(),
            client,
            sink,
            credentials,
            rest_backoff_base,
            rest_backoff_max,
            rest_max_attempts,
            shutdown: shutdown_rx,
        };

        let handle = tokio::spawn(async move {
            tracing::info!("job worker started");
            inner.run().await;
            tracing::info!("job worker stopped");
        });

        Self {
            store,
            shutdown_tx,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    /// Create a job covering every ticker×date pair in the range.
    pub fn create_job(
        &self,
        tickers: Vec<String>,
        date_from: NaiveDate,
        date_until: NaiveDate,
        delay: Duration,
    ) -> Result<String> {
        let tickers: Vec<String> = tickers
            .into_iter()
            .map(|t| t.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect();
        if tickers.is_empty() {
            return Err(AppError::Validation("job needs at least one ticker".to_string()));
        }
        if date_from > date_until {
            return Err(AppError::Validation(format!(
                "date_from {date_from} is after date_until {date_until}"
            )));
        }

        let job = Job {
            id: Uuid::new_v4().to_string(),
            tickers,
            date_from,
            date_until,
            delay_ms: delay.as_millis() as u64,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            rows_written: 0,
            pages_fetched: 0,
            error_count: 0,
            last_error: None,
        };
        self.store.create_job(&job)?;
        self.store.append_log(
            "info",
            Some(&job.id),
            &format!(
                "created job: {} ticker(s), {} to {}",
                job.tickers.len(),
                job.date_from,
                job.date_until
            ),
        )?;
        tracing::info!(job_id = %job.id, "job created");
        Ok(job.id)
    }

    /// Pause a job. The in-flight page (if any) finishes and its cursor is
    /// persisted; the worker then returns the task to the queue. Pausing an
    /// already paused job is a no-op.
    pub fn pause(&self, job_id: &str) -> Result<()> {
        let job = self.store.load_job(job_id)?;
        match job.status {
            JobStatus::Paused => Ok(()),
            JobStatus::Running | JobStatus::Queued | JobStatus::AuthPaused => {
                self.store.update_job_status(job_id, JobStatus::Paused)?;
                self.store.append_log("info", Some(job_id), "job paused")?;
                Ok(())
            }
            status => Err(AppError::Validation(format!(
                "cannot pause job in status {}",
                status.as_str()
            ))),
        }
    }

    /// Resume a paused (or auth-paused) job at its persisted cursors.
    pub fn resume(&self, job_id: &str) -> Result<()> {
        let job = self.store.load_job(job_id)?;
        match job.status {
            JobStatus::Running => Ok(()),
            JobStatus::Paused | JobStatus::AuthPaused => {
                self.store.update_job_status(job_id, JobStatus::Running)?;
                self.store.append_log("info", Some(job_id), "job resumed")?;
                Ok(())
            }
            status => Err(AppError::Validation(format!(
                "cannot resume job in status {}",
                status.as_str()
            ))),
        }
    }

    /// Cancel a job: open tasks become skipped, the job becomes cancelled.
    pub fn cancel(&self, job_id: &str) -> Result<()> {
        let job = self.store.load_job(job_id)?;
        if job.status.is_terminal() {
            return Err(AppError::Validation(format!(
                "cannot cancel job in status {}",
                job.status.as_str()
            )));
        }
        self.store.skip_open_tasks(job_id)?;
        self.store.update_job_status(job_id, JobStatus::Cancelled)?;
        self.store.append_log("info", Some(job_id), "job cancelled")?;
        Ok(())
    }

    /// Return every auth-paused job to the runnable pool. Called when a
    /// fresh credential is set.
    pub fn resume_auth_paused(&self) -> Result<usize> {
        let ids = self.store.job_ids_with_status(JobStatus::AuthPaused)?;
        for id in &ids {
            self.store.update_job_status(id, JobStatus::Running)?;
            self.store
                .append_log("info", Some(id), "credential refreshed, job resumed")?;
        }
        if !ids.is_empty() {
            tracing::info!("auto-resumed {} auth-paused job(s)", ids.len());
        }
        Ok(ids.len())
    }

    /// Stop the worker, waiting up to the shutdown grace period.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
                // Cancels a REST request still in flight; the task cursor
                // stays at the last persisted page.
                abort.abort();
                tracing::warn!("job worker aborted after the shutdown grace period");
            }
        }
    }
}

impl SchedulerInner {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                return;
            }

            match self.tick() {
                Ok(Some(task)) => {
                    match self.process_task(task).await {
                        Ok(()) => {}
                        Err(e @ AppError::Fatal(_)) => {
                            tracing::error!("job worker stopping: {}", e);
                            return;
                        }
                        Err(e) => tracing::error!("task processing failed: {}", e),
                    }
                }
                Ok(None) => {
                    if self.sleep_cancellable(IDLE_POLL).await {
                        return;
                    }
                }
                Err(e) => {
                    // Store trouble is fatal for the worker; other
                    // components keep running.
                    tracing::error!("job worker stopping: {}", e);
                    return;
                }
            }
        }
    }

    /// Pick the next runnable task, promoting the oldest queued job when
    /// the running ones have nothing left to do.
    fn tick(&self) -> Result<Option<Task>> {
        if let Some(task) = self.store.pick_next_runnable(None)? {
            return Ok(Some(task));
        }

        // Running jobs may have just drained; roll them up before looking
        // at the queue.
        for id in self.store.job_ids_with_status(JobStatus::Running)? {
            self.finalize_job(&id)?;
        }

        if let Some(job_id) = self.store.oldest_queued_job()? {
            self.store.update_job_status(&job_id, JobStatus::Running)?;
            tracing::info!(job_id = %job_id, "job started");
            return self.store.pick_next_runnable(Some(&job_id));
        }

        Ok(None)
    }

    /// Work one (ticker, date) task: walk pages from the persisted cursor
    /// until the endpoint reports the end, honoring pause/cancel/auth
    /// signals between pages.
    async fn process_task(&mut self, task: Task) -> Result<()> {
        let job = self.store.load_job(&task.job_id)?;

        if !self.credentials.is_valid() {
            self.auth_pause(&job.id, "credential missing or expired")?;
            return Ok(());
        }

        self.store.update_task(
            &task.job_id,
            &task.ticker,
            task.date,
            TaskStatus::InProgress,
            task.next_cursor.as_deref(),
            0,
            0,
        )?;
        tracing::info!(
            job_id = %task.job_id,
            ticker = %task.ticker,
            date = %task.date,
            cursor = task.next_cursor.as_deref().unwrap_or("latest"),
            "task started"
        );

        let mut cursor = task.next_cursor.clone();
        let delay = Duration::from_millis(job.delay_ms);

        loop {
            match self.check_control(&task)? {
                TaskVerdict::Continue => {}
                TaskVerdict::Requeue => {
                    self.store.update_task(
                        &task.job_id,
                        &task.ticker,
                        task.date,
                        TaskStatus::Queued,
                        cursor.as_deref(),
                        0,
                        0,
                    )?;
                    return Ok(());
                }
                TaskVerdict::Abandon => return Ok(()),
            }

            let page = match self.fetch_with_retry(&task, cursor.as_deref()).await {
                Ok(page) => page,
                Err(AppError::AuthExpired(msg)) => {
                    // Preserve the cursor and park the whole job until a
                    // fresh credential arrives.
                    self.store.update_task(
                        &task.job_id,
                        &task.ticker,
                        task.date,
                        TaskStatus::Queued,
                        cursor.as_deref(),
                        0,
                        0,
                    )?;
                    self.auth_pause(&job.id, &msg)?;
                    return Ok(());
                }
                Err(e) => {
                    self.fail_task(&task, cursor.as_deref(), &e.to_string())?;
                    self.finalize_job(&task.job_id)?;
                    return Ok(());
                }
            };

            // The job may have been cancelled while the request was in
            // flight; a cancelled task's page is discarded, while a pause
            // still gets its in-flight page written below.
            if matches!(self.check_control(&task)?, TaskVerdict::Abandon) {
                return Ok(());
            }

            let date_str = task.date.format("%Y-%m-%d").to_string();
            let rows: Vec<Vec<String>> = page
                .rows
                .iter()
                .map(|row| row.to_csv_row(&date_str))
                .collect();
            let written = match self
                .sink
                .append(Dataset::RunningTrade, &task.ticker, task.date, &rows)
            {
                Ok(written) => written,
                Err(e @ AppError::Fatal(_)) => {
                    // Disk trouble stops the worker; the cursor still
                    // points at this page, so nothing is lost.
                    self.store.append_log("error", Some(&task.job_id), &e.to_string())?;
                    return Err(e);
                }
                Err(e) => {
                    self.fail_task(&task, cursor.as_deref(), &e.to_string())?;
                    self.finalize_job(&task.job_id)?;
                    return Ok(());
                }
            };

            cursor = page.next_cursor.clone();
            let finished = cursor.is_none();
            self.store.update_task(
                &task.job_id,
                &task.ticker,
                task.date,
                if finished {
                    TaskStatus::Done
                } else {
                    TaskStatus::InProgress
                },
                cursor.as_deref(),
                written as u64,
                1,
            )?;

            if finished {
                tracing::info!(
                    job_id = %task.job_id,
                    ticker = %task.ticker,
                    date = %task.date,
                    "task done"
                );
                self.store.append_log(
                    "info",
                    Some(&task.job_id),
                    &format!("{} {}: task done", task.ticker, task.date),
                )?;
                self.finalize_job(&task.job_id)?;
                return Ok(());
            }

            if !delay.is_zero() && self.sleep_cancellable(delay).await {
                // Shutdown mid-delay: the cursor for the next page is
                // already persisted.
                return Ok(());
            }
        }
    }

    /// Observe pause/cancel/shutdown between pages.
    fn check_control(&self, task: &Task) -> Result<TaskVerdict> {
        if *self.shutdown.borrow() {
            return Ok(TaskVerdict::Requeue);
        }
        let job = self.store.load_job(&task.job_id)?;
        Ok(match job.status {
            JobStatus::Running => TaskVerdict::Continue,
            JobStatus::Paused | JobStatus::AuthPaused | JobStatus::Queued => TaskVerdict::Requeue,
            // Cancelled (or otherwise terminal): the task was already
            // marked skipped by the control call.
            _ => TaskVerdict::Abandon,
        })
    }

    /// One page fetch with bounded exponential backoff over retryable
    /// failures. Auth and malformed failures surface immediately.
    async fn fetch_with_retry(
        &mut self,
        task: &Task,
        cursor: Option<&str>,
    ) -> Result<crate::client::types::TradePage> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.client.fetch_trades(&task.ticker, task.date, cursor).await {
                Ok(page) => return Ok(page),
                Err(e) if e.is_retryable() && attempt < self.rest_max_attempts => {
                    let delay = rest_backoff(self.rest_backoff_base, self.rest_backoff_max, attempt);
                    tracing::warn!(
                        ticker = %task.ticker,
                        date = %task.date,
                        attempt,
                        "retryable fetch error, backing off {:?}: {}",
                        delay,
                        e
                    );
                    if self.sleep_cancellable(delay).await {
                        return Err(AppError::Retryable("shutdown during backoff".to_string()));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn fail_task(&self, task: &Task, cursor: Option<&str>, message: &str) -> Result<()> {
        tracing::error!(
            job_id = %task.job_id,
            ticker = %task.ticker,
            date = %task.date,
            "task failed: {}",
            message
        );
        self.store.update_task(
            &task.job_id,
            &task.ticker,
            task.date,
            TaskStatus::Failed,
            cursor,
            0,
            0,
        )?;
        self.store.record_job_error(&task.job_id, message)?;
        self.store.append_log(
            "error",
            Some(&task.job_id),
            &format!("{} {}: {message}", task.ticker, task.date),
        )?;
        Ok(())
    }

    fn auth_pause(&self, job_id: &str, reason: &str) -> Result<()> {
        self.store.update_job_status(job_id, JobStatus::AuthPaused)?;
        self.store.append_log(
            "warn",
            Some(job_id),
            &format!("job paused, credential required: {reason}"),
        )?;
        tracing::warn!(job_id = %job_id, "job auth-paused: {}", reason);
        Ok(())
    }

    /// Roll a running job up to completed/failed once every task is
    /// terminal.
    fn finalize_job(&self, job_id: &str) -> Result<()> {
        let job = self.store.load_job(job_id)?;
        if job.status != JobStatus::Running {
            return Ok(());
        }
        let counts = self.store.task_counts(job_id)?;
        if !counts.all_terminal() {
            return Ok(());
        }
        let status = if counts.failed > 0 {
            JobStatus::Failed
        } else {
            JobStatus::Completed
        };
        self.store.update_job_status(job_id, status)?;
        self.store.append_log(
            "info",
            Some(job_id),
            &format!(
                "job {}: {} done, {} skipped, {} failed",
                status.as_str(),
                counts.done,
                counts.skipped,
                counts.failed
            ),
        )?;
        tracing::info!(job_id = %job_id, status = status.as_str(), "job finished");
        Ok(())
    }

    /// Sleep unless shutdown arrives first; returns true on shutdown.
    async fn sleep_cancellable(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown.changed() => true,
        }
    }
}

/// Backoff before the n-th retry (n starting at 1): base · 2^(n-1), capped.
fn rest_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[cfg(test)]
mod tests;
