//! Durable job store
//!
//! Single-file SQLite database holding jobs, their ticker×date tasks, and
//! a capped log. All mutations go through one connection behind a mutex;
//! every status transition is persisted before it becomes observable to
//! other components.

pub mod models;

mod jobs;
mod logs;
mod migrations;
mod tasks;

use crate::error::Result;
use chrono::NaiveDate;
use models::{Job, JobStatus, LogEntry, Task, TaskCounts, TaskStatus};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

/// SQLite-backed store for jobs, tasks and logs.
pub struct JobStore {
    conn: Mutex<Connection>,
}

impl JobStore {
    /// Open (or create) the store, run migrations, and reclaim tasks left
    /// `in_progress` by an earlier crash back to `queued`.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.conn.lock();
        migrations::run_migrations(&conn)?;

        let reclaimed = tasks::requeue_in_progress(&conn, None)?;
        if reclaimed > 0 {
            tracing::warn!("reclaimed {} orphaned in-progress task(s)", reclaimed);
        }
        Ok(())
    }

    // ========== Jobs ==========

    pub fn create_job(&self, job: &Job) -> Result<()> {
        let mut conn = self.conn.lock();
        jobs::create_job(&mut conn, job)
    }

    pub fn load_job(&self, id: &str) -> Result<Job> {
        let conn = self.conn.lock();
        jobs::load_job(&conn, id)
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        jobs::list_jobs(&conn, status)
    }

    pub fn update_job_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let conn = self.conn.lock();
        jobs::update_job_status(&conn, id, status)
    }

    pub fn record_job_error(&self, id: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock();
        jobs::record_job_error(&conn, id, message)
    }

    /// Oldest job currently queued, if any.
    pub fn oldest_queued_job(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        jobs::oldest_with_status(&conn, JobStatus::Queued)
    }

    /// Ids of all jobs in the given status, oldest first.
    pub fn job_ids_with_status(&self, status: JobStatus) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        jobs::ids_with_status(&conn, status)
    }

    pub fn task_counts(&self, job_id: &str) -> Result<TaskCounts> {
        let conn = self.conn.lock();
        jobs::task_counts(&conn, job_id)
    }

    // ========== Tasks ==========

    /// Oldest queued task of any running job (or of one job when scoped).
    pub fn pick_next_runnable(&self, job_id: Option<&str>) -> Result<Option<Task>> {
        let conn = self.conn.lock();
        tasks::pick_next_runnable(&conn, job_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn update_task(
        &self,
        job_id: &str,
        ticker: &str,
        date: NaiveDate,
        status: TaskStatus,
        next_cursor: Option<&str>,
        rows_written_delta: u64,
        pages_fetched_delta: u64,
    ) -> Result<()> {
        let mut conn = self.conn.lock();
        tasks::update_task(
            &mut conn,
            job_id,
            ticker,
            date,
            status,
            next_cursor,
            rows_written_delta,
            pages_fetched_delta,
        )
    }

    pub fn job_tasks(&self, job_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn.lock();
        tasks::job_tasks(&conn, job_id)
    }

    /// Return a job's in-flight tasks to the queue, preserving cursors.
    pub fn requeue_in_progress(&self, job_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        tasks::requeue_in_progress(&conn, Some(job_id))
    }

    /// Skip all open tasks of a job (cancellation).
    pub fn skip_open_tasks(&self, job_id: &str) -> Result<usize> {
        let conn = self.conn.lock();
        tasks::skip_open_tasks(&conn, job_id)
    }

    // ========== Logs ==========

    pub fn append_log(&self, level: &str, job_id: Option<&str>, message: &str) -> Result<()> {
        let conn = self.conn.lock();
        logs::append(&conn, level, job_id, message)
    }

    pub fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock();
        logs::recent(&conn, limit)
    }
}
