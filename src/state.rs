//! Application façade
//!
//! `AppState` wires the credential store, job store, CSV sink, REST client,
//! scheduler and stream manager together and exposes the typed methods a
//! control surface needs. It is transport-agnostic: an HTTP layer, a CLI
//! or a test can drive it the same way.

use crate::auth::{CredentialStatus, TokenManager};
use crate::client::{StockbitApi, StockbitClient};
use crate::config::AppConfig;
use crate::db::models::{Job, JobStatus, LogEntry, Task, TaskCounts};
use crate::db::JobStore;
use crate::error::Result;
use crate::scheduler::JobScheduler;
use crate::storage::{CsvFileInfo, CsvSink, Dataset};
use crate::stream::{SessionConfig, SessionStats, StreamManager};
use chrono::NaiveDate;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Default pause between running-trade page fetches.
const DEFAULT_PAGE_DELAY: Duration = Duration::from_secs(3);

/// Job snapshot with its tasks and progress rollup.
#[derive(Debug, Clone, Serialize)]
pub struct JobDetail {
    pub job: Job,
    pub tasks: Vec<Task>,
    pub counts: TaskCounts,
}

/// Shared application state; one per process.
pub struct AppState {
    credentials: Arc<TokenManager>,
    store: Arc<JobStore>,
    sink: Arc<CsvSink>,
    scheduler: JobScheduler,
    streams: StreamManager,
}

impl AppState {
    /// Build every component and start the background worker. Errors here
    /// are fatal init failures (unwritable directories, unopenable job
    /// database).
    pub fn new(config: AppConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.config_dir)?;

        let credentials = Arc::new(TokenManager::new(config.token_file()));
        let store = Arc::new(JobStore::new(&config.jobs_db_file())?);
        let sink = Arc::new(CsvSink::new(&config.data_dir)?);
        let client: Arc<dyn StockbitApi> =
            Arc::new(StockbitClient::new(&config, credentials.clone())?);

        let scheduler = JobScheduler::start(
            store.clone(),
            client.clone(),
            sink.clone(),
            credentials.clone(),
            config.rest_backoff_base,
            config.rest_backoff_max,
            config.rest_max_attempts,
        );

        let session_config = SessionConfig {
            websocket_url: config.websocket_url.clone(),
            ping_interval: config.ping_interval,
            pong_timeout: config.pong_timeout,
            backoff_base: config.stream_backoff_base,
            backoff_max: config.stream_backoff_max,
            max_retries: None,
            refresh: None,
        };
        let streams = StreamManager::new(
            client,
            sink.clone(),
            credentials.clone(),
            session_config,
        );

        tracing::info!(
            data_dir = %config.data_dir.display(),
            config_dir = %config.config_dir.display(),
            "application state initialized"
        );

        Ok(Self {
            credentials,
            store,
            sink,
            scheduler,
            streams,
        })
    }

    // ========== Credentials ==========

    /// Store a fresh bearer token (and optional cookies). Jobs parked on
    /// an expired credential return to the runnable pool.
    pub fn set_token(&self, token: &str, cookies: Option<&str>) -> Result<CredentialStatus> {
        let status = self.credentials.set(token, cookies)?;
        if status.valid {
            self.scheduler.resume_auth_paused()?;
        }
        Ok(status)
    }

    pub fn token_status(&self) -> CredentialStatus {
        self.credentials.status()
    }

    pub fn clear_token(&self) -> Result<()> {
        self.credentials.clear()
    }

    // ========== Historical jobs ==========

    pub fn create_job(
        &self,
        tickers: Vec<String>,
        date_from: NaiveDate,
        date_until: NaiveDate,
        delay: Option<Duration>,
    ) -> Result<String> {
        self.scheduler.create_job(
            tickers,
            date_from,
            date_until,
            delay.unwrap_or(DEFAULT_PAGE_DELAY),
        )
    }

    pub fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        self.store.list_jobs(status)
    }

    pub fn get_job(&self, job_id: &str) -> Result<JobDetail> {
        Ok(JobDetail {
            job: self.store.load_job(job_id)?,
            tasks: self.store.job_tasks(job_id)?,
            counts: self.store.task_counts(job_id)?,
        })
    }

    pub fn pause_job(&self, job_id: &str) -> Result<()> {
        self.scheduler.pause(job_id)
    }

    pub fn resume_job(&self, job_id: &str) -> Result<()> {
        self.scheduler.resume(job_id)
    }

    pub fn cancel_job(&self, job_id: &str) -> Result<()> {
        self.scheduler.cancel(job_id)
    }

    pub fn recent_logs(&self, limit: usize) -> Result<Vec<LogEntry>> {
        self.store.recent_logs(limit)
    }

    // ========== Streaming ==========

    pub fn start_stream(
        &self,
        tickers: Vec<String>,
        session_id: Option<String>,
        max_retries: Option<u32>,
    ) -> Result<SessionStats> {
        self.streams.start_stream(session_id, tickers, max_retries)
    }

    pub fn list_streams(&self) -> Vec<SessionStats> {
        self.streams.list()
    }

    pub fn get_stream(&self, session_id: &str) -> Result<SessionStats> {
        self.streams
            .get_stats(session_id)
            .ok_or_else(|| crate::error::AppError::NotFound(format!(
                "session {session_id} not found"
            )))
    }

    pub async fn stop_stream(&self, session_id: &str) -> Result<SessionStats> {
        self.streams.stop_stream(session_id).await
    }

    // ========== Files ==========

    pub fn list_csv(&self, dataset: Dataset) -> Result<Vec<CsvFileInfo>> {
        self.sink.list_files(dataset)
    }

    /// Resolve a listed file for reading (download endpoints, replay).
    pub fn open_csv_for_read(&self, dataset: Dataset, file_name: &str) -> Result<PathBuf> {
        self.sink.resolve(dataset, file_name)
    }

    // ========== Lifecycle ==========

    /// Stop streams and the scheduler, then flush CSV writers. Bounded by
    /// the components' own grace periods.
    pub async fn shutdown(&self) {
        self.streams.stop_all().await;
        self.scheduler.shutdown().await;
        self.sink.close_all();
        tracing::info!("shutdown complete");
    }
}
