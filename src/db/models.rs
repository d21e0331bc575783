//! Job store models

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// Lifecycle of a historical ingestion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Paused,
    /// Paused because the broker rejected the credential; resumes
    /// automatically when a fresh token is set.
    AuthPaused,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::AuthPaused => "auth_paused",
            JobStatus::Completed => "completed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => JobStatus::Queued,
            "running" => JobStatus::Running,
            "paused" => JobStatus::Paused,
            "auth_paused" => JobStatus::AuthPaused,
            "completed" => JobStatus::Completed,
            "cancelled" => JobStatus::Cancelled,
            "failed" => JobStatus::Failed,
            _ => return None,
        })
    }

    /// Terminal jobs never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::Failed
        )
    }
}

/// Lifecycle of one (ticker, date) unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    InProgress,
    Done,
    Skipped,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Skipped => "skipped",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => TaskStatus::Queued,
            "in_progress" => TaskStatus::InProgress,
            "done" => TaskStatus::Done,
            "skipped" => TaskStatus::Skipped,
            "failed" => TaskStatus::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Skipped | TaskStatus::Failed
        )
    }
}

/// A historical ingestion job over {tickers × trading days}.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: String,
    pub tickers: Vec<String>,
    pub date_from: NaiveDate,
    pub date_until: NaiveDate,
    /// Pause between successive page fetches, in milliseconds.
    pub delay_ms: u64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rows_written: u64,
    pub pages_fetched: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
}

/// One (ticker, date) unit of a job, with its durable pagination cursor.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub job_id: String,
    pub ticker: String,
    pub date: NaiveDate,
    pub status: TaskStatus,
    /// `None` means "start from the latest page".
    pub next_cursor: Option<String>,
    pub rows_written: u64,
}

/// Aggregate task counts, used to roll a job's status up from its tasks.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounts {
    pub total: u64,
    pub queued: u64,
    pub in_progress: u64,
    pub done: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl TaskCounts {
    pub fn all_terminal(&self) -> bool {
        self.queued == 0 && self.in_progress == 0
    }
}

/// One entry of the capped job log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: String,
    pub job_id: Option<String>,
    pub message: String,
}
