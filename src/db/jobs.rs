//! Job table operations

use super::models::{Job, JobStatus, TaskCounts, TaskStatus};
use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let tickers_json: String = row.get("tickers")?;
    let status_str: String = row.get("status")?;
    Ok(Job {
        id: row.get("id")?,
        tickers: serde_json::from_str(&tickers_json).unwrap_or_default(),
        date_from: parse_date(&row.get::<_, String>("date_from")?),
        date_until: parse_date(&row.get::<_, String>("date_until")?),
        delay_ms: row.get::<_, i64>("delay_ms")? as u64,
        status: JobStatus::from_str(&status_str).unwrap_or(JobStatus::Failed),
        created_at: parse_instant(&row.get::<_, String>("created_at")?),
        started_at: row
            .get::<_, Option<String>>("started_at")?
            .map(|s| parse_instant(&s)),
        completed_at: row
            .get::<_, Option<String>>("completed_at")?
            .map(|s| parse_instant(&s)),
        rows_written: row.get::<_, i64>("rows_written")? as u64,
        pages_fetched: row.get::<_, i64>("pages_fetched")? as u64,
        error_count: row.get::<_, i64>("error_count")? as u64,
        last_error: row.get("last_error")?,
    })
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_default()
}

fn parse_instant(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Insert a job together with its expanded ticker×date tasks in one
/// transaction, so a half-created job can never be observed.
pub fn create_job(conn: &mut Connection, job: &Job) -> Result<()> {
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO jobs (id, tickers, date_from, date_until, delay_ms, status, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            job.id,
            serde_json::to_string(&job.tickers)?,
            job.date_from.format("%Y-%m-%d").to_string(),
            job.date_until.format("%Y-%m-%d").to_string(),
            job.delay_ms as i64,
            job.status.as_str(),
            job.created_at.to_rfc3339(),
        ],
    )?;

    let mut date = job.date_from;
    while date <= job.date_until {
        for ticker in &job.tickers {
            tx.execute(
                "INSERT INTO tasks (job_id, ticker, date, status) VALUES (?1, ?2, ?3, ?4)",
                params![
                    job.id,
                    ticker,
                    date.format("%Y-%m-%d").to_string(),
                    TaskStatus::Queued.as_str(),
                ],
            )?;
        }
        date = date
            .succ_opt()
            .ok_or_else(|| AppError::Validation("date range overflow".to_string()))?;
    }

    tx.commit()?;
    Ok(())
}

pub fn load_job(conn: &Connection, id: &str) -> Result<Job> {
    conn.query_row("SELECT * FROM jobs WHERE id = ?", [id], job_from_row)
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                AppError::NotFound(format!("job {id} not found"))
            }
            other => other.into(),
        })
}

/// List jobs, most recent first, optionally filtered by status.
pub fn list_jobs(conn: &Connection, status: Option<JobStatus>) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    match status {
        Some(status) => {
            let mut stmt =
                conn.prepare("SELECT * FROM jobs WHERE status = ? ORDER BY created_at DESC")?;
            let rows = stmt.query_map([status.as_str()], job_from_row)?;
            for job in rows {
                jobs.push(job?);
            }
        }
        None => {
            let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at DESC")?;
            let rows = stmt.query_map([], job_from_row)?;
            for job in rows {
                jobs.push(job?);
            }
        }
    }
    Ok(jobs)
}

pub fn update_job_status(conn: &Connection, id: &str, status: JobStatus) -> Result<()> {
    let changed = match status {
        JobStatus::Running => conn.execute(
            "UPDATE jobs SET status = ?1, started_at = COALESCE(started_at, ?2) WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?,
        s if s.is_terminal() => conn.execute(
            "UPDATE jobs SET status = ?1, completed_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?,
        _ => conn.execute(
            "UPDATE jobs SET status = ?1 WHERE id = ?2",
            params![status.as_str(), id],
        )?,
    };
    if changed == 0 {
        return Err(AppError::NotFound(format!("job {id} not found")));
    }
    Ok(())
}

/// Record a page-level error against the job.
pub fn record_job_error(conn: &Connection, id: &str, message: &str) -> Result<()> {
    conn.execute(
        "UPDATE jobs SET error_count = error_count + 1, last_error = ?1 WHERE id = ?2",
        params![message, id],
    )?;
    Ok(())
}

/// The oldest non-terminal job in `status`, by creation order.
pub fn oldest_with_status(conn: &Connection, status: JobStatus) -> Result<Option<String>> {
    let mut stmt =
        conn.prepare("SELECT id FROM jobs WHERE status = ? ORDER BY created_at ASC LIMIT 1")?;
    let mut rows = stmt.query_map([status.as_str()], |row| row.get::<_, String>(0))?;
    Ok(rows.next().transpose()?)
}

/// All job ids currently in `status`.
pub fn ids_with_status(conn: &Connection, status: JobStatus) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM jobs WHERE status = ? ORDER BY created_at ASC")?;
    let rows = stmt.query_map([status.as_str()], |row| row.get::<_, String>(0))?;
    let mut ids = Vec::new();
    for id in rows {
        ids.push(id?);
    }
    Ok(ids)
}

/// Task status histogram for one job.
pub fn task_counts(conn: &Connection, job_id: &str) -> Result<TaskCounts> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM tasks WHERE job_id = ? GROUP BY status")?;
    let rows = stmt.query_map([job_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })?;

    let mut counts = TaskCounts::default();
    for row in rows {
        let (status, count) = row?;
        counts.total += count;
        match TaskStatus::from_str(&status) {
            Some(TaskStatus::Queued) => counts.queued = count,
            Some(TaskStatus::InProgress) => counts.in_progress = count,
            Some(TaskStatus::Done) => counts.done = count,
            Some(TaskStatus::Skipped) => counts.skipped = count,
            Some(TaskStatus::Failed) => counts.failed = count,
            None => {}
        }
    }
    Ok(counts)
}
