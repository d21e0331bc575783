//! Task table operations
//!
//! The task row is the durable unit of scheduler progress: its
//! `next_cursor` is persisted together with the rows-written delta in a
//! single transaction, so a crash or pause can never lose or repeat a page
//! acknowledged here.

use super::models::{Task, TaskStatus};
use crate::error::Result;
use chrono::NaiveDate;
use rusqlite::{params, Connection, Row};

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status_str: String = row.get("status")?;
    let date_str: String = row.get("date")?;
    Ok(Task {
        job_id: row.get("job_id")?,
        ticker: row.get("ticker")?,
        date: NaiveDate::parse_from_str(&date_str, "%Y-%m-%d").unwrap_or_default(),
        status: TaskStatus::from_str(&status_str).unwrap_or(TaskStatus::Failed),
        next_cursor: row.get("next_cursor")?,
        rows_written: row.get::<_, i64>("rows_written")? as u64,
    })
}

/// Oldest queued task belonging to a job in status `running`, optionally
/// restricted to a single job. Insertion (rowid) order keeps the walk
/// deterministic: earlier tickers and dates first.
pub fn pick_next_runnable(conn: &Connection, job_id: Option<&str>) -> Result<Option<Task>> {
    let sql = "SELECT t.* FROM tasks t
               JOIN jobs j ON j.id = t.job_id
               WHERE t.status = 'queued' AND j.status = 'running'
                 AND (?1 IS NULL OR t.job_id = ?1)
               ORDER BY t.rowid ASC LIMIT 1";
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query_map(params![job_id], task_from_row)?;
    Ok(rows.next().transpose()?)
}

/// Persist a task transition. The cursor and rows-written delta ride in the
/// same statement as the status, and the parent job's aggregate counters
/// update inside the same transaction.
pub fn update_task(
    conn: &mut Connection,
    job_id: &str,
    ticker: &str,
    date: NaiveDate,
    status: TaskStatus,
    next_cursor: Option<&str>,
    rows_written_delta: u64,
    pages_fetched_delta: u64,
) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE tasks SET status = ?1, next_cursor = ?2, rows_written = rows_written + ?3
         WHERE job_id = ?4 AND ticker = ?5 AND date = ?6",
        params![
            status.as_str(),
            next_cursor,
            rows_written_delta as i64,
            job_id,
            ticker,
            date.format("%Y-%m-%d").to_string(),
        ],
    )?;
    if rows_written_delta > 0 || pages_fetched_delta > 0 {
        tx.execute(
            "UPDATE jobs SET rows_written = rows_written + ?1,
                             pages_fetched = pages_fetched + ?2
             WHERE id = ?3",
            params![rows_written_delta as i64, pages_fetched_delta as i64, job_id],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// All tasks of a job, in creation order.
pub fn job_tasks(conn: &Connection, job_id: &str) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare("SELECT * FROM tasks WHERE job_id = ? ORDER BY rowid ASC")?;
    let rows = stmt.query_map([job_id], task_from_row)?;
    let mut tasks = Vec::new();
    for task in rows {
        tasks.push(task?);
    }
    Ok(tasks)
}

/// Return every in-flight task of a job to the queue, keeping cursors.
/// Used by pause and by crash recovery.
pub fn requeue_in_progress(conn: &Connection, job_id: Option<&str>) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'queued'
         WHERE status = 'in_progress' AND (?1 IS NULL OR job_id = ?1)",
        params![job_id],
    )?;
    Ok(changed)
}

/// Mark every non-terminal task of a job skipped (job cancellation).
pub fn skip_open_tasks(conn: &Connection, job_id: &str) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'skipped'
         WHERE job_id = ? AND status IN ('queued', 'in_progress')",
        [job_id],
    )?;
    Ok(changed)
}
