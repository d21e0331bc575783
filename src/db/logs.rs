//! Capped job log

use super::models::LogEntry;
use crate::error::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

/// Maximum retained log rows; the oldest are trimmed on append.
const LOG_CAP: i64 = 1000;

pub fn append(conn: &Connection, level: &str, job_id: Option<&str>, message: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO logs (ts, level, job_id, message) VALUES (?1, ?2, ?3, ?4)",
        params![Utc::now().to_rfc3339(), level, job_id, message],
    )?;
    conn.execute(
        "DELETE FROM logs WHERE id <= (SELECT MAX(id) FROM logs) - ?1",
        [LOG_CAP],
    )?;
    Ok(())
}

/// Most recent entries, newest first.
pub fn recent(conn: &Connection, limit: usize) -> Result<Vec<LogEntry>> {
    let mut stmt =
        conn.prepare("SELECT ts, level, job_id, message FROM logs ORDER BY id DESC LIMIT ?")?;
    let rows = stmt.query_map([limit as i64], |row| {
        Ok(LogEntry {
            ts: DateTime::parse_from_rfc3339(&row.get::<_, String>(0)?)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_default(),
            level: row.get(1)?,
            job_id: row.get(2)?,
            message: row.get(3)?,
        })
    })?;

    let mut entries = Vec::new();
    for entry in rows {
        entries.push(entry?);
    }
    Ok(entries)
}
