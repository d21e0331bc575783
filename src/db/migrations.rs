//! Job database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    run_migration(conn, "001_jobs", CREATE_JOBS_TABLE)?;
    run_migration(conn, "002_tasks", CREATE_TASKS_TABLE)?;
    run_migration(conn, "003_logs", CREATE_LOGS_TABLE)?;

    tracing::info!("job database migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?)",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("running migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    }

    Ok(())
}

const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE jobs (
    id TEXT PRIMARY KEY,
    tickers TEXT NOT NULL,
    date_from TEXT NOT NULL,
    date_until TEXT NOT NULL,
    delay_ms INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'queued',
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    rows_written INTEGER NOT NULL DEFAULT 0,
    pages_fetched INTEGER NOT NULL DEFAULT 0,
    error_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
"#;

const CREATE_TASKS_TABLE: &str = r#"
CREATE TABLE tasks (
    job_id TEXT NOT NULL,
    ticker TEXT NOT NULL,
    date TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    next_cursor TEXT,
    rows_written INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (job_id, ticker, date),
    FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_tasks_status_job ON tasks(status, job_id);
"#;

const CREATE_LOGS_TABLE: &str = r#"
CREATE TABLE logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts TEXT NOT NULL,
    level TEXT NOT NULL,
    job_id TEXT,
    message TEXT NOT NULL
);
"#;
