//! Daily-rotating CSV storage
//!
//! Maps logical appends of (dataset, ticker, rows) onto per-day files named
//! `<base>/<dataset>/<YYYY-MM-DD>_<TICKER>.csv`. Each file gets its header
//! on first write and every logical append is flushed, so rows already
//! written survive an unclean shutdown.
//!
//! All rotation dates are UTC. Running-trade rows carry their trading date;
//! orderbook rows derive the date from their server timestamp via
//! [`date_for_timestamp`].

use crate::error::{AppError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

/// Logical dataset; selects the subdirectory and column set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    RunningTrade,
    Orderbook,
}

impl Dataset {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dataset::RunningTrade => "running_trade",
            Dataset::Orderbook => "orderbook",
        }
    }

    /// Column order is fixed; rows must match it positionally.
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Dataset::RunningTrade => &[
                "id",
                "date",
                "time",
                "action",
                "code",
                "price",
                "change",
                "lot",
                "buyer",
                "seller",
                "trade_number",
                "buyer_type",
                "seller_type",
                "market_board",
            ],
            Dataset::Orderbook => &["timestamp", "price", "lots", "total_value", "side"],
        }
    }
}

impl std::str::FromStr for Dataset {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running_trade" => Ok(Dataset::RunningTrade),
            "orderbook" => Ok(Dataset::Orderbook),
            other => Err(AppError::Validation(format!("unknown dataset {other:?}"))),
        }
    }
}

/// Listing entry for completed or in-progress CSV files.
#[derive(Debug, Clone, Serialize)]
pub struct CsvFileInfo {
    pub file_name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

struct DailyWriter {
    date: NaiveDate,
    writer: csv::Writer<File>,
}

/// Append-only CSV sink shared by the scheduler and streaming sessions.
///
/// Appends to the same (dataset, ticker, date) are serialized by a per-key
/// mutex; handle creation is serialized by the map itself. Appends to
/// different keys proceed independently.
pub struct CsvSink {
    base_dir: PathBuf,
    writers: DashMap<(Dataset, String), Arc<Mutex<Option<DailyWriter>>>>,
}

impl CsvSink {
    /// Create the sink and its dataset directories. Failure here is fatal:
    /// nothing can be ingested without a writable data directory.
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        for dataset in [Dataset::RunningTrade, Dataset::Orderbook] {
            std::fs::create_dir_all(base_dir.join(dataset.as_str())).map_err(|e| {
                AppError::Fatal(format!(
                    "cannot create data directory {:?}: {e}",
                    base_dir.join(dataset.as_str())
                ))
            })?;
        }
        Ok(Self {
            base_dir,
            writers: DashMap::new(),
        })
    }

    /// Deterministic file path for a (dataset, ticker, date) tuple.
    pub fn file_path(&self, dataset: Dataset, ticker: &str, date: NaiveDate) -> PathBuf {
        self.base_dir
            .join(dataset.as_str())
            .join(format!("{}_{}.csv", date.format("%Y-%m-%d"), ticker))
    }

    /// Append rows for one (dataset, ticker, date), rotating the underlying
    /// file when `date` differs from the currently open one. Returns the
    /// number of rows written; the file is flushed before returning.
    pub fn append(
        &self,
        dataset: Dataset,
        ticker: &str,
        date: NaiveDate,
        rows: &[Vec<String>],
    ) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let slot = self
            .writers
            .entry((dataset, ticker.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone();
        let mut guard = slot.lock();

        // Lazy daily rotation: flush and drop yesterday's writer before
        // opening today's file.
        let rotate = match guard.as_ref() {
            Some(open) => open.date != date,
            None => true,
        };
        if rotate {
            if let Some(mut old) = guard.take() {
                old.writer.flush()?;
            }
            *guard = Some(self.open_writer(dataset, ticker, date)?);
        }

        let open = guard.as_mut().expect("writer opened above");
        let expected = dataset.columns().len();
        for row in rows {
            if row.len() != expected {
                return Err(AppError::Malformed(format!(
                    "{} row has {} fields, expected {expected}",
                    dataset.as_str(),
                    row.len()
                )));
            }
            open.writer.write_record(row)?;
        }
        open.writer.flush()?;

        Ok(rows.len())
    }

    fn open_writer(&self, dataset: Dataset, ticker: &str, date: NaiveDate) -> Result<DailyWriter> {
        let path = self.file_path(dataset, ticker, date);
        let needs_header = !path.exists() || std::fs::metadata(&path)?.len() == 0;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AppError::Fatal(format!("cannot open {path:?}: {e}")))?;
        let mut writer = csv::WriterBuilder::new().from_writer(file);

        if needs_header {
            writer.write_record(dataset.columns())?;
            writer.flush()?;
            tracing::info!("created {}", path.display());
        }

        Ok(DailyWriter { date, writer })
    }

    /// Flush and close every open writer.
    pub fn close_all(&self) {
        for entry in self.writers.iter() {
            if let Some(mut open) = entry.value().lock().take() {
                if let Err(e) = open.writer.flush() {
                    tracing::error!("flush on close failed: {}", e);
                }
            }
        }
    }

    /// List a dataset's files, newest first.
    pub fn list_files(&self, dataset: Dataset) -> Result<Vec<CsvFileInfo>> {
        let dir = self.base_dir.join(dataset.as_str());
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("csv") {
                continue;
            }
            let meta = entry.metadata()?;
            files.push(CsvFileInfo {
                file_name: entry.file_name().to_string_lossy().into_owned(),
                path,
                size_bytes: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        files.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(files)
    }

    /// Resolve a previously listed file name for reading. Rejects anything
    /// that is not a plain file name inside the dataset directory.
    pub fn resolve(&self, dataset: Dataset, file_name: &str) -> Result<PathBuf> {
        if file_name.contains(['/', '\\']) || file_name.contains("..") {
            return Err(AppError::Validation(format!(
                "invalid file name {file_name:?}"
            )));
        }
        let path = self.base_dir.join(dataset.as_str()).join(file_name);
        if !path.is_file() {
            return Err(AppError::NotFound(format!("no such file {file_name:?}")));
        }
        Ok(path)
    }
}

/// UTC date for an orderbook row's server timestamp. Accepts unix seconds,
/// unix milliseconds, and RFC 3339; any other representation falls back to
/// the current UTC date.
pub fn date_for_timestamp(timestamp: &str) -> NaiveDate {
    if let Ok(value) = timestamp.parse::<i64>() {
        // Heuristic split between seconds and milliseconds epochs.
        let seconds = if value.abs() >= 100_000_000_000 {
            value / 1000
        } else {
            value
        };
        if let Some(dt) = DateTime::<Utc>::from_timestamp(seconds, 0) {
            return dt.date_naive();
        }
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(timestamp) {
        return dt.with_timezone(&Utc).date_naive();
    }
    if let Ok(dt) = timestamp.parse::<chrono::NaiveDateTime>() {
        return dt.date();
    }
    Utc::now().date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.is_empty())
            .count()
    }

    fn book_row(ts: &str, price: &str) -> Vec<String> {
        vec![
            ts.to_string(),
            price.to_string(),
            "5".to_string(),
            "500".to_string(),
            "BID".to_string(),
        ]
    }

    #[test]
    fn header_written_once_per_file() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 11, 3).unwrap();

        sink.append(Dataset::Orderbook, "BBCA", date, &[book_row("t1", "100")])
            .unwrap();
        sink.append(Dataset::Orderbook, "BBCA", date, &[book_row("t2", "101")])
            .unwrap();

        let path = sink.file_path(Dataset::Orderbook, "BBCA", date);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("timestamp,price").count(), 1);
        assert_eq!(line_count(&path), 3);
    }

    #[test]
    fn date_rollover_rotates_lazily() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        let day1 = NaiveDate::from_ymd_opt(2025, 11, 3).unwrap();
        let day2 = day1.succ_opt().unwrap();

        sink.append(Dataset::Orderbook, "BBCA", day1, &[book_row("23:59", "100")])
            .unwrap();
        sink.append(Dataset::Orderbook, "BBCA", day2, &[book_row("00:00", "101")])
            .unwrap();

        let first = sink.file_path(Dataset::Orderbook, "BBCA", day1);
        let second = sink.file_path(Dataset::Orderbook, "BBCA", day2);
        assert!(std::fs::read_to_string(&first).unwrap().contains("23:59"));
        assert!(std::fs::read_to_string(&second).unwrap().contains("00:00"));
        assert_eq!(line_count(&first), 2);
        assert_eq!(line_count(&second), 2);
    }

    #[test]
    fn concurrent_appends_to_one_key_never_interleave() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(CsvSink::new(dir.path()).unwrap());
        let date = NaiveDate::from_ymd_opt(2025, 11, 3).unwrap();

        let mut handles = Vec::new();
        for worker in 0..8 {
            let sink = sink.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    sink.append(
                        Dataset::Orderbook,
                        "BBCA",
                        date,
                        &[book_row(&format!("w{worker}-{i}"), "100")],
                    )
                    .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let path = sink.file_path(Dataset::Orderbook, "BBCA", date);
        // Header + 8 * 25 complete rows, no partial lines.
        assert_eq!(line_count(&path), 201);
        for line in std::fs::read_to_string(&path).unwrap().lines().skip(1) {
            assert_eq!(line.split(',').count(), 5, "torn row: {line}");
        }
    }

    #[test]
    fn wrong_arity_rows_are_rejected() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 11, 3).unwrap();

        let err = sink
            .append(Dataset::Orderbook, "BBCA", date, &[vec!["only-one".to_string()]])
            .unwrap_err();
        assert!(matches!(err, AppError::Malformed(_)));
    }

    #[test]
    fn listing_is_scoped_to_dataset() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 11, 3).unwrap();

        sink.append(Dataset::Orderbook, "BBCA", date, &[book_row("t", "1")])
            .unwrap();

        assert_eq!(sink.list_files(Dataset::Orderbook).unwrap().len(), 1);
        assert!(sink.list_files(Dataset::RunningTrade).unwrap().is_empty());
    }

    #[test]
    fn resolve_rejects_traversal() {
        let dir = tempdir().unwrap();
        let sink = CsvSink::new(dir.path()).unwrap();

        assert!(sink.resolve(Dataset::Orderbook, "../token.json").is_err());
        assert!(sink.resolve(Dataset::Orderbook, "missing.csv").is_err());
    }

    #[test]
    fn timestamp_date_handles_epoch_and_rfc3339() {
        assert_eq!(
            date_for_timestamp("1762128000"),
            NaiveDate::from_ymd_opt(2025, 11, 3).unwrap()
        );
        assert_eq!(
            date_for_timestamp("1762128000000"),
            NaiveDate::from_ymd_opt(2025, 11, 3).unwrap()
        );
        assert_eq!(
            date_for_timestamp("2025-11-03T15:30:00+07:00"),
            NaiveDate::from_ymd_opt(2025, 11, 3).unwrap()
        );
        // Opaque strings fall back to "today", which is at least a real date.
        let today = Utc::now().date_naive();
        assert_eq!(date_for_timestamp("opaque-token"), today);
    }
}
