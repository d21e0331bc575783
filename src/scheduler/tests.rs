use super::*;
use crate::auth::make_test_token;
use crate::client::types::{TradePage, TradeRow};
use crate::db::models::TaskStatus;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Scripted stand-in for the live API. `Scripted` pops canned responses in
/// call order; `Endless` always returns a full page with a fresh cursor.
/// An optional gate lets tests control exactly when each fetch returns.
struct StubApi {
    script: Mutex<VecDeque<Result<TradePage>>>,
    endless: bool,
    calls: Mutex<Vec<Option<String>>>,
    gate: Option<Arc<Semaphore>>,
}

impl StubApi {
    fn scripted(script: Vec<Result<TradePage>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            endless: false,
            calls: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    fn endless(gate: Arc<Semaphore>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            endless: true,
            calls: Mutex::new(Vec::new()),
            gate: Some(gate),
        })
    }

    fn cursors_seen(&self) -> Vec<Option<String>> {
        self.calls.lock().clone()
    }
}

#[async_trait::async_trait]
impl StockbitApi for StubApi {
    async fn fetch_trades(
        &self,
        _ticker: &str,
        _date: NaiveDate,
        cursor: Option<&str>,
    ) -> Result<TradePage> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        let call_index = {
            let mut calls = self.calls.lock();
            calls.push(cursor.map(str::to_string));
            calls.len()
        };

        if self.endless {
            return Ok(TradePage {
                rows: vec![trade_row(&format!("r{call_index}a")), trade_row(&format!("r{call_index}b"))],
                next_cursor: Some(format!("C{call_index}")),
            });
        }

        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(TradePage::default()))
    }

    async fn fetch_trading_key(&self) -> Result<String> {
        Ok("stub-key".to_string())
    }
}

fn trade_row(id: &str) -> TradeRow {
    TradeRow {
        id: id.to_string(),
        time: "14:00:00".to_string(),
        action: "buy".to_string(),
        code: "BBRI".to_string(),
        price: "4,910".to_string(),
        change: "+0.5%".to_string(),
        lot: "10".to_string(),
        buyer: "YP".to_string(),
        seller: "PD".to_string(),
        trade_number: Some(1),
        buyer_type: "D".to_string(),
        seller_type: "F".to_string(),
        market_board: "RG".to_string(),
    }
}

fn page(ids: &[&str], cursor: Option<&str>) -> Result<TradePage> {
    Ok(TradePage {
        rows: ids.iter().map(|id| trade_row(id)).collect(),
        next_cursor: cursor.map(str::to_string),
    })
}

struct Fixture {
    _dir: tempfile::TempDir,
    store: Arc<JobStore>,
    sink: Arc<CsvSink>,
    credentials: Arc<TokenManager>,
    scheduler: JobScheduler,
}

fn fixture(client: Arc<dyn StockbitApi>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JobStore::new(&dir.path().join("jobs.db")).unwrap());
    let sink = Arc::new(CsvSink::new(dir.path().join("data")).unwrap());
    let credentials = Arc::new(TokenManager::new(dir.path().join("token.json")));
    credentials
        .set(&make_test_token(Utc::now().timestamp() + 3600, 1), None)
        .unwrap();

    let scheduler = JobScheduler::start(
        store.clone(),
        client,
        sink.clone(),
        credentials.clone(),
        Duration::from_millis(1),
        Duration::from_millis(10),
        3,
    );

    Fixture {
        _dir: dir,
        store,
        sink,
        credentials,
        scheduler,
    }
}

async fn wait_for_status(store: &JobStore, job_id: &str, status: JobStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if store.load_job(job_id).unwrap().status == status {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "job never reached {:?}; currently {:?}",
                status,
                store.load_job(job_id).unwrap().status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn date(s: &str) -> NaiveDate {
    s.parse().unwrap()
}

#[tokio::test]
async fn happy_path_paginates_and_completes() {
    let api = StubApi::scripted(vec![
        page(&["row1", "row2"], Some("X")),
        page(&["row3"], None),
    ]);
    let fx = fixture(api.clone());

    let job_id = fx
        .scheduler
        .create_job(
            vec!["BBRI".to_string()],
            date("2025-11-03"),
            date("2025-11-03"),
            Duration::ZERO,
        )
        .unwrap();

    wait_for_status(&fx.store, &job_id, JobStatus::Completed).await;

    let job = fx.store.load_job(&job_id).unwrap();
    assert_eq!(job.pages_fetched, 2);
    assert_eq!(job.rows_written, 3);

    // Second page was requested at the persisted cursor.
    assert_eq!(
        api.cursors_seen(),
        vec![None, Some("X".to_string())]
    );

    let path = fx
        .sink
        .file_path(Dataset::RunningTrade, "BBRI", date("2025-11-03"));
    let content = std::fs::read_to_string(path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("id,date,time"));
    assert!(lines[1].starts_with("row1,2025-11-03"));
    assert!(lines[2].starts_with("row2,"));
    assert!(lines[3].starts_with("row3,"));

    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn auth_expiry_parks_job_and_resume_reuses_cursor() {
    let api = StubApi::scripted(vec![
        page(&["row1"], Some("X")),
        Err(AppError::AuthExpired("HTTP 401".to_string())),
        page(&["row2"], None),
    ]);
    let fx = fixture(api.clone());

    let job_id = fx
        .scheduler
        .create_job(
            vec!["BBRI".to_string()],
            date("2025-11-03"),
            date("2025-11-03"),
            Duration::ZERO,
        )
        .unwrap();

    wait_for_status(&fx.store, &job_id, JobStatus::AuthPaused).await;

    let task = &fx.store.job_tasks(&job_id).unwrap()[0];
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.next_cursor.as_deref(), Some("X"));
    assert_eq!(fx.store.load_job(&job_id).unwrap().rows_written, 1);

    // Fresh credential: the job returns to the pool and the task resumes
    // from the persisted cursor.
    fx.credentials
        .set(&make_test_token(Utc::now().timestamp() + 3600, 1), None)
        .unwrap();
    assert_eq!(fx.scheduler.resume_auth_paused().unwrap(), 1);

    wait_for_status(&fx.store, &job_id, JobStatus::Completed).await;

    let cursors = api.cursors_seen();
    assert_eq!(cursors[1].as_deref(), Some("X"));
    assert_eq!(cursors[2].as_deref(), Some("X"));
    assert_eq!(fx.store.load_job(&job_id).unwrap().rows_written, 2);

    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn empty_first_page_completes_with_zero_rows() {
    let api = StubApi::scripted(vec![page(&[], None)]);
    let fx = fixture(api);

    let job_id = fx
        .scheduler
        .create_job(
            vec!["BBRI".to_string()],
            date("2025-11-03"),
            date("2025-11-03"),
            Duration::ZERO,
        )
        .unwrap();

    wait_for_status(&fx.store, &job_id, JobStatus::Completed).await;

    let job = fx.store.load_job(&job_id).unwrap();
    assert_eq!(job.rows_written, 0);
    assert_eq!(job.error_count, 0);
    assert_eq!(fx.store.job_tasks(&job_id).unwrap()[0].status, TaskStatus::Done);

    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn retry_exhaustion_fails_the_task_and_moves_on() {
    let api = StubApi::scripted(vec![
        Err(AppError::Retryable("HTTP 503".to_string())),
        Err(AppError::Retryable("HTTP 503".to_string())),
        Err(AppError::Retryable("HTTP 503".to_string())),
        page(&["row1"], None),
    ]);
    let fx = fixture(api);

    let job_id = fx
        .scheduler
        .create_job(
            vec!["BBRI".to_string()],
            date("2025-11-03"),
            date("2025-11-04"),
            Duration::ZERO,
        )
        .unwrap();

    wait_for_status(&fx.store, &job_id, JobStatus::Failed).await;

    let job = fx.store.load_job(&job_id).unwrap();
    assert_eq!(job.error_count, 1);
    assert!(job.last_error.as_deref().unwrap_or_default().contains("503"));

    let tasks = fx.store.job_tasks(&job_id).unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    // The second date still ran and succeeded.
    assert_eq!(tasks[1].status, TaskStatus::Done);

    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn pause_finishes_inflight_page_and_resume_continues_at_cursor() {
    let gate = Arc::new(Semaphore::new(0));
    let api = StubApi::endless(gate.clone());
    let fx = fixture(api.clone());

    let job_id = fx
        .scheduler
        .create_job(
            vec!["BBRI".to_string()],
            date("2025-11-03"),
            date("2025-11-12"),
            Duration::ZERO,
        )
        .unwrap();
    assert_eq!(fx.store.task_counts(&job_id).unwrap().total, 10);

    // Let two pages of the first task through; the worker then blocks on
    // the third fetch.
    gate.add_permits(2);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while api.cursors_seen().len() < 2 {
        assert!(tokio::time::Instant::now() < deadline, "worker never fetched");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // Settle on the blocked third fetch, pause, then release it: the
    // in-flight page must still land before the task parks.
    tokio::time::sleep(Duration::from_millis(200)).await;
    fx.scheduler.pause(&job_id).unwrap();
    gate.add_permits(1);

    wait_for_status(&fx.store, &job_id, JobStatus::Paused).await;
    // Give the worker a moment to park the task after the in-flight page.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let task = fx.store.job_tasks(&job_id).unwrap().remove(0);
        if task.status == TaskStatus::Queued {
            // The in-flight page completed and its cursor was persisted.
            assert_eq!(task.next_cursor.as_deref(), Some("C3"));
            assert_eq!(task.rows_written, 6);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task never requeued");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // No other task started.
    for task in fx.store.job_tasks(&job_id).unwrap().iter().skip(1) {
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.next_cursor.is_none());
    }

    // Pause is idempotent.
    fx.scheduler.pause(&job_id).unwrap();

    // Resume re-enters the same task at the saved cursor.
    fx.scheduler.resume(&job_id).unwrap();
    gate.add_permits(1);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while api.cursors_seen().len() < 4 {
        assert!(tokio::time::Instant::now() < deadline, "worker never resumed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(api.cursors_seen()[3].as_deref(), Some("C3"));

    // Unblock any pending fetch so the worker can observe shutdown.
    gate.add_permits(100);
    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn cancel_skips_open_tasks_and_discards_inflight_page() {
    let gate = Arc::new(Semaphore::new(0));
    let api = StubApi::endless(gate.clone());
    let fx = fixture(api);

    let job_id = fx
        .scheduler
        .create_job(
            vec!["BBRI".to_string(), "BBCA".to_string()],
            date("2025-11-03"),
            date("2025-11-04"),
            Duration::ZERO,
        )
        .unwrap();

    // Wait for the worker to claim the first task; its fetch is blocked on
    // the gate.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fx.store.task_counts(&job_id).unwrap().in_progress == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no task claimed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fx.scheduler.cancel(&job_id).unwrap();
    assert_eq!(
        fx.store.load_job(&job_id).unwrap().status,
        JobStatus::Cancelled
    );
    assert_eq!(fx.store.task_counts(&job_id).unwrap().skipped, 4);

    // Releasing the in-flight fetch must not resurrect the skipped task or
    // write its page.
    gate.add_permits(1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let counts = fx.store.task_counts(&job_id).unwrap();
    assert_eq!(counts.skipped, 4);
    assert_eq!(fx.store.load_job(&job_id).unwrap().rows_written, 0);

    fx.scheduler.shutdown().await;
}

#[tokio::test]
async fn create_job_validates_input() {
    let fx = fixture(StubApi::scripted(vec![]));

    assert!(fx
        .scheduler
        .create_job(vec![], date("2025-11-03"), date("2025-11-03"), Duration::ZERO)
        .is_err());
    assert!(fx
        .scheduler
        .create_job(
            vec!["BBRI".to_string()],
            date("2025-11-04"),
            date("2025-11-03"),
            Duration::ZERO,
        )
        .is_err());

    fx.scheduler.shutdown().await;
}

#[test]
fn rest_backoff_doubles_and_caps() {
    let base = Duration::from_secs(1);
    let max = Duration::from_secs(60);
    assert_eq!(rest_backoff(base, max, 1), Duration::from_secs(1));
    assert_eq!(rest_backoff(base, max, 2), Duration::from_secs(2));
    assert_eq!(rest_backoff(base, max, 3), Duration::from_secs(4));
    assert_eq!(rest_backoff(base, max, 7), Duration::from_secs(60));
    assert_eq!(rest_backoff(base, max, 40), Duration::from_secs(60));
}
