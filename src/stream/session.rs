//! Streaming session state machine
//!
//! One session owns one WebSocket. The lifecycle is
//! `disconnected → connecting → connected`, with `retrying` between
//! attempts, and `stopped`/`errored` as terminal states. Only the session
//! task touches the socket; control arrives through a watch signal that is
//! observed at every suspension point, so `stop()` lands promptly even
//! during a backoff sleep.

use crate::auth::TokenManager;
use crate::client::StockbitApi;
use crate::codec::{self, orderbook::parse_book_payload, SubscribeRequest};
use crate::config::WS_ORIGIN;
use crate::error::{AppError, Result};
use crate::storage::{date_for_timestamp, CsvSink, Dataset};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

/// Bound on how long `stop()` waits for the session task to wind down.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Hook invoked on every entry to `connecting`, before the trading key is
/// fetched, so an externally driven credential refresh runs first.
pub type RefreshHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Retrying,
    Stopped,
    Errored,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Errored)
    }
}

/// Per-session tuning, taken from the application config.
#[derive(Clone)]
pub struct SessionConfig {
    pub websocket_url: String,
    pub ping_interval: Duration,
    pub pong_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    pub refresh: Option<RefreshHook>,
}

/// Read-only statistics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub tickers: Vec<String>,
    pub state: SessionState,
    pub retry_count: u32,
    pub total_reconnects: u64,
    pub malformed_frames: u64,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_disconnect_at: Option<DateTime<Utc>>,
    pub message_counts: HashMap<String, u64>,
}

struct SessionShared {
    state: RwLock<SessionState>,
    retry_count: AtomicU32,
    total_reconnects: AtomicU64,
    malformed_frames: AtomicU64,
    last_error: RwLock<Option<String>>,
    started_at: DateTime<Utc>,
    last_disconnect_at: RwLock<Option<DateTime<Utc>>>,
    message_counts: DashMap<String, u64>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::Disconnected),
            retry_count: AtomicU32::new(0),
            total_reconnects: AtomicU64::new(0),
            malformed_frames: AtomicU64::new(0),
            last_error: RwLock::new(None),
            started_at: Utc::now(),
            last_disconnect_at: RwLock::new(None),
            message_counts: DashMap::new(),
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    fn record_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }
}

/// Handle to a running (or finished) streaming session.
pub struct StreamSession {
    id: String,
    tickers: Vec<String>,
    shared: Arc<SessionShared>,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    /// Spawn the session task. The connection attempt starts immediately.
    pub fn spawn(
        id: String,
        tickers: Vec<String>,
        client: Arc<dyn StockbitApi>,
        sink: Arc<CsvSink>,
        credentials: Arc<TokenManager>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let shared = Arc::new(SessionShared::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let runtime = SessionRuntime {
            id: id.clone(),
            tickers: tickers.clone(),
            shared: shared.clone(),
            client,
            sink,
            credentials,
            config,
            stop_rx,
        };
        let handle = tokio::spawn(runtime.run());

        Arc::new(Self {
            id,
            tickers,
            shared,
            stop_tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_terminal(&self) -> bool {
        self.shared.state.read().is_terminal()
    }

    /// Stop the session. Idempotent; cancels an outstanding connection or
    /// backoff sleep and waits briefly for the task to finish.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(STOP_GRACE, handle).await.is_err() {
                // A handshake stuck on an unresponsive peer is the only
                // path that ignores the stop signal this long.
                abort.abort();
                tracing::warn!(session_id = %self.id, "session task aborted after stop grace");
            }
        }
        let mut state = self.shared.state.write();
        if !state.is_terminal() {
            *state = SessionState::Stopped;
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id.clone(),
            tickers: self.tickers.clone(),
            state: *self.shared.state.read(),
            retry_count: self.shared.retry_count.load(Ordering::Relaxed),
            total_reconnects: self.shared.total_reconnects.load(Ordering::Relaxed),
            malformed_frames: self.shared.malformed_frames.load(Ordering::Relaxed),
            last_error: self.shared.last_error.read().clone(),
            started_at: self.shared.started_at,
            last_disconnect_at: *self.shared.last_disconnect_at.read(),
            message_counts: self
                .shared
                .message_counts
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
        }
    }
}

enum LoopEnd {
    Stopped,
}

struct SessionRuntime {
    id: String,
    tickers: Vec<String>,
    shared: Arc<SessionShared>,
    client: Arc<dyn StockbitApi>,
    sink: Arc<CsvSink>,
    credentials: Arc<TokenManager>,
    config: SessionConfig,
    stop_rx: watch::Receiver<bool>,
}

impl SessionRuntime {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        let mut ever_connected = false;

        loop {
            if *self.stop_rx.borrow() {
                self.shared.set_state(SessionState::Stopped);
                return;
            }

            self.shared.set_state(SessionState::Connecting);
            match self
                .connect_and_stream(&mut attempt, &mut ever_connected)
                .await
            {
                Ok(LoopEnd::Stopped) => {
                    self.shared.set_state(SessionState::Stopped);
                    tracing::info!(session_id = %self.id, "session stopped");
                    return;
                }
                Err(e) => {
                    if *self.shared.state.read() == SessionState::Connected {
                        *self.shared.last_disconnect_at.write() = Some(Utc::now());
                    }
                    self.shared.record_error(e.to_string());
                    if matches!(e, AppError::Fatal(_)) {
                        // Disk trouble will not heal with a reconnect.
                        self.shared.set_state(SessionState::Errored);
                        tracing::error!(session_id = %self.id, "session error: {}", e);
                        return;
                    }
                    tracing::warn!(session_id = %self.id, "session error: {}", e);
                }
            }

            attempt += 1;
            self.shared.retry_count.store(attempt, Ordering::Relaxed);
            if let Some(max) = self.config.max_retries {
                if attempt > max {
                    self.shared.set_state(SessionState::Errored);
                    tracing::error!(
                        session_id = %self.id,
                        "session gave up after {} retries",
                        max
                    );
                    return;
                }
            }

            self.shared.set_state(SessionState::Retrying);
            let delay = reconnect_delay(self.config.backoff_base, self.config.backoff_max, attempt);
            tracing::info!(
                session_id = %self.id,
                attempt,
                "reconnecting in {:?}",
                delay
            );
            let mut stop_rx = self.stop_rx.clone();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => {
                    self.shared.set_state(SessionState::Stopped);
                    return;
                }
            }
        }
    }

    /// One connection round: credentials, trading key, handshake,
    /// subscription, then the read loop until an error or stop.
    async fn connect_and_stream(
        &mut self,
        attempt: &mut u32,
        ever_connected: &mut bool,
    ) -> Result<LoopEnd> {
        if let Some(refresh) = &self.config.refresh {
            refresh();
        }

        let trading_key = self.client.fetch_trading_key().await?;

        let token = self
            .credentials
            .token()
            .ok_or_else(|| AppError::AuthExpired("no bearer token set".to_string()))?;
        let user_id = self.credentials.user_id().ok_or_else(|| {
            AppError::AuthExpired("token claims carry no user id".to_string())
        })? as u64;

        let mut request = self
            .config
            .websocket_url
            .as_str()
            .into_client_request()
            .map_err(|e| AppError::Config(format!("bad websocket url: {e}")))?;
        let headers = request.headers_mut();
        headers.insert("Origin", HeaderValue::from_static(WS_ORIGIN));
        headers.insert(
            "Authorization",
            HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| AppError::AuthExpired("token is not a valid header value".to_string()))?,
        );
        if let Some(cookies) = self.credentials.cookies() {
            if let Ok(value) = HeaderValue::from_str(&cookies) {
                headers.insert("Cookie", value);
            }
        }

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| AppError::Retryable(format!("websocket connect failed: {e}")))?;
        let (mut write, mut read) = ws.split();

        let subscribe = codec::encode_subscribe(&SubscribeRequest {
            user_id,
            tickers: self.tickers.clone(),
            trading_key,
            access_token: token,
        });
        write
            .send(Message::Binary(subscribe))
            .await
            .map_err(|e| AppError::Retryable(format!("subscription send failed: {e}")))?;

        self.shared.set_state(SessionState::Connected);
        self.shared.retry_count.store(0, Ordering::Relaxed);
        *attempt = 0;
        if *ever_connected {
            self.shared.total_reconnects.fetch_add(1, Ordering::Relaxed);
        } else {
            *ever_connected = true;
        }
        tracing::info!(
            session_id = %self.id,
            tickers = ?self.tickers,
            "subscribed"
        );

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_activity = Instant::now();
        let mut stop_rx = self.stop_rx.clone();

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(LoopEnd::Stopped);
                }
                _ = ping.tick() => {
                    if last_activity.elapsed() > self.config.ping_interval + self.config.pong_timeout {
                        return Err(AppError::Retryable(
                            "no data or pong within keepalive window".to_string(),
                        ));
                    }
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .map_err(|e| AppError::Retryable(format!("ping failed: {e}")))?;
                }
                msg = read.next() => match msg {
                    None => return Err(AppError::Retryable("stream ended".to_string())),
                    Some(Err(e)) => {
                        return Err(AppError::Retryable(format!("read error: {e}")))
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_activity = Instant::now();
                        process_frame(&self.shared, &self.sink, &data)?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Err(AppError::Retryable(format!(
                            "server closed connection: {frame:?}"
                        )))
                    }
                    Some(Ok(_)) => {
                        // Text, pings and pongs just prove liveness.
                        last_activity = Instant::now();
                    }
                }
            }
        }
    }
}

/// Decode one binary frame and fan its levels out to the CSV sink.
/// Malformed frames are counted and dropped with the connection intact;
/// only fatal sink failures propagate.
fn process_frame(shared: &SessionShared, sink: &CsvSink, data: &[u8]) -> Result<()> {
    let frame = match codec::decode_orderbook_frame(data) {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(()),
        Err(e) => {
            shared.malformed_frames.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("dropping undecodable frame: {}", e);
            return Ok(());
        }
    };

    let update = match parse_book_payload(&frame.payload) {
        Ok(update) => update,
        Err(e) => {
            shared.malformed_frames.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(ticker = %frame.ticker, "dropping bad payload: {}", e);
            return Ok(());
        }
    };

    let timestamp = frame
        .server_timestamp()
        .map(str::to_string)
        .unwrap_or_else(|| Utc::now().to_rfc3339());
    let date = date_for_timestamp(&timestamp);

    let rows: Vec<Vec<String>> = update
        .levels
        .iter()
        .map(|level| {
            vec![
                timestamp.clone(),
                level.price.clone(),
                level.lots.clone(),
                level.total_value.clone(),
                update.side.to_string(),
            ]
        })
        .collect();

    match sink.append(Dataset::Orderbook, &frame.ticker, date, &rows) {
        Ok(_) => {
            *shared
                .message_counts
                .entry(frame.ticker.clone())
                .or_insert(0) += 1;
            Ok(())
        }
        Err(e @ AppError::Fatal(_)) => Err(e),
        Err(e) => {
            tracing::error!(ticker = %frame.ticker, "orderbook append failed: {}", e);
            Ok(())
        }
    }
}

/// Delay before the n-th reconnect attempt (n starting at 1):
/// base · 2^(n-1), capped at `max`.
pub(crate) fn reconnect_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}
