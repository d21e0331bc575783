//! Streaming session manager
//!
//! Named, independent sessions over one shared client and sink. A failure
//! in one session never touches another; stats of stopped sessions stay
//! readable until the process exits.

use super::session::{SessionConfig, SessionStats, StreamSession};
use crate::auth::TokenManager;
use crate::client::StockbitApi;
use crate::error::{AppError, Result};
use crate::storage::CsvSink;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct StreamManager {
    client: Arc<dyn StockbitApi>,
    sink: Arc<CsvSink>,
    credentials: Arc<TokenManager>,
    config: SessionConfig,
    sessions: DashMap<String, Arc<StreamSession>>,
}

impl StreamManager {
    pub fn new(
        client: Arc<dyn StockbitApi>,
        sink: Arc<CsvSink>,
        credentials: Arc<TokenManager>,
        config: SessionConfig,
    ) -> Self {
        Self {
            client,
            sink,
            credentials,
            config,
            sessions: DashMap::new(),
        }
    }

    /// Start a session over `tickers`. A missing `session_id` gets a
    /// generated one; an id colliding with a live session is refused,
    /// while a terminal session's id may be reused (its stats are
    /// replaced).
    pub fn start_stream(
        &self,
        session_id: Option<String>,
        tickers: Vec<String>,
        max_retries: Option<u32>,
    ) -> Result<SessionStats> {
        let tickers: Vec<String> = tickers
            .into_iter()
            .map(|t| t.trim().to_uppercase())
            .filter(|t| !t.is_empty())
            .collect();
        if tickers.is_empty() {
            return Err(AppError::Validation(
                "stream needs at least one ticker".to_string(),
            ));
        }
        if !self.credentials.is_valid() {
            return Err(AppError::AuthExpired(
                "set a bearer token before streaming".to_string(),
            ));
        }

        let id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(existing) = self.sessions.get(&id) {
            if !existing.is_terminal() {
                return Err(AppError::Validation(format!(
                    "session {id} already exists"
                )));
            }
        }

        let mut config = self.config.clone();
        config.max_retries = max_retries;

        let session = StreamSession::spawn(
            id.clone(),
            tickers,
            self.client.clone(),
            self.sink.clone(),
            self.credentials.clone(),
            config,
        );
        let stats = session.stats();
        self.sessions.insert(id.clone(), session);
        tracing::info!(session_id = %id, "stream started");
        Ok(stats)
    }

    /// Stop a session, keeping its stats readable.
    pub async fn stop_stream(&self, session_id: &str) -> Result<SessionStats> {
        let session = self
            .sessions
            .get(session_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| AppError::NotFound(format!("session {session_id} not found")))?;
        session.stop().await;
        tracing::info!(session_id = %session_id, "stream stopped");
        Ok(session.stats())
    }

    pub fn get_stats(&self, session_id: &str) -> Option<SessionStats> {
        self.sessions.get(session_id).map(|s| s.stats())
    }

    pub fn list(&self) -> Vec<SessionStats> {
        let mut stats: Vec<SessionStats> = self.sessions.iter().map(|s| s.stats()).collect();
        stats.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        stats
    }

    /// Stop every session concurrently.
    pub async fn stop_all(&self) {
        let sessions: Vec<Arc<StreamSession>> =
            self.sessions.iter().map(|s| Arc::clone(s.value())).collect();
        futures_util::future::join_all(sessions.iter().map(|s| s.stop())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::make_test_token;
    use crate::client::types::TradePage;
    use crate::stream::SessionState;
    use chrono::{NaiveDate, Utc};
    use std::time::Duration;
    use tempfile::tempdir;

    /// Client whose trading-key endpoint always fails, keeping sessions in
    /// the connecting/retrying loop without touching the network.
    struct UnreachableApi;

    #[async_trait::async_trait]
    impl StockbitApi for UnreachableApi {
        async fn fetch_trades(
            &self,
            _ticker: &str,
            _date: NaiveDate,
            _cursor: Option<&str>,
        ) -> Result<TradePage> {
            Err(AppError::Retryable("unreachable".to_string()))
        }

        async fn fetch_trading_key(&self) -> Result<String> {
            Err(AppError::Retryable("unreachable".to_string()))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        manager: StreamManager,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let sink = Arc::new(CsvSink::new(dir.path().join("data")).unwrap());
        let credentials = Arc::new(TokenManager::new(dir.path().join("token.json")));
        credentials
            .set(&make_test_token(Utc::now().timestamp() + 3600, 1), None)
            .unwrap();

        let config = SessionConfig {
            websocket_url: "wss://127.0.0.1:1/ws".to_string(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(60),
            max_retries: None,
            refresh: None,
        };
        let manager = StreamManager::new(Arc::new(UnreachableApi), sink, credentials, config);

        Fixture { _dir: dir, manager }
    }

    #[tokio::test]
    async fn zero_tickers_is_rejected_without_a_session() {
        let fx = fixture();

        let err = fx.manager.start_stream(None, vec![], None).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(fx.manager.list().is_empty());
    }

    #[tokio::test]
    async fn live_session_ids_cannot_collide() {
        let fx = fixture();

        fx.manager
            .start_stream(Some("s1".to_string()), vec!["bbca".to_string()], None)
            .unwrap();
        let err = fx
            .manager
            .start_stream(Some("s1".to_string()), vec!["TLKM".to_string()], None)
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        fx.manager.stop_all().await;
    }

    #[tokio::test]
    async fn stop_is_prompt_even_during_backoff_and_stats_survive() {
        let fx = fixture();

        let stats = fx
            .manager
            .start_stream(Some("s1".to_string()), vec!["bbca".to_string()], None)
            .unwrap();
        assert_eq!(stats.tickers, vec!["BBCA".to_string()]);

        // Give the session time to fail its first connect and enter the
        // 60-second backoff; stop must not wait it out.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = std::time::Instant::now();
        let stats = fx.manager.stop_stream("s1").await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(stats.state, SessionState::Stopped);
        assert!(stats.last_error.is_some());

        // Terminal stats stay listed, and the id becomes reusable.
        assert_eq!(fx.manager.list().len(), 1);
        fx.manager
            .start_stream(Some("s1".to_string()), vec!["TLKM".to_string()], None)
            .unwrap();
        fx.manager.stop_all().await;
    }

    #[tokio::test]
    async fn retries_exhausted_ends_in_errored() {
        let fx = fixture();

        fx.manager
            .start_stream(Some("s1".to_string()), vec!["BBCA".to_string()], Some(0))
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let stats = fx.manager.get_stats("s1").unwrap();
            if stats.state == SessionState::Errored {
                assert!(stats.last_error.is_some());
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session never errored: {:?}",
                stats.state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Client whose trading-key endpoint succeeds; used with a local
    /// WebSocket server.
    struct KeyOnlyApi;

    #[async_trait::async_trait]
    impl StockbitApi for KeyOnlyApi {
        async fn fetch_trades(
            &self,
            _ticker: &str,
            _date: NaiveDate,
            _cursor: Option<&str>,
        ) -> Result<TradePage> {
            Err(AppError::Retryable("not under test".to_string()))
        }

        async fn fetch_trading_key(&self) -> Result<String> {
            Ok("K".to_string())
        }
    }

    #[tokio::test]
    async fn reconnects_after_server_close_and_resumes_counting() {
        use crate::codec::{self, test_support::encode_orderbook_frame};
        use futures_util::{SinkExt, StreamExt};
        use parking_lot::Mutex;
        use tokio_tungstenite::tungstenite::Message;

        let dir = tempdir().unwrap();
        let sink = Arc::new(CsvSink::new(dir.path().join("data")).unwrap());
        let credentials = Arc::new(TokenManager::new(dir.path().join("token.json")));
        let token = make_test_token(Utc::now().timestamp() + 3600, 4826457);
        credentials.set(&token, None).unwrap();

        // Local WebSocket server: reads the subscription, emits one frame
        // per ticker, then closes the first connection to force a
        // reconnect; later connections stay open.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen_subscription: Arc<Mutex<Option<codec::SubscribeRequest>>> =
            Arc::new(Mutex::new(None));
        let seen = seen_subscription.clone();

        tokio::spawn(async move {
            let mut connections = 0u32;
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                connections += 1;
                let mut ws = match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws) => ws,
                    Err(_) => continue,
                };

                if let Some(Ok(Message::Binary(data))) = ws.next().await {
                    if let Ok(request) = codec::decode_subscribe(&data) {
                        *seen.lock() = Some(request);
                    }
                }

                for ticker in ["BBCA", "TLKM"] {
                    let frame = encode_orderbook_frame(
                        ticker,
                        &format!("#O|{ticker}|BID|100;5;500"),
                        "2025-11-03T10:00:00+07:00",
                    );
                    let _ = ws.send(Message::Binary(frame)).await;
                }

                if connections == 1 {
                    let _ = ws.close(None).await;
                } else {
                    // Hold the connection so the session settles.
                    loop {
                        match ws.next().await {
                            Some(Ok(_)) => {}
                            _ => break,
                        }
                    }
                }
            }
        });

        let config = SessionConfig {
            websocket_url: format!("ws://127.0.0.1:{port}/ws"),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_millis(50),
            backoff_max: Duration::from_millis(200),
            max_retries: None,
            refresh: None,
        };
        let manager =
            StreamManager::new(Arc::new(KeyOnlyApi), sink.clone(), credentials, config);

        manager
            .start_stream(
                Some("s1".to_string()),
                vec!["BBCA".to_string(), "TLKM".to_string()],
                None,
            )
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let stats = manager.get_stats("s1").unwrap();
            if stats.total_reconnects >= 1
                && stats.state == SessionState::Connected
                && stats.message_counts.get("BBCA").copied().unwrap_or(0) >= 1
                && stats.message_counts.get("TLKM").copied().unwrap_or(0) >= 1
            {
                assert_eq!(stats.retry_count, 0);
                assert!(stats.last_disconnect_at.is_some());
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "session never settled: {stats:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        // The server saw exactly the frame the codec produces for this
        // subscription tuple.
        let request = seen_subscription.lock().clone().expect("no subscription seen");
        assert_eq!(request.user_id, 4826457);
        assert_eq!(
            request.tickers,
            vec!["BBCA".to_string(), "TLKM".to_string()]
        );
        assert_eq!(request.trading_key, "K");
        assert_eq!(request.access_token, token);

        // Both tickers landed in the sink under the frame's UTC date.
        let files = sink.list_files(crate::storage::Dataset::Orderbook).unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.file_name.as_str()).collect();
        assert!(names.contains(&"2025-11-03_BBCA.csv"));
        assert!(names.contains(&"2025-11-03_TLKM.csv"));

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn missing_credential_refuses_to_start() {
        let dir = tempdir().unwrap();
        let sink = Arc::new(CsvSink::new(dir.path().join("data")).unwrap());
        let credentials = Arc::new(TokenManager::new(dir.path().join("token.json")));
        let config = SessionConfig {
            websocket_url: "wss://127.0.0.1:1/ws".to_string(),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
            max_retries: None,
            refresh: None,
        };
        let manager = StreamManager::new(Arc::new(UnreachableApi), sink, credentials, config);

        let err = manager
            .start_stream(None, vec!["BBCA".to_string()], None)
            .unwrap_err();
        assert!(matches!(err, AppError::AuthExpired(_)));
    }
}
