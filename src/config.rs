//! Runtime configuration
//!
//! Endpoints, directory layout and tuning constants. Everything has a
//! working default; `from_env` lets deployments relocate the data and
//! config directories without code changes.

use std::path::PathBuf;
use std::time::Duration;

/// Browser-like header template sent on every REST request. The exodus API
/// rejects requests without a plausible Origin/Referer pair.
pub const HEADER_TEMPLATE: &[(&str, &str)] = &[
    (
        "User-Agent",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:144.0) Gecko/20100101 Firefox/144.0",
    ),
    ("Accept", "application/json"),
    ("Accept-Language", "en-US,en;q=0.5"),
    ("Referer", "https://stockbit.com/"),
    ("Origin", "https://stockbit.com"),
];

/// Origin header for the WebSocket handshake.
pub const WS_ORIGIN: &str = "https://stockbit.com";

#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Root for CSV output; datasets live in subdirectories below it.
    pub data_dir: PathBuf,
    /// Holds `token.json` and the jobs database.
    pub config_dir: PathBuf,

    pub running_trade_url: String,
    pub trading_key_url: String,
    pub websocket_url: String,

    /// Rows requested per running-trade page.
    pub page_limit: u32,
    pub http_timeout: Duration,

    /// Application-level ping cadence on streaming connections.
    pub ping_interval: Duration,
    /// Silence tolerated past a ping before the connection is declared dead.
    pub pong_timeout: Duration,

    /// Reconnect backoff for streaming sessions: base * 2^(n-1), capped.
    pub stream_backoff_base: Duration,
    pub stream_backoff_max: Duration,

    /// Retry backoff for a single REST page fetch.
    pub rest_backoff_base: Duration,
    pub rest_backoff_max: Duration,
    pub rest_max_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            config_dir: PathBuf::from("config_data"),
            running_trade_url: "https://exodus.stockbit.com/order-trade/running-trade".to_string(),
            trading_key_url: "https://exodus.stockbit.com/auth/websocket/key".to_string(),
            websocket_url: "wss://wss-jkt.trading.stockbit.com/ws".to_string(),
            page_limit: 50,
            http_timeout: Duration::from_secs(30),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            stream_backoff_base: Duration::from_secs(5),
            stream_backoff_max: Duration::from_secs(300),
            rest_backoff_base: Duration::from_secs(1),
            rest_backoff_max: Duration::from_secs(60),
            rest_max_attempts: 5,
        }
    }
}

impl AppConfig {
    /// Default configuration with directory overrides taken from the
    /// environment (`STOCKBIT_DATA_DIR`, `STOCKBIT_CONFIG_DIR`).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var("STOCKBIT_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("STOCKBIT_CONFIG_DIR") {
            cfg.config_dir = PathBuf::from(dir);
        }
        cfg
    }

    /// Path of the persisted credential blob.
    pub fn token_file(&self) -> PathBuf {
        self.config_dir.join("token.json")
    }

    /// Path of the jobs database.
    pub fn jobs_db_file(&self) -> PathBuf {
        self.config_dir.join("jobs.db")
    }
}
