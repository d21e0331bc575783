//! Stockbit IDX market-data ingestion
//!
//! Two acquisition paths feed daily CSV files: a durable job scheduler
//! paginating the historical running-trade endpoint over ticker×date
//! tasks, and long-lived WebSocket sessions decoding the binary orderbook
//! protocol in real time. `state::AppState` is the programmatic entry
//! point for both.

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod scheduler;
pub mod state;
pub mod storage;
pub mod stream;

pub use config::AppConfig;
pub use error::{AppError, Result};
pub use state::AppState;
