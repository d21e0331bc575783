//! Real-time orderbook streaming
//!
//! A session is one WebSocket subscription covering a set of tickers; the
//! manager keeps named sessions independent of each other, each with its
//! own reconnect policy and statistics.

mod manager;
mod session;

pub use manager::StreamManager;
pub use session::{RefreshHook, SessionConfig, SessionState, SessionStats, StreamSession};
