//! Authenticated Stockbit REST client
//!
//! Thin wrapper over the two endpoints the ingest paths need: historical
//! running-trade pages and the per-session trading key required by the
//! streaming subscription. The client maps transport and status failures
//! onto the error taxonomy and never retries; retry policy belongs to the
//! callers.

pub mod types;

use crate::auth::TokenManager;
use crate::config::{AppConfig, HEADER_TEMPLATE};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::StatusCode;
use std::sync::Arc;
use types::{RunningTradeResponse, TradePage, TradingKeyResponse};

/// Pagination stops once a page's oldest trade reaches the opening
/// auction; earlier rows belong to pre-open mechanisms, not the session.
const MARKET_OPEN_TIME: &str = "09:00:00";

/// Seam between the scheduler / streaming sessions and the live broker.
#[async_trait]
pub trait StockbitApi: Send + Sync {
    /// Fetch one page of running trades. `cursor = None` asks for the most
    /// recent page; each subsequent call with the returned cursor walks
    /// backwards until `next_cursor` comes back `None`.
    async fn fetch_trades(
        &self,
        ticker: &str,
        date: NaiveDate,
        cursor: Option<&str>,
    ) -> Result<TradePage>;

    /// Fetch the short-lived trading key used by the streaming handshake.
    async fn fetch_trading_key(&self) -> Result<String>;
}

/// Live client backed by `reqwest`.
pub struct StockbitClient {
    http: reqwest::Client,
    credentials: Arc<TokenManager>,
    running_trade_url: String,
    trading_key_url: String,
    page_limit: u32,
}

impl StockbitClient {
    pub fn new(config: &AppConfig, credentials: Arc<TokenManager>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| AppError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            credentials,
            running_trade_url: config.running_trade_url.clone(),
            trading_key_url: config.trading_key_url.clone(),
            page_limit: config.page_limit,
        })
    }

    /// Base headers plus the current bearer token and cookies.
    fn auth_headers(&self) -> Result<reqwest::header::HeaderMap> {
        let token = self
            .credentials
            .token()
            .ok_or_else(|| AppError::AuthExpired("no bearer token set".to_string()))?;

        let mut headers = reqwest::header::HeaderMap::new();
        for (name, value) in HEADER_TEMPLATE {
            headers.insert(*name, value.parse().expect("static header value"));
        }
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {token}")
                .parse()
                .map_err(|_| AppError::AuthExpired("token is not a valid header value".to_string()))?,
        );
        if let Some(cookies) = self.credentials.cookies() {
            if let Ok(value) = cookies.parse() {
                headers.insert(reqwest::header::COOKIE, value);
            }
        }
        Ok(headers)
    }

    /// Map a non-success status onto the error taxonomy.
    fn classify_status(&self, status: StatusCode, context: &str) -> AppError {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            // The broker rejected the token; surface that through status
            // queries until a fresh one is set.
            self.credentials.mark_expired();
            AppError::AuthExpired(format!("{context}: HTTP {status}"))
        } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            AppError::Retryable(format!("{context}: HTTP {status}"))
        } else {
            AppError::Malformed(format!("{context}: unexpected HTTP {status}"))
        }
    }
}

fn transport_error(context: &str, err: reqwest::Error) -> AppError {
    AppError::Retryable(format!("{context}: {err}"))
}

#[async_trait]
impl StockbitApi for StockbitClient {
    async fn fetch_trades(
        &self,
        ticker: &str,
        date: NaiveDate,
        cursor: Option<&str>,
    ) -> Result<TradePage> {
        let headers = self.auth_headers()?;
        let date_str = date.format("%Y-%m-%d").to_string();

        let mut query: Vec<(&str, String)> = vec![
            ("sort", "DESC".to_string()),
            ("limit", self.page_limit.to_string()),
            ("order_by", "RUNNING_TRADE_ORDER_BY_TIME".to_string()),
            ("symbols[]", ticker.to_string()),
            ("date", date_str),
        ];
        if let Some(cursor) = cursor {
            query.push(("trade_number", cursor.to_string()));
        }

        let context = format!("running-trade {ticker}");
        let response = self
            .http
            .get(&self.running_trade_url)
            .headers(headers)
            .query(&query)
            .send()
            .await
            .map_err(|e| transport_error(&context, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.classify_status(status, &context));
        }

        let envelope: RunningTradeResponse = response
            .json()
            .await
            .map_err(|e| AppError::Malformed(format!("{context}: undecodable body: {e}")))?;
        let rows = envelope.into_rows();

        // A short page, a missing trade number, or a page that reached the
        // opening auction all mean the walk is done.
        let next_cursor = if rows.len() < self.page_limit as usize {
            None
        } else {
            match rows.last() {
                Some(last) if last.time.as_str() <= MARKET_OPEN_TIME && !last.time.is_empty() => {
                    None
                }
                Some(last) => last.trade_number.map(|n| n.to_string()),
                None => None,
            }
        };

        Ok(TradePage { rows, next_cursor })
    }

    async fn fetch_trading_key(&self) -> Result<String> {
        let headers = self.auth_headers()?;
        let context = "trading-key";

        let response = self
            .http
            .get(&self.trading_key_url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| transport_error(context, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.classify_status(status, context));
        }

        let envelope: TradingKeyResponse = response
            .json()
            .await
            .map_err(|e| AppError::Malformed(format!("{context}: undecodable body: {e}")))?;
        envelope
            .into_key()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::Malformed(format!("{context}: response carried no key")))
    }
}
