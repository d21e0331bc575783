//! Orderbook payload parsing
//!
//! The payload string inside an orderbook frame is pipe-delimited:
//! `#O|<TICKER>|<SIDE>|price;lots;value|price;lots;value|...`. Numeric
//! parts are validated but kept as the server-provided strings; whether
//! `total_value` is an integer amount or a fixed-point decimal is a
//! question for readers of the CSV, not for this layer.

use super::DecodeError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Magic prefix of every orderbook payload.
const BOOK_MAGIC: &str = "#O";

/// Which side of the book the levels belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BookSide {
    Bid,
    Offer,
}

impl BookSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSide::Bid => "BID",
            BookSide::Offer => "OFFER",
        }
    }
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookSide {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BID" => Ok(BookSide::Bid),
            "OFFER" => Ok(BookSide::Offer),
            other => Err(DecodeError::InvalidPayload(format!(
                "unknown book side {other:?}"
            ))),
        }
    }
}

/// One price point: server-provided representations, order preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookLevel {
    pub price: String,
    pub lots: String,
    pub total_value: String,
}

/// One side of one ticker's book as carried by a single frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookUpdate {
    pub ticker: String,
    pub side: BookSide,
    pub levels: Vec<BookLevel>,
}

/// Parse an orderbook payload string.
///
/// A payload without the `#O` magic, ticker, or a known side fails as a
/// whole. Individual levels that are empty or non-numeric are skipped so
/// one bad level does not discard the rest of the frame.
pub fn parse_book_payload(raw: &str) -> Result<BookUpdate, DecodeError> {
    let mut parts = raw.split('|');

    match parts.next() {
        Some(BOOK_MAGIC) => {}
        _ => {
            return Err(DecodeError::InvalidPayload(format!(
                "payload does not start with {BOOK_MAGIC}"
            )))
        }
    }

    let ticker = parts
        .next()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| DecodeError::InvalidPayload("payload missing ticker".to_string()))?
        .to_uppercase();

    let side: BookSide = parts
        .next()
        .map(str::trim)
        .ok_or_else(|| DecodeError::InvalidPayload("payload missing side".to_string()))?
        .parse()?;

    let mut levels = Vec::new();
    for segment in parts {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        match parse_level(segment) {
            Some(level) => levels.push(level),
            None => tracing::warn!(ticker = %ticker, "skipping unparseable book level {:?}", segment),
        }
    }

    Ok(BookUpdate {
        ticker,
        side,
        levels,
    })
}

fn parse_level(segment: &str) -> Option<BookLevel> {
    let mut parts = segment.split(';');
    let price = parts.next()?.trim();
    let lots = parts.next()?.trim();
    let total_value = parts.next()?.trim();

    // Validate numerically, store verbatim.
    price.parse::<f64>().ok()?;
    lots.parse::<i64>().ok()?;
    total_value.parse::<f64>().ok()?;

    Some(BookLevel {
        price: price.to_string(),
        lots: lots.to_string(),
        total_value: total_value.to_string(),
    })
}
