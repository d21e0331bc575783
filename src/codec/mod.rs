//! Binary wire codec for the streaming endpoint
//!
//! The endpoint speaks a tag-length-value format: each field starts with a
//! base-128 varint header `(field_number << 3) | wire_type`, where wire
//! type 0 is a varint payload and wire type 2 is a length-delimited
//! payload. No other wire types appear on this connection.
//!
//! Pure encode/decode only; no I/O happens here.

pub mod orderbook;

use crate::error::AppError;
use std::collections::BTreeMap;
use thiserror::Error;

/// Varint payload.
pub const WIRE_VARINT: u8 = 0;
/// Length-delimited payload (bytes, UTF-8 string, or a nested frame).
pub const WIRE_LEN: u8 = 2;

/// Prefixes applied to every subscribed ticker, in emission order. The
/// server expects each ticker in all four derived forms.
const TICKER_PREFIXES: [&str; 4] = ["", "2", ":", "J"];

/// Typed decode failure. The whole frame is rejected; partial decodes are
/// never surfaced.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("varint truncated at offset {0}")]
    TruncatedVarint(usize),

    #[error("field {field} length {length} overruns frame ({remaining} bytes remaining)")]
    LengthOverrun {
        field: u32,
        length: usize,
        remaining: usize,
    },

    #[error("unsupported wire type {wire_type} for field {field}")]
    UnsupportedWireType { field: u32, wire_type: u8 },

    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(u32),

    #[error("{0}")]
    InvalidPayload(String),
}

impl From<DecodeError> for AppError {
    fn from(err: DecodeError) -> Self {
        AppError::Malformed(err.to_string())
    }
}

/// Append `value` as a base-128 varint.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value > 0x7f {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Read a base-128 varint starting at `*pos`, advancing it.
pub fn get_varint(data: &[u8], pos: &mut usize) -> Result<u64, DecodeError> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos).ok_or(DecodeError::TruncatedVarint(*pos))?;
        *pos += 1;
        result |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
        if shift >= 64 {
            return Err(DecodeError::TruncatedVarint(*pos));
        }
    }
}

fn put_tag(buf: &mut Vec<u8>, field: u32, wire_type: u8) {
    put_varint(buf, (u64::from(field) << 3) | u64::from(wire_type));
}

fn put_varint_field(buf: &mut Vec<u8>, field: u32, value: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, value);
}

fn put_len_field(buf: &mut Vec<u8>, field: u32, payload: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, payload.len() as u64);
    buf.extend_from_slice(payload);
}

/// One decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Varint(u64),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Render the value as an opaque string: varints in decimal, bytes as
    /// lossy UTF-8.
    pub fn to_opaque_string(&self) -> String {
        match self {
            FieldValue::Varint(v) => v.to_string(),
            FieldValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// Decode a flat frame into (field number, values). Repeated fields keep
/// their arrival order within each field number.
pub fn decode_fields(data: &[u8]) -> Result<BTreeMap<u32, Vec<FieldValue>>, DecodeError> {
    let mut fields: BTreeMap<u32, Vec<FieldValue>> = BTreeMap::new();
    let mut pos = 0usize;

    while pos < data.len() {
        let tag = get_varint(data, &mut pos)?;
        let field = (tag >> 3) as u32;
        let wire_type = (tag & 0x7) as u8;

        match wire_type {
            WIRE_VARINT => {
                let value = get_varint(data, &mut pos)?;
                fields.entry(field).or_default().push(FieldValue::Varint(value));
            }
            WIRE_LEN => {
                let length = get_varint(data, &mut pos)? as usize;
                let remaining = data.len() - pos;
                if length > remaining {
                    return Err(DecodeError::LengthOverrun {
                        field,
                        length,
                        remaining,
                    });
                }
                fields
                    .entry(field)
                    .or_default()
                    .push(FieldValue::Bytes(data[pos..pos + length].to_vec()));
                pos += length;
            }
            other => {
                return Err(DecodeError::UnsupportedWireType {
                    field,
                    wire_type: other,
                })
            }
        }
    }

    Ok(fields)
}

/// Subscription request fields (client → server).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub user_id: u64,
    pub tickers: Vec<String>,
    pub trading_key: String,
    pub access_token: String,
}

impl SubscribeRequest {
    /// The ticker entries of the nested group, in the order the server
    /// expects: every ticker plain, then every ticker with each prefix.
    pub fn ticker_entries(&self) -> Vec<String> {
        let mut entries = Vec::with_capacity(self.tickers.len() * TICKER_PREFIXES.len());
        for prefix in TICKER_PREFIXES {
            for ticker in &self.tickers {
                entries.push(format!("{prefix}{ticker}"));
            }
        }
        entries
    }
}

/// Encode the single subscription frame sent after the handshake:
/// field 1 varint user id, field 2 a nested frame of repeated field-2
/// ticker entries, field 3 the trading key, field 5 the bearer token.
pub fn encode_subscribe(request: &SubscribeRequest) -> Vec<u8> {
    let mut group = Vec::new();
    for entry in request.ticker_entries() {
        put_len_field(&mut group, 2, entry.as_bytes());
    }

    let mut frame = Vec::new();
    put_varint_field(&mut frame, 1, request.user_id);
    put_len_field(&mut frame, 2, &group);
    put_len_field(&mut frame, 3, request.trading_key.as_bytes());
    put_len_field(&mut frame, 5, request.access_token.as_bytes());
    frame
}

/// Decode a subscription frame back into its fields. Exists so the frame
/// layout is verifiable without a live server.
pub fn decode_subscribe(data: &[u8]) -> Result<SubscribeRequest, DecodeError> {
    let fields = decode_fields(data)?;

    let user_id = match fields.get(&1).and_then(|v| v.first()) {
        Some(FieldValue::Varint(id)) => *id,
        _ => {
            return Err(DecodeError::InvalidPayload(
                "subscription frame missing varint user id".to_string(),
            ))
        }
    };

    let group = match fields.get(&2).and_then(|v| v.first()) {
        Some(FieldValue::Bytes(bytes)) => decode_fields(bytes)?,
        _ => {
            return Err(DecodeError::InvalidPayload(
                "subscription frame missing ticker group".to_string(),
            ))
        }
    };

    let mut entries = Vec::new();
    for value in group.get(&2).map(Vec::as_slice).unwrap_or_default() {
        match value {
            FieldValue::Bytes(bytes) => entries.push(
                String::from_utf8(bytes.clone()).map_err(|_| DecodeError::InvalidUtf8(2))?,
            ),
            FieldValue::Varint(_) => return Err(DecodeError::UnsupportedWireType { field: 2, wire_type: WIRE_VARINT }),
        }
    }

    // Plain tickers come first; the remaining entries are derived forms.
    let plain = entries
        .iter()
        .take(entries.len() / TICKER_PREFIXES.len())
        .cloned()
        .collect();

    let string_field = |num: u32, name: &str| -> Result<String, DecodeError> {
        match fields.get(&num).and_then(|v| v.first()) {
            Some(FieldValue::Bytes(bytes)) => {
                String::from_utf8(bytes.clone()).map_err(|_| DecodeError::InvalidUtf8(num))
            }
            _ => Err(DecodeError::InvalidPayload(format!(
                "subscription frame missing {name}"
            ))),
        }
    };

    Ok(SubscribeRequest {
        user_id,
        tickers: plain,
        trading_key: string_field(3, "trading key")?,
        access_token: string_field(5, "access token")?,
    })
}

/// Decoded orderbook update (server → client), carried in field 10.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderbookFrame {
    pub ticker: String,
    /// Raw `#O|...` payload string; see [`orderbook::parse_book_payload`].
    pub payload: String,
    /// Sub-fields 3, 4, 5, 8, 9: timestamps and opaque integers, retained
    /// verbatim without interpreting their format.
    pub extras: BTreeMap<u32, String>,
}

impl OrderbookFrame {
    /// Server timestamp for storage: sub-field 5, falling back to 9.
    pub fn server_timestamp(&self) -> Option<&str> {
        self.extras
            .get(&5)
            .or_else(|| self.extras.get(&9))
            .map(String::as_str)
    }
}

/// Decode a server frame. Returns `Ok(None)` when the frame carries no
/// field-10 orderbook update (status frames are skipped, not errors).
pub fn decode_orderbook_frame(data: &[u8]) -> Result<Option<OrderbookFrame>, DecodeError> {
    let top = decode_fields(data)?;

    let nested_bytes = match top.get(&10).and_then(|v| v.first()) {
        Some(FieldValue::Bytes(bytes)) => bytes,
        Some(FieldValue::Varint(_)) => {
            return Err(DecodeError::InvalidPayload(
                "field 10 is not length-delimited".to_string(),
            ))
        }
        None => return Ok(None),
    };

    let nested = decode_fields(nested_bytes)?;

    let string_sub = |num: u32| -> Option<String> {
        nested
            .get(&num)
            .and_then(|v| v.first())
            .map(FieldValue::to_opaque_string)
    };

    let ticker = string_sub(1)
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| DecodeError::InvalidPayload("orderbook frame missing ticker".to_string()))?;
    let payload = string_sub(2)
        .filter(|p| !p.is_empty())
        .ok_or_else(|| DecodeError::InvalidPayload("orderbook frame missing payload".to_string()))?;

    let mut extras = BTreeMap::new();
    for num in [3u32, 4, 5, 8, 9] {
        if let Some(value) = string_sub(num) {
            extras.insert(num, value);
        }
    }

    Ok(Some(OrderbookFrame {
        ticker,
        payload,
        extras,
    }))
}
