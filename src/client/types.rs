//! Running-trade API types

use serde::{Deserialize, Deserializer};

/// One executed trade as returned by the running-trade endpoint. The API
/// is loose about numeric types, so display fields tolerate both strings
/// and numbers.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TradeRow {
    #[serde(default, deserialize_with = "flex_string")]
    pub id: String,
    #[serde(default, deserialize_with = "flex_string")]
    pub time: String,
    #[serde(default, deserialize_with = "flex_string")]
    pub action: String,
    #[serde(default, deserialize_with = "flex_string")]
    pub code: String,
    #[serde(default, deserialize_with = "flex_string")]
    pub price: String,
    #[serde(default, deserialize_with = "flex_string")]
    pub change: String,
    #[serde(default, deserialize_with = "flex_string")]
    pub lot: String,
    #[serde(default, deserialize_with = "flex_string")]
    pub buyer: String,
    #[serde(default, deserialize_with = "flex_string")]
    pub seller: String,
    #[serde(default, deserialize_with = "flex_opt_i64")]
    pub trade_number: Option<i64>,
    #[serde(default, deserialize_with = "flex_string")]
    pub buyer_type: String,
    #[serde(default, deserialize_with = "flex_string")]
    pub seller_type: String,
    #[serde(default, deserialize_with = "flex_string")]
    pub market_board: String,
}

impl TradeRow {
    /// CSV row in running-trade column order. `date` is the trading date
    /// the row was fetched for. Prices lose their thousands separators and
    /// change loses its `%`/`+` decoration so the CSV stays numeric.
    pub fn to_csv_row(&self, date: &str) -> Vec<String> {
        vec![
            self.id.clone(),
            date.to_string(),
            self.time.clone(),
            self.action.clone(),
            self.code.clone(),
            self.price.replace(',', ""),
            self.change.replace(['%', '+'], ""),
            self.lot.clone(),
            self.buyer.clone(),
            self.seller.clone(),
            self.trade_number.map(|n| n.to_string()).unwrap_or_default(),
            self.buyer_type.clone(),
            self.seller_type.clone(),
            self.market_board.clone(),
        ]
    }
}

/// One page of trades plus the cursor for the next (older) page.
#[derive(Debug, Clone, Default)]
pub struct TradePage {
    pub rows: Vec<TradeRow>,
    /// `None` means the walk is complete.
    pub next_cursor: Option<String>,
}

/// Envelope of the running-trade response. Rows normally sit under
/// `data.running_trade`; a flat `running_trade` fallback is accepted.
#[derive(Debug, Deserialize)]
pub(crate) struct RunningTradeResponse {
    #[serde(default)]
    pub data: Option<RunningTradeData>,
    #[serde(default)]
    pub running_trade: Option<Vec<TradeRow>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RunningTradeData {
    #[serde(default)]
    pub running_trade: Vec<TradeRow>,
}

impl RunningTradeResponse {
    pub fn into_rows(self) -> Vec<TradeRow> {
        match self.data {
            Some(data) => data.running_trade,
            None => self.running_trade.unwrap_or_default(),
        }
    }
}

/// Envelope of the trading-key response; a flat `key` is also accepted.
#[derive(Debug, Deserialize)]
pub(crate) struct TradingKeyResponse {
    #[serde(default)]
    pub data: Option<TradingKeyData>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TradingKeyData {
    pub key: String,
}

impl TradingKeyResponse {
    pub fn into_key(self) -> Option<String> {
        match self.data {
            Some(data) => Some(data.key),
            None => self.key,
        }
    }
}

/// Accept a JSON string, number, bool or null as a display string.
fn flex_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Accept an integer or a numeric string.
fn flex_opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    })
}
