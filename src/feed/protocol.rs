// =============================================================================
// Feed Wire Protocol — JSON frames exchanged with the upstream broker feed
// =============================================================================
//
// Every frame is a JSON object tagged by "type". Outbound frames (auth,
// subscribe, unsubscribe, heartbeat) are built with serde_json. Inbound
// frames are parsed tolerantly: brokers send numeric fields as either JSON
// numbers or strings, and tick payloads omit most optional fields most of
// the time.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;

use crate::errors::CoreError;
use crate::types::{SubscriptionKey, Tick, TickQuality};

// =============================================================================
// Outbound frames
// =============================================================================

/// Auth frame carrying the credential triple.
pub fn auth_frame(bearer_token: &str, client_id: &str, feed_token: &str) -> String {
    serde_json::json!({
        "type": "auth",
        "bearer_token": bearer_token,
        "client_id": client_id,
        "feed_token": feed_token,
    })
    .to_string()
}

pub fn subscribe_frame(key: &SubscriptionKey) -> String {
    serde_json::json!({
        "type": "subscribe",
        "symbol": key.symbol,
        "exchange": key.exchange,
    })
    .to_string()
}

pub fn unsubscribe_frame(key: &SubscriptionKey) -> String {
    serde_json::json!({
        "type": "unsubscribe",
        "symbol": key.symbol,
        "exchange": key.exchange,
    })
    .to_string()
}

pub fn heartbeat_frame() -> String {
    serde_json::json!({ "type": "heartbeat" }).to_string()
}

// =============================================================================
// Inbound frames
// =============================================================================

/// A parsed inbound frame.
#[derive(Debug, Clone)]
pub enum Inbound {
    AuthAck { ok: bool, message: Option<String> },
    Heartbeat,
    Error { code: i64, message: String },
    Feed(FeedTick),
}

/// Raw tick payload as it appears on the wire, before processor
/// normalisation.
#[derive(Debug, Clone)]
pub struct FeedTick {
    pub symbol: String,
    pub exchange: Option<String>,
    pub last_price: Decimal,
    pub bid_price: Option<Decimal>,
    pub bid_size: Option<u64>,
    pub ask_price: Option<Decimal>,
    pub ask_size: Option<u64>,
    pub volume_delta: Option<u64>,
    pub day_volume: Option<u64>,
    pub day_value: Option<Decimal>,
    pub day_open: Option<Decimal>,
    pub day_high: Option<Decimal>,
    pub day_low: Option<Decimal>,
    pub prev_close: Option<Decimal>,
    pub trade_count: Option<u64>,
    pub feed_sequence: Option<u64>,
    /// Exchange timestamp in epoch microseconds. Missing on some sources;
    /// the caller falls back to arrival time.
    pub timestamp: Option<DateTime<Utc>>,
}

impl FeedTick {
    /// Convert into the engine's [`Tick`], stamping arrival metadata.
    /// Sequence and quality are assigned later by the tick processor.
    pub fn into_tick(self, source: &str, default_exchange: &str, arrived: DateTime<Utc>) -> Tick {
        Tick {
            symbol: self.symbol,
            exchange: self.exchange.unwrap_or_else(|| default_exchange.to_string()),
            last_price: self.last_price,
            bid_price: self.bid_price,
            bid_size: self.bid_size,
            ask_price: self.ask_price,
            ask_size: self.ask_size,
            volume_delta: self.volume_delta,
            day_volume: self.day_volume,
            day_value: self.day_value,
            day_open: self.day_open,
            day_high: self.day_high,
            day_low: self.day_low,
            prev_close: self.prev_close,
            timestamp: self.timestamp.unwrap_or(arrived),
            source: source.to_string(),
            feed_sequence: self.feed_sequence,
            sequence: 0,
            quality: TickQuality::Good,
        }
    }
}

/// Parse one inbound text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, CoreError> {
    let root: Value = serde_json::from_str(text)
        .map_err(|e| CoreError::FeedProtocol(format!("invalid JSON frame: {e}")))?;

    let kind = root["type"]
        .as_str()
        .ok_or_else(|| CoreError::FeedProtocol("frame missing 'type'".into()))?;

    match kind {
        "auth_ack" => Ok(Inbound::AuthAck {
            ok: root["ok"].as_bool().unwrap_or(false),
            message: root["message"].as_str().map(str::to_string),
        }),
        "heartbeat" => Ok(Inbound::Heartbeat),
        "error" => Ok(Inbound::Error {
            code: root["code"].as_i64().unwrap_or(0),
            message: root["message"].as_str().unwrap_or("").to_string(),
        }),
        "feed" => parse_feed_payload(&root).map(Inbound::Feed),
        other => Err(CoreError::FeedProtocol(format!("unknown frame type '{other}'"))),
    }
}

fn parse_feed_payload(root: &Value) -> Result<FeedTick, CoreError> {
    let symbol = root["symbol"]
        .as_str()
        .ok_or_else(|| CoreError::FeedProtocol("feed frame missing 'symbol'".into()))?
        .to_string();

    let last_price = parse_decimal(&root["ltp"])
        .ok_or_else(|| CoreError::FeedProtocol("feed frame missing 'ltp'".into()))?;

    let timestamp = root["ts"]
        .as_i64()
        .and_then(DateTime::from_timestamp_micros);

    Ok(FeedTick {
        symbol,
        exchange: root["exchange"].as_str().map(str::to_string),
        last_price,
        bid_price: parse_decimal(&root["bid"]),
        bid_size: parse_u64(&root["bid_size"]),
        ask_price: parse_decimal(&root["ask"]),
        ask_size: parse_u64(&root["ask_size"]),
        volume_delta: parse_u64(&root["qty"]),
        day_volume: parse_u64(&root["volume"]),
        day_value: parse_decimal(&root["value"]),
        day_open: parse_decimal(&root["open"]),
        day_high: parse_decimal(&root["high"]),
        day_low: parse_decimal(&root["low"]),
        prev_close: parse_decimal(&root["prev_close"]),
        trade_count: parse_u64(&root["trades"]),
        feed_sequence: parse_u64(&root["seq"]),
        timestamp,
    })
}

// =============================================================================
// Tolerant numeric helpers — brokers send numbers as numbers or strings
// =============================================================================

fn parse_decimal(val: &Value) -> Option<Decimal> {
    match val {
        Value::String(s) => s.parse().ok(),
        Value::Number(_) => val.to_string().parse().ok(),
        _ => None,
    }
}

fn parse_u64(val: &Value) -> Option<u64> {
    match val {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
