//! Typed application events carried over the realtime socket.
//!
//! The [`ConnectionManager`] routes raw JSON; this module gives the backend's well-known message
//! types a concrete shape. Fields are read from the envelope `payload`, or from the envelope itself
//! when the server inlines them next to `type`.

use std::fmt;

use bon::Builder;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::ws::error::WsError;
use crate::ws::message::Envelope;
use crate::ws::{ConnectionManager, Registration, WILDCARD};

/// An application message decoded by its `type`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum TradingEvent {
    /// `tick`: top-of-book quote
    Tick(Tick),
    /// `candle`: OHLCV bar
    Candle(Candle),
    /// `prediction`: model forecast for a symbol
    Prediction(Prediction),
    /// `trading_signal`: actionable trade setup
    TradingSignal(TradingSignal),
    /// `positions_snapshot`: current open positions
    PositionsSnapshot(PositionsSnapshot),
    /// `order_accepted`
    OrderAccepted(OrderAccepted),
    /// `order_rejected`
    OrderRejected(OrderRejected),
    /// `alert`: user alert triggered
    Alert(Alert),
    /// `error`: server-side error report
    Error(ServerError),
    /// Any other message type, untouched
    Other(Envelope),
}

impl TradingEvent {
    /// Decode a full envelope value such as `{"type": "tick", "payload": {...}}`.
    pub fn decode(value: &Value) -> Result<Self, WsError> {
        Self::from_envelope(Envelope::from_value(value.clone()))
    }

    /// Decode an already routed envelope. Unknown and untyped messages become
    /// [`TradingEvent::Other`].
    pub fn from_envelope(envelope: Envelope) -> Result<Self, WsError> {
        let Some(msg_type) = envelope.msg_type() else {
            return Ok(Self::Other(envelope));
        };

        Ok(match msg_type {
            "tick" => Self::Tick(body(&envelope)?),
            "candle" => Self::Candle(body(&envelope)?),
            "prediction" => Self::Prediction(body(&envelope)?),
            "trading_signal" => Self::TradingSignal(body(&envelope)?),
            "positions_snapshot" => Self::PositionsSnapshot(body(&envelope)?),
            "order_accepted" => Self::OrderAccepted(body(&envelope)?),
            "order_rejected" => Self::OrderRejected(body(&envelope)?),
            "alert" => Self::Alert(body(&envelope)?),
            "error" => Self::Error(body(&envelope)?),
            _ => Self::Other(envelope),
        })
    }

    /// Symbol the event refers to, when it has one.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Self::Tick(tick) => Some(tick.symbol.as_str()),
            Self::Candle(candle) => Some(candle.symbol.as_str()),
            Self::Prediction(prediction) => Some(prediction.symbol.as_str()),
            Self::TradingSignal(signal) => Some(signal.symbol.as_str()),
            Self::OrderAccepted(order) => order.symbol.as_deref(),
            Self::Alert(alert) => alert.symbol.as_deref(),
            Self::PositionsSnapshot(_) | Self::OrderRejected(_) | Self::Error(_) | Self::Other(_) => {
                None
            }
        }
    }
}

fn body<T: DeserializeOwned>(envelope: &Envelope) -> Result<T, WsError> {
    let source = if envelope.payload().is_null() {
        envelope.as_value()
    } else {
        envelope.payload()
    };

    T::deserialize(source).map_err(|source| WsError::PayloadMismatch {
        msg_type: envelope.msg_type().map(str::to_owned),
        source,
    })
}

/// Register `handler` for every application message, decoded as a [`TradingEvent`].
///
/// Messages of a known type whose body does not match are logged and skipped.
pub fn subscribe<F>(manager: &ConnectionManager, handler: F) -> Registration
where
    F: Fn(TradingEvent) + Send + Sync + 'static,
{
    manager.on(WILDCARD, move |value| match TradingEvent::decode(value) {
        Ok(event) => handler(event),
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Unable to decode trading event");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    })
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
pub struct Tick {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    #[must_use]
    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }

    #[must_use]
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
pub struct Candle {
    pub symbol: String,
    /// Bar period, e.g. `M1` or `H4`
    #[serde(default)]
    pub timeframe: Option<String>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(alias = "up", alias = "buy", alias = "BUY")]
    Bullish,
    #[serde(alias = "down", alias = "sell", alias = "SELL")]
    Bearish,
    Neutral,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self {
            Self::Bullish => "bullish",
            Self::Bearish => "bearish",
            Self::Neutral => "neutral",
            Self::Unknown => "unknown",
        };
        f.write_str(direction)
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
pub struct Prediction {
    pub symbol: String,
    pub direction: Direction,
    /// Model confidence in `[0, 1]`
    pub confidence: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
pub struct TradingSignal {
    pub symbol: String,
    /// `BUY`, `SELL`, `STRONG_BUY`, ...
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub timeframe: Option<String>,
    pub entry_price: Decimal,
    #[serde(alias = "suggested_sl")]
    pub stop_loss: Decimal,
    #[serde(alias = "suggested_tp")]
    pub take_profit: Decimal,
    #[serde(default)]
    pub confidence: Option<Decimal>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
pub struct PositionsSnapshot {
    #[serde(default)]
    pub positions: Vec<Position>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
pub struct Position {
    pub symbol: String,
    pub volume: Decimal,
    #[serde(default)]
    pub side: Option<String>,
    #[serde(default)]
    pub open_price: Option<Decimal>,
    #[serde(default)]
    pub profit: Option<Decimal>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
pub struct OrderAccepted {
    pub order_id: String,
    #[serde(default)]
    pub symbol: Option<String>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
pub struct OrderRejected {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default, alias = "message")]
    pub reason: Option<String>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
pub struct Alert {
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
}

#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Deserialize, Builder)]
pub struct ServerError {
    #[serde(alias = "detail")]
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}
