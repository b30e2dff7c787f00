//! Wire contract of the realtime socket.
//!
//! Inbound frames are `{"type": string, "payload": any}` envelopes. The heartbeat reply
//! (`{"type": "pong"}`) is decoded into [`Inbound::Control`] so that it never reaches the
//! application handler registry. Any other JSON value is an application message; one without a
//! string `type` has no routing type and only reaches wildcard handlers.

use serde::Serialize;
use serde_json::Value;

use super::error::WsError;

/// Message type that subscribes a handler to every application message.
pub const WILDCARD: &str = "*";

const PONG: &str = "pong";

/// A decoded inbound frame.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Protocol-level message consumed by the connection itself
    Control(Control),
    /// Application message routed to registered handlers
    Application(Envelope),
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Reply to a heartbeat `ping`
    Pong,
}

impl Inbound {
    /// Decode a raw frame. Only frames that are not JSON are rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, WsError> {
        let raw: Value = serde_json::from_slice(bytes).map_err(WsError::MalformedFrame)?;
        let envelope = Envelope::from_value(raw);

        Ok(if envelope.msg_type() == Some(PONG) {
            Self::Control(Control::Pong)
        } else {
            Self::Application(envelope)
        })
    }
}

/// An application message: its `type`, its `payload` and the full JSON it arrived as.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    msg_type: Option<String>,
    payload: Value,
    raw: Value,
}

impl Envelope {
    /// Build an envelope from a parsed JSON value of any shape.
    #[must_use]
    pub fn from_value(raw: Value) -> Self {
        let msg_type = raw.get("type").and_then(Value::as_str).map(str::to_owned);
        let payload = raw.get("payload").cloned().unwrap_or(Value::Null);

        Self {
            msg_type,
            payload,
            raw,
        }
    }

    /// The message type used for routing, `None` when the message carries no string `type`.
    #[must_use]
    pub fn msg_type(&self) -> Option<&str> {
        self.msg_type.as_deref()
    }

    /// The `payload` field, or `null` when absent.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The complete message as received, handed to wildcard handlers.
    #[must_use]
    pub fn as_value(&self) -> &Value {
        &self.raw
    }
}

/// Subscribe request sent once per successful connection.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
pub struct SubscribeRequest {
    pub action: SubscriptionAction,
    pub channels: Vec<String>,
}

impl SubscribeRequest {
    #[must_use]
    pub fn subscribe(channels: Vec<String>) -> Self {
        Self {
            action: SubscriptionAction::Subscribe,
            channels,
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionAction {
    Subscribe,
}

/// Application-level heartbeat.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Heartbeat {
    Ping,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn pong_is_a_control_message() {
        let inbound = Inbound::decode(br#"{"type":"pong"}"#).unwrap();

        assert_eq!(inbound, Inbound::Control(Control::Pong));
    }

    #[test]
    fn application_message_keeps_payload_and_envelope() {
        let inbound =
            Inbound::decode(br#"{"type":"price_update","payload":{"symbol":"XAUUSD"},"seq":7}"#)
                .unwrap();

        let Inbound::Application(envelope) = inbound else {
            panic!("expected an application message");
        };
        assert_eq!(envelope.msg_type(), Some("price_update"));
        assert_eq!(envelope.payload(), &json!({"symbol": "XAUUSD"}));
        assert_eq!(envelope.as_value()["seq"], json!(7));
    }

    #[test]
    fn missing_payload_is_null() {
        let Inbound::Application(envelope) = Inbound::decode(br#"{"type":"ping"}"#).unwrap()
        else {
            panic!("ping from the server is an application message");
        };

        assert_eq!(envelope.payload(), &Value::Null);
    }

    #[test]
    fn invalid_json_is_rejected() {
        let err = Inbound::decode(b"invalid json{").unwrap_err();

        assert!(matches!(err, WsError::MalformedFrame(_)), "got {err:?}");
    }

    #[test]
    fn untyped_messages_are_application_messages() {
        let frames: [&[u8]; 5] = [
            br#"{"payload":1}"#,
            br#"{"type":42}"#,
            b"[1,2,3]",
            b"\"pong\"",
            b"17",
        ];
        for frame in frames {
            let Inbound::Application(envelope) = Inbound::decode(frame).unwrap() else {
                panic!("expected an application message for {frame:?}");
            };
            assert_eq!(envelope.msg_type(), None);
            assert_eq!(
                envelope.as_value(),
                &serde_json::from_slice::<Value>(frame).unwrap()
            );
        }
    }

    #[test]
    fn untyped_message_keeps_its_payload_field() {
        let Inbound::Application(envelope) = Inbound::decode(br#"{"payload":"no type"}"#).unwrap()
        else {
            panic!("expected an application message");
        };

        assert_eq!(envelope.payload(), &json!("no type"));
    }

    #[test]
    fn subscribe_request_wire_format() {
        let request = SubscribeRequest::subscribe(vec!["prices".to_owned(), "alerts".to_owned()]);

        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"action": "subscribe", "channels": ["prices", "alerts"]})
        );
    }

    #[test]
    fn ping_wire_format() {
        assert_eq!(
            serde_json::to_string(&Heartbeat::Ping).unwrap(),
            r#"{"type":"ping"}"#
        );
    }
}
