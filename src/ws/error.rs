#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::error::{Error, Kind};

/// Why a realtime session failed or a frame was rejected.
///
/// Session failures are logged by the connection and feed the reconnect policy; they only reach
/// callers through [`crate::events`] decoding.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// The socket could not be opened, or reading or writing it failed
    Transport(tungstenite::Error),
    /// The opening handshake did not finish within the configured connect timeout
    ConnectTimeout(Duration),
    /// No `pong` arrived within the configured heartbeat timeout
    HeartbeatTimeout(Duration),
    /// The server sent a close frame or ended the stream
    ClosedByServer,
    /// An inbound text frame was not JSON
    MalformedFrame(serde_json::Error),
    /// An outbound message could not be serialized
    Encode(serde_json::Error),
    /// A message body does not have the shape its type promises
    PayloadMismatch {
        /// Routing type of the offending message, when it had one
        msg_type: Option<String>,
        /// Deserialization failure for the body
        source: serde_json::Error,
    },
}

impl WsError {
    /// Whether the failure ended a session (as opposed to rejecting a single message).
    #[must_use]
    pub const fn is_session_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::ConnectTimeout(_)
                | Self::HeartbeatTimeout(_)
                | Self::ClosedByServer
        )
    }
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "realtime socket transport failed: {e}"),
            Self::ConnectTimeout(limit) => {
                write!(f, "realtime socket handshake exceeded {limit:?}")
            }
            Self::HeartbeatTimeout(limit) => write!(f, "no pong within {limit:?} of a ping"),
            Self::ClosedByServer => f.write_str("realtime socket closed by the server"),
            Self::MalformedFrame(e) => write!(f, "inbound frame is not JSON: {e}"),
            Self::Encode(e) => write!(f, "outbound message could not be serialized: {e}"),
            Self::PayloadMismatch {
                msg_type: Some(msg_type),
                source,
            } => write!(f, "`{msg_type}` message has an unexpected body: {source}"),
            Self::PayloadMismatch {
                msg_type: None,
                source,
            } => write!(f, "untyped message has an unexpected body: {source}"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::MalformedFrame(e) | Self::Encode(e) | Self::PayloadMismatch { source: e, .. } => {
                Some(e)
            }
            Self::ConnectTimeout(_) | Self::HeartbeatTimeout(_) | Self::ClosedByServer => None,
        }
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        Error::with_source(Kind::WebSocket, e)
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::with_source(Kind::WebSocket, WsError::Transport(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_failures_are_told_apart_from_bad_messages() {
        let bad_json = serde_json::from_str::<u8>("x").unwrap_err();

        assert!(WsError::ClosedByServer.is_session_failure(), "close ends a session");
        assert!(
            WsError::HeartbeatTimeout(Duration::from_secs(1)).is_session_failure(),
            "missed pong ends a session"
        );
        assert!(
            !WsError::MalformedFrame(bad_json).is_session_failure(),
            "a bad frame is dropped, not fatal"
        );
    }

    #[test]
    fn converts_into_websocket_kind() {
        let error: Error = WsError::ConnectTimeout(Duration::from_millis(250)).into();

        assert_eq!(error.kind(), Kind::WebSocket);
        assert_eq!(
            error.to_string(),
            "WebSocket: realtime socket handshake exceeded 250ms"
        );
        assert!(error.downcast_ref::<WsError>().is_some(), "source is kept");
    }
}
