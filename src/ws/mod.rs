//! Realtime WebSocket infrastructure.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: one logical connection with heartbeat, reconnection and dispatch
//! - [`HandlerRegistry`]: handlers keyed by message type, plus connect/disconnect observers
//! - [`ReconnectBackoff`]: capped exponential reconnect policy
//! - [`message`]: the wire contract (envelopes, subscribe requests, heartbeat)
//!
//! # Example
//!
//! ```no_run
//! use trading_realtime::ws::{ConnectionManager, config::Config};
//!
//! # async fn example() -> trading_realtime::Result<()> {
//! let manager = ConnectionManager::new(Config::from_env()?);
//! let _alerts = manager.on("alert", |payload| println!("alert: {payload}"));
//! manager.connect();
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod registry;

pub use backoff::ReconnectBackoff;
pub use connection::{ConnectionManager, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use message::{Envelope, WILDCARD};
pub use registry::{HandlerRegistry, Registration};
