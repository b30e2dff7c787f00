#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::str::FromStr;
use std::time::Duration;

use bon::Builder;

use super::endpoint::{self, PageOrigin};
use crate::Result;
use crate::error::Error;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BASE_RECONNECT_DURATION: Duration = Duration::from_secs(3);
const DEFAULT_MAX_RECONNECT_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Explicit WebSocket address. When unset the address is synthesized from the page origin.
pub const URL_VAR: &str = "TRADING_WS_URL";
/// Comma-separated channels subscribed on every successful connection.
pub const CHANNELS_VAR: &str = "TRADING_WS_CHANNELS";
/// Heartbeat interval in milliseconds.
pub const HEARTBEAT_INTERVAL_VAR: &str = "TRADING_WS_HEARTBEAT_MS";
/// Base reconnect interval in milliseconds.
pub const RECONNECT_INTERVAL_VAR: &str = "TRADING_WS_RECONNECT_MS";
/// Maximum reconnect attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS_VAR: &str = "TRADING_WS_MAX_RECONNECT_ATTEMPTS";

/// Configuration for the realtime connection.
///
/// A config is immutable once handed to a [`crate::ws::ConnectionManager`]; build a new manager to
/// change it.
///
/// # Example
///
/// ```
/// use std::time::Duration;
///
/// use trading_realtime::ws::config::{Config, ReconnectConfig};
///
/// let config = Config::builder()
///     .url("wss://api.example.com/ws")
///     .channels(vec!["prices".to_owned(), "signals".to_owned()])
///     .reconnect(
///         ReconnectConfig::default()
///             .with_base_interval(Duration::from_secs(1))
///             .with_max_attempts(Some(5)),
///     )
///     .build();
///
/// assert_eq!(config.endpoint(), "wss://api.example.com/ws");
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Explicit target address (`ws://` or `wss://`)
    #[builder(into)]
    pub url: Option<String>,
    /// Page origin the address is derived from when `url` is unset
    #[builder(default)]
    pub origin: PageOrigin,
    /// Channels requested in the subscribe message sent on every open
    #[builder(default)]
    pub channels: Vec<String>,
    /// Interval between application-level `ping` messages. Zero disables the heartbeat.
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    pub heartbeat_interval: Duration,
    /// How long to wait for a `pong` before treating the socket as dead. `None` disables the
    /// check and relies on the transport's own close event.
    pub heartbeat_timeout: Option<Duration>,
    /// Upper bound on the opening handshake. `None` waits for the transport to fail on its own.
    pub connect_timeout: Option<Duration>,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    /// Build a config from `TRADING_WS_*` environment variables, falling back to defaults for
    /// anything unset.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup(URL_VAR).filter(|url| !url.trim().is_empty()) {
            config.url = Some(url.trim().to_owned());
        }

        if let Some(channels) = lookup(CHANNELS_VAR) {
            config.channels = channels
                .split(',')
                .map(str::trim)
                .filter(|channel| !channel.is_empty())
                .map(str::to_owned)
                .collect();
        }

        if let Some(millis) = parse_var::<u64, _>(&lookup, HEARTBEAT_INTERVAL_VAR)? {
            config.heartbeat_interval = Duration::from_millis(millis);
        }

        if let Some(millis) = parse_var::<u64, _>(&lookup, RECONNECT_INTERVAL_VAR)? {
            config.reconnect.base_interval = Duration::from_millis(millis);
        }

        if let Some(attempts) = parse_var::<u32, _>(&lookup, MAX_RECONNECT_ATTEMPTS_VAR)? {
            config.reconnect.max_attempts = Some(attempts);
        }

        if config.heartbeat_interval.is_zero() {
            return Err(Error::validation(format!(
                "{HEARTBEAT_INTERVAL_VAR} must be greater than zero"
            )));
        }

        Ok(config)
    }

    /// The address the connection manager dials.
    #[must_use]
    pub fn endpoint(&self) -> String {
        endpoint::resolve(self.url.as_deref(), &self.origin)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };

    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e| Error::validation(format!("{key}={raw:?} is not valid: {e}")))
}

/// Configuration for automatic reconnection behavior.
///
/// The delay before attempt `k` is `min(base_interval * 2^(k - 1), max_interval)`.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Delay before the first reconnection attempt
    pub base_interval: Duration,
    /// Ceiling for the reconnection delay
    pub max_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            base_interval: DEFAULT_BASE_RECONNECT_DURATION,
            max_interval: DEFAULT_MAX_RECONNECT_DURATION,
        }
    }
}

impl ReconnectConfig {
    /// Cap the number of consecutive reconnection attempts. `None` retries forever.
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_base_interval(mut self, base_interval: Duration) -> Self {
        self.base_interval = base_interval;
        self
    }

    #[must_use]
    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = max_interval;
        self
    }
}
