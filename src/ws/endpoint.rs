//! WebSocket address resolution.

use secrecy::{ExposeSecret as _, SecretString};
use url::Url;

/// Port appended to a page host that does not carry one.
pub const DEFAULT_PORT: u16 = 8000;
/// Path of the realtime endpoint on the backend.
pub const WS_PATH: &str = "/ws";
/// Query parameter carrying the bearer token on protected sockets.
pub const TOKEN_PARAM: &str = "token";

/// Origin of the page (or process) that hosts the client.
///
/// Used to synthesize the WebSocket address when none is configured: `wss` when the page is
/// served over TLS, `ws` otherwise.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOrigin {
    /// Whether the page was served over TLS
    pub secure: bool,
    /// Host name, optionally with a `:port` suffix
    pub host: String,
}

impl Default for PageOrigin {
    fn default() -> Self {
        Self::new(false, "localhost")
    }
}

impl PageOrigin {
    #[must_use]
    pub fn new<S: Into<String>>(secure: bool, host: S) -> Self {
        Self {
            secure,
            host: host.into(),
        }
    }

    /// Derive the origin from a page URL such as `https://app.example.com/dashboard`.
    #[must_use]
    pub fn from_page_url(page: &Url) -> Option<Self> {
        let host = page.host_str()?;
        let host = match page.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };

        Some(Self::new(page.scheme() == "https", host))
    }

    fn has_port(&self) -> bool {
        // Bracketed IPv6 literals contain colons of their own.
        if self.host.starts_with('[') {
            self.host.contains("]:")
        } else {
            self.host.contains(':')
        }
    }

    /// The realtime endpoint served next to this origin.
    #[must_use]
    pub fn ws_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        if self.has_port() {
            format!("{scheme}://{}{WS_PATH}", self.host)
        } else {
            format!("{scheme}://{}:{DEFAULT_PORT}{WS_PATH}", self.host)
        }
    }
}

/// Pick the configured address when present, otherwise synthesize one from `origin`.
///
/// The configured address is returned verbatim even when it does not parse: a malformed address
/// fails at connect time and goes through the regular reconnect path.
#[must_use]
pub fn resolve(configured: Option<&str>, origin: &PageOrigin) -> String {
    match configured.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => url.to_owned(),
        None => origin.ws_url(),
    }
}

/// Append the bearer token as a query parameter. Unparseable endpoints are left untouched.
#[must_use]
pub(crate) fn with_token(endpoint: &str, token: &SecretString) -> String {
    match Url::parse(endpoint) {
        Ok(mut url) => {
            url.query_pairs_mut()
                .append_pair(TOKEN_PARAM, token.expose_secret());
            url.into()
        }
        Err(_) => endpoint.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_address_wins() {
        let origin = PageOrigin::new(true, "app.example.com");

        assert_eq!(
            resolve(Some("ws://10.0.0.5:9000/stream"), &origin),
            "ws://10.0.0.5:9000/stream"
        );
    }

    #[test]
    fn insecure_origin_gets_fallback_port() {
        let origin = PageOrigin::new(false, "localhost");

        assert_eq!(resolve(None, &origin), "ws://localhost:8000/ws");
    }

    #[test]
    fn secure_origin_uses_wss() {
        let origin = PageOrigin::new(true, "app.example.com");

        assert_eq!(resolve(Some("   "), &origin), "wss://app.example.com:8000/ws");
    }

    #[test]
    fn origin_port_is_kept() {
        assert_eq!(
            PageOrigin::new(false, "localhost:3000").ws_url(),
            "ws://localhost:3000/ws"
        );
        assert_eq!(PageOrigin::new(false, "[::1]").ws_url(), "ws://[::1]:8000/ws");
        assert_eq!(
            PageOrigin::new(false, "[::1]:3000").ws_url(),
            "ws://[::1]:3000/ws"
        );
    }

    #[test]
    fn origin_from_page_url() {
        let page = Url::parse("https://app.example.com/dashboard?tab=positions").unwrap();
        let origin = PageOrigin::from_page_url(&page).unwrap();

        assert_eq!(origin, PageOrigin::new(true, "app.example.com"));

        let page = Url::parse("http://127.0.0.1:3000/").unwrap();
        let origin = PageOrigin::from_page_url(&page).unwrap();

        assert_eq!(origin.ws_url(), "ws://127.0.0.1:3000/ws");
    }

    #[test]
    fn token_is_appended_as_query() {
        let token = SecretString::from("abc.def");

        assert_eq!(
            with_token("ws://localhost:8000/ws?v=1", &token),
            "ws://localhost:8000/ws?v=1&token=abc.def"
        );
        assert_eq!(with_token("not a url", &token), "not a url");
    }
}
