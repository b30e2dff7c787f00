//! Bearer tokens for the realtime socket and the REST backend.
//!
//! A [`TokenStore`] is shared between the [`crate::ws::ConnectionManager`], which appends the
//! current access token to every connection attempt, and the [`AuthClient`], which swaps in fresh
//! tokens on refresh.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use reqwest::header::HeaderValue;
/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Result;
use crate::error::Error;

const REFRESH_PATH: &str = "api/v1/auth/refresh";

fn default_token_type() -> String {
    "bearer".to_owned()
}

/// Access and refresh token as issued by the backend.
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct TokenPair {
    pub access_token: SecretString,
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Access token lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl TokenPair {
    #[must_use]
    pub fn new<S: Into<String>>(access_token: S, refresh_token: Option<S>) -> Self {
        Self {
            access_token: SecretString::from(access_token.into()),
            refresh_token: refresh_token.map(|token| SecretString::from(token.into())),
            token_type: default_token_type(),
            expires_in: None,
        }
    }
}

/// Thread-safe holder of the current [`TokenPair`]. Clones share the same tokens.
#[derive(Clone, Default)]
pub struct TokenStore {
    inner: Arc<RwLock<Option<TokenPair>>>,
}

impl fmt::Debug for TokenStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("has_tokens", &self.get().is_some())
            .finish()
    }
}

// Readers and writers swap whole values, so a poisoned lock never holds a partial update.
impl TokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tokens(tokens: TokenPair) -> Self {
        let store = Self::new();
        store.set(tokens);
        store
    }

    pub fn set(&self, tokens: TokenPair) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(tokens);
    }

    #[must_use]
    pub fn get(&self) -> Option<TokenPair> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    #[must_use]
    pub fn access_token(&self) -> Option<SecretString> {
        self.get().map(|tokens| tokens.access_token)
    }

    #[must_use]
    pub fn refresh_token(&self) -> Option<SecretString> {
        self.get().and_then(|tokens| tokens.refresh_token)
    }

    /// `Authorization` header value for the current access token, marked sensitive.
    pub fn bearer_header(&self) -> Result<Option<HeaderValue>> {
        let Some(token) = self.access_token() else {
            return Ok(None);
        };

        let mut value = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))?;
        value.set_sensitive(true);
        Ok(Some(value))
    }
}

#[derive(Serialize)]
struct RefreshRequest<'token> {
    refresh_token: &'token str,
}

/// Client for the backend's token endpoints.
#[derive(Clone, Debug)]
pub struct AuthClient {
    host: Url,
    client: reqwest::Client,
    tokens: TokenStore,
}

impl AuthClient {
    /// Create a client for the backend at `host` (e.g. `https://api.example.com`).
    pub fn new(host: &str, tokens: TokenStore) -> Result<Self> {
        Ok(Self {
            host: Url::parse(host)?,
            client: reqwest::Client::new(),
            tokens,
        })
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenStore {
        &self.tokens
    }

    /// Exchange the stored refresh token for a new token pair and store it.
    ///
    /// When the response omits a refresh token the current one is kept.
    pub async fn refresh(&self) -> Result<TokenPair> {
        let Some(refresh_token) = self.tokens.refresh_token() else {
            return Err(Error::validation(
                "Unable to refresh: no refresh token stored",
            ));
        };

        let request = self
            .client
            .post(self.host.join(REFRESH_PATH)?)
            .json(&RefreshRequest {
                refresh_token: refresh_token.expose_secret(),
            })
            .build()?;

        let mut tokens: TokenPair = crate::request(&self.client, request).await?;
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token);
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Access token refreshed");

        self.tokens.set(tokens.clone());
        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_round_trips_tokens() {
        let store = TokenStore::new();
        assert!(store.access_token().is_none(), "new store should be empty");

        store.set(TokenPair::new("access", Some("refresh")));

        assert_eq!(store.access_token().unwrap().expose_secret(), "access");
        assert_eq!(store.refresh_token().unwrap().expose_secret(), "refresh");

        store.clear();

        assert!(store.get().is_none(), "cleared store should be empty");
    }

    #[test]
    fn clones_share_tokens() {
        let store = TokenStore::new();
        let clone = store.clone();

        clone.set(TokenPair::new("shared", None));

        assert_eq!(store.access_token().unwrap().expose_secret(), "shared");
    }

    #[test]
    fn bearer_header_is_sensitive() {
        let store = TokenStore::with_tokens(TokenPair::new("abc", None));

        let header = store.bearer_header().unwrap().unwrap();

        assert_eq!(header.to_str().unwrap(), "Bearer abc");
        assert!(header.is_sensitive(), "token header should be sensitive");
        assert!(TokenStore::new().bearer_header().unwrap().is_none(), "no token, no header");
    }

    #[test]
    fn debug_output_redacts_tokens() {
        let store = TokenStore::with_tokens(TokenPair::new("super-secret", Some("also-secret")));

        let debug = format!("{store:?} {:?}", store.get().unwrap());

        assert!(!debug.contains("super-secret"), "access token leaked: {debug}");
        assert!(!debug.contains("also-secret"), "refresh token leaked: {debug}");
    }

    #[test]
    fn token_pair_deserializes_backend_response() {
        let tokens: TokenPair = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","token_type":"bearer","expires_in":1800,"user":{"id":"u"}}"#,
        )
        .unwrap();

        assert_eq!(tokens.access_token.expose_secret(), "a");
        assert_eq!(tokens.expires_in, Some(1800));
    }
}
