#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod error;
pub mod events;
pub mod ws;

use reqwest::{Request, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Execute `request` and deserialize a successful JSON body into `Response`.
///
/// Non-2xx responses become [`error::Kind::Status`] errors carrying the response text.
#[cfg_attr(
    feature = "tracing",
    tracing::instrument(
        level = "debug",
        skip(client, request),
        fields(
            method = %request.method(),
            path = request.url().path(),
            status_code
        )
    )
)]
pub(crate) async fn request<Response: DeserializeOwned>(
    client: &reqwest::Client,
    request: Request,
) -> Result<Response> {
    let method = request.method().clone();
    let path = request.url().path().to_owned();

    let response = client.execute(request).await?;
    let status_code = response.status();

    #[cfg(feature = "tracing")]
    tracing::Span::current().record("status_code", status_code.as_u16());

    if !status_code.is_success() {
        let message = response.text().await.unwrap_or_default();

        #[cfg(feature = "tracing")]
        tracing::warn!(
            status = %status_code,
            method = %method,
            path = %path,
            message = %message,
            "API request failed"
        );

        return Err(Error::status(status_code, method, path, message));
    }

    if status_code == StatusCode::NO_CONTENT {
        #[cfg(feature = "tracing")]
        tracing::warn!(method = %method, path = %path, "API response has no body");
        return Err(Error::status(
            StatusCode::NO_CONTENT,
            method,
            path,
            "Expected a JSON body",
        ));
    }

    Ok(response.json::<Response>().await?)
}
