//! HTTP transport for the agent panel.
//!
//! The transport is deliberately stateless: the caller passes the cookie
//! jar on every request and gets back whatever cookies the panel set, so
//! the session layer stays the single owner of cookie state.

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Browser-like user agent presented on every panel request. The panel
/// serves a challenge page to clients it does not recognize.
pub const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 6.0.1; SM-G532F) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/106.0.5249.126 Mobile Safari/537.36";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from talking to the panel over HTTP
#[derive(Error, Debug)]
pub enum TransportError {
    /// Request construction, connection or body read failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The configured origin does not form valid header values
    #[error("invalid header value: {0}")]
    Header(#[from] reqwest::header::InvalidHeaderValue),
}

/// A panel response reduced to what the classification layer needs.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
    /// Cookies the panel set on this response
    pub cookies: HashMap<String, String>,
}

/// Seam between the API client and the network.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Posts a JSON payload to a panel path, sending the given cookies.
    ///
    /// # Errors
    ///
    /// Returns an error when the request cannot be sent or the body
    /// cannot be read. Non-2xx statuses are not errors; the caller
    /// classifies them.
    async fn post_json(
        &self,
        path: String,
        payload: Value,
        cookies: HashMap<String, String>,
    ) -> Result<RawResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest` client with the panel's
/// expected browser headers.
pub struct HttpTransport {
    client: reqwest::Client,
    origin: String,
}

impl HttpTransport {
    /// Builds a client that presents the panel's expected `User-Agent`,
    /// `Origin` and `Referer` headers on every request.
    ///
    /// # Errors
    ///
    /// Returns an error when the origin cannot be encoded into headers
    /// or the underlying client cannot be constructed.
    pub fn new(origin: &str) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        headers.insert(header::ORIGIN, HeaderValue::from_str(origin)?);
        headers.insert(
            header::REFERER,
            HeaderValue::from_str(&format!("{origin}/dashboard"))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            client,
            origin: origin.to_string(),
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(
        &self,
        path: String,
        payload: Value,
        cookies: HashMap<String, String>,
    ) -> Result<RawResponse, TransportError> {
        let url = format!("{}{path}", self.origin);
        let mut request = self.client.post(&url).json(&payload);
        if !cookies.is_empty() {
            request = request.header(header::COOKIE, render_cookie_header(&cookies));
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let set_cookies: HashMap<String, String> = response
            .cookies()
            .map(|c| (c.name().to_string(), c.value().to_string()))
            .collect();
        let body = response.text().await?;

        Ok(RawResponse {
            status,
            body,
            cookies: set_cookies,
        })
    }
}

fn render_cookie_header(cookies: &HashMap<String, String>) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}
