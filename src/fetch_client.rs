//! # Departure Data Transport
//!
//! One HTTP round-trip against the configured backend, returning the raw body.
//!
//! ## Backends
//!
//! - **Direct**: the upstream live departure board service. Responses are not
//!   trimmed and can be large, so the byte ceiling matters most here.
//! - **Filtered**: an intermediary that serves the same schema already cut down
//!   to the platforms the screens follow.
//!
//! The backend is picked once from configuration. A failing backend is never
//! swapped for the other one at runtime.
//!
//! ## Error Handling
//!
//! Every failure becomes a [`TransportError`]. Retry decisions are left to
//! [`crate::rail_data::ResilientFetcher`], which asks [`TransportError::is_retryable`].

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Ways a single fetch can fail.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No complete response within the request timeout
    #[error("request timed out")]
    Timeout,

    /// Could not connect, or the connection dropped mid-response
    #[error("connection refused or reset")]
    ConnectionRefused,

    #[error("bad HTTP status {0}")]
    BadStatus(u16),

    /// Body exceeded the byte ceiling; the read was abandoned
    #[error("response larger than {limit} bytes")]
    TooLarge { limit: usize },

    /// The request could not be built (bad URL or header)
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl TransportError {
    /// Timeouts, connection failures and 5xx responses are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Timeout | TransportError::ConnectionRefused => true,
            TransportError::BadStatus(code) => (500..600).contains(code),
            TransportError::TooLarge { .. } | TransportError::InvalidRequest(_) => false,
        }
    }
}

/// What to ask the backend for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// Station code, e.g. "EUS"
    pub station: String,
    /// Platforms the screens follow; empty means all
    pub platforms: Vec<String>,
    /// Result count requested from the direct backend
    pub num_rows: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Direct { base_url: String },
    Filtered { base_url: String },
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Direct { .. } => "direct",
            Backend::Filtered { .. } => "filtered",
        }
    }

    /// Full request URL for `query`.
    pub fn request_url(&self, query: &Query) -> String {
        match self {
            Backend::Direct { base_url } => format!(
                "{}/{}?numRows={}",
                base_url.trim_end_matches('/'),
                query.station,
                query.num_rows
            ),
            Backend::Filtered { base_url } => {
                let mut url = format!("{}/{}", base_url.trim_end_matches('/'), query.station);
                if !query.platforms.is_empty() {
                    url.push_str("?platforms=");
                    url.push_str(&query.platforms.join(","));
                }
                url
            }
        }
    }
}

/// The fetch capability the retry layer is written against.
pub trait Fetch {
    fn fetch(&mut self, query: &Query) -> impl Future<Output = Result<Vec<u8>, TransportError>>;
}

/// HTTP client bound to one backend and one response ceiling.
pub struct FetchClient {
    http: reqwest::Client,
    backend: Backend,
    api_key: Option<String>,
    max_bytes: usize,
}

impl FetchClient {
    pub fn new(
        backend: Backend,
        api_key: Option<String>,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .user_agent(concat!("departure-board/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

        Ok(Self {
            http,
            backend,
            api_key,
            max_bytes,
        })
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    async fn get(&self, query: &Query) -> Result<Vec<u8>, TransportError> {
        let url = self.backend.request_url(query);
        debug!(url = %url, backend = self.backend.name(), "Requesting departures");

        let mut request = self.http.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("x-apikey", key);
        }

        let mut response = request.send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::BadStatus(status.as_u16()));
        }

        // Refuse early when the server announces an oversized body
        if let Some(length) = response.content_length() {
            if length > self.max_bytes as u64 {
                return Err(TransportError::TooLarge {
                    limit: self.max_bytes,
                });
            }
        }

        read_capped(&mut response, self.max_bytes).await
    }
}

impl Fetch for FetchClient {
    async fn fetch(&mut self, query: &Query) -> Result<Vec<u8>, TransportError> {
        self.get(query).await
    }
}

/// Reads the body chunk by chunk, giving up as soon as `limit` would be passed.
async fn read_capped(
    response: &mut reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, TransportError> {
    let mut body = Vec::with_capacity(limit.min(16 * 1024));
    while let Some(chunk) = response.chunk().await.map_err(classify)? {
        if body.len() + chunk.len() > limit {
            return Err(TransportError::TooLarge { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Maps reqwest's error onto the transport kinds the retry policy knows.
///
/// Anything that is neither a timeout nor a malformed request is a network
/// level failure (refused, reset, DNS, TLS) and is reported as `ConnectionRefused`.
fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_builder() {
        TransportError::InvalidRequest(err.to_string())
    } else {
        debug!(error = %err, "Network failure");
        TransportError::ConnectionRefused
    }
}
