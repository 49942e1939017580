//! Event source client.
//!
//! The [`EventSource`] trait is the seam the synchronizer fetches through.
//! [`HttpEventSource`] is the production implementation: a single GET with
//! browser-like headers, no retries. A failed fetch aborts the cycle.
//!
//! # Example
//!
//! ```rust,ignore
//! use beacon::source::HttpEventSource;
//! use std::time::Duration;
//!
//! let source = HttpEventSource::new("https://api.example.com/api/events?region=asia")
//!     .with_timeout(Duration::from_secs(30))
//!     .with_referer("https://example.com/");
//! ```

use crate::event::RawEvent;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, REFERER};
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default timeout for the events request
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Desktop Chrome user agent; the upstream blocks obvious bots
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Errors that can occur while fetching events.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Transport failure (DNS, TLS, timeout, connection reset)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The API answered with a non-success status
    #[error("events API returned status {0}")]
    Status(u16),

    /// The body was not a JSON array of events
    #[error("could not parse events response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Something that can produce the current list of raw events.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Fetch every event the source currently knows about, in source order.
    async fn fetch(&self) -> Result<Vec<RawEvent>, FetchError>;
}

/// Fetches events from an HTTP JSON API.
#[derive(Debug, Clone)]
pub struct HttpEventSource {
    url: String,
    client: Client,
    timeout: Duration,
    user_agent: String,
    referer: Option<String>,
    origin: Option<String>,
}

impl HttpEventSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            referer: None,
            origin: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/plain, */*"),
        );
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));

        for (name, value) in [(REFERER, &self.referer), (ORIGIN, &self.origin)] {
            if let Some(value) = value {
                match HeaderValue::from_str(value) {
                    Ok(v) => {
                        headers.insert(name, v);
                    }
                    Err(_) => warn!(header = %name, "Ignoring invalid header value"),
                }
            }
        }

        headers
    }
}

#[async_trait]
impl EventSource for HttpEventSource {
    async fn fetch(&self) -> Result<Vec<RawEvent>, FetchError> {
        debug!(url = %self.url, "Fetching events");

        let response = self
            .client
            .get(&self.url)
            .timeout(self.timeout)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .headers(self.headers())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, status = %status, "Events API returned error status");
            return Err(FetchError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        let events: Vec<RawEvent> = serde_json::from_str(&body)?;

        info!(url = %self.url, count = events.len(), "Fetched events");
        Ok(events)
    }
}
