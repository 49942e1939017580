//! Discord sinks.
//!
//! Two flavors share one HTTP core:
//!
//! - [`DiscordBotSink`]: destination id is a channel id, requests go to the
//!   bot REST API with `Authorization: Bot <token>`.
//! - [`DiscordWebhookSink`]: destination id is a full webhook URL.
//!
//! Both render a [`NotificationPayload`] as a single embed and retry on 429
//! (honoring `Retry-After`). Lookups and deletes also retry on 5xx and
//! transport errors. Posts do not: Discord may have created the message
//! before failing, and a second attempt would leave an unrecorded copy.
//!
//! # Example
//!
//! ```rust,ignore
//! use beacon::sink::DiscordBotSink;
//! use std::time::Duration;
//!
//! let sink = DiscordBotSink::new(token)
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retries(2);
//! ```

use super::{DestinationSink, MessageHandle, SinkError};
use crate::render::NotificationPayload;
use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Discord REST API base
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Default timeout for Discord requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries on 429 and 5xx
const DEFAULT_RETRIES: u32 = 3;

/// Wait used when a 429 carries no usable retry header
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Build the Discord message body for a payload.
pub fn build_embed_message(payload: &NotificationPayload) -> Value {
    let mut embed = json!({
        "description": payload.body,
        "color": payload.accent_color,
    });

    if let Some(url) = &payload.thumbnail_url {
        embed["thumbnail"] = json!({ "url": url });
    }

    json!({ "embeds": [embed] })
}

/// Parse the wait from a 429 response.
fn retry_after(response: &Response) -> Option<Duration> {
    ["Retry-After", "X-RateLimit-Reset-After"]
        .iter()
        .filter_map(|name| response.headers().get(*name))
        .filter_map(|value| value.to_str().ok()?.parse::<f64>().ok())
        .find(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

/// Shared HTTP plumbing with rate-limit aware retries.
#[derive(Debug, Clone)]
struct DiscordHttp {
    client: Client,
    authorization: Option<String>,
    timeout: Duration,
    retries: u32,
}

impl DiscordHttp {
    fn new(authorization: Option<String>) -> Self {
        Self {
            client: Client::new(),
            authorization,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Send a request, retrying 429. Requests other than POST also retry 5xx
    /// and transport errors. Any other status is returned to the caller for
    /// interpretation.
    async fn send(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        body: Option<&Value>,
    ) -> Result<Response, SinkError> {
        let mut attempts = 0;
        let idempotent = method != Method::POST;

        loop {
            attempts += 1;

            let mut request = self
                .client
                .request(method.clone(), url)
                .timeout(self.timeout)
                .query(query);
            if let Some(auth) = &self.authorization {
                request = request.header(reqwest::header::AUTHORIZATION, auth);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if idempotent && attempts <= self.retries => {
                    warn!(error = %e, method = %method, attempt = attempts, "Discord request failed, retrying");
                    continue;
                }
                Err(e) => return Err(SinkError::Http(e)),
            };

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempts > self.retries {
                    warn!(attempts, method = %method, "Discord rate limit: giving up");
                    return Err(SinkError::RateLimited(attempts));
                }
                let wait = retry_after(&response).unwrap_or(DEFAULT_RETRY_AFTER);
                debug!(
                    wait_ms = wait.as_millis() as u64,
                    attempt = attempts,
                    "Discord rate limited (429), waiting before retry"
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            if status.is_server_error() && idempotent && attempts <= self.retries {
                warn!(status = %status, method = %method, attempt = attempts, "Discord server error, retrying");
                continue;
            }

            return Ok(response);
        }
    }
}

/// Turn a non-success response into a [`SinkError::Status`].
async fn status_error(response: Response) -> SinkError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    SinkError::Status { status, body }
}

/// Pull the message id out of a create-message response.
async fn message_handle(response: Response) -> Result<MessageHandle, SinkError> {
    if !response.status().is_success() {
        return Err(status_error(response).await);
    }

    let body: Value = response.json().await?;
    body.get("id")
        .and_then(Value::as_str)
        .map(MessageHandle::new)
        .ok_or(SinkError::MissingHandle)
}

/// Posts to Discord channels through the bot API.
#[derive(Debug, Clone)]
pub struct DiscordBotSink {
    http: DiscordHttp,
    api_base: String,
}

impl DiscordBotSink {
    pub fn new(token: impl AsRef<str>) -> Self {
        Self {
            http: DiscordHttp::new(Some(format!("Bot {}", token.as_ref()))),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.http.retries = retries;
        self
    }

    fn channel_url(&self, channel: &str) -> String {
        format!("{}/channels/{}", self.api_base, channel)
    }
}

#[async_trait]
impl DestinationSink for DiscordBotSink {
    fn name(&self) -> &str {
        "discord"
    }

    async fn resolve(&self, destination: &str) -> Result<bool, SinkError> {
        let response = self
            .http
            .send(Method::GET, &self.channel_url(destination), &[], None)
            .await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(false),
            _ => Err(status_error(response).await),
        }
    }

    async fn post(
        &self,
        destination: &str,
        payload: &NotificationPayload,
    ) -> Result<MessageHandle, SinkError> {
        let url = format!("{}/messages", self.channel_url(destination));
        let body = build_embed_message(payload);
        let response = self.http.send(Method::POST, &url, &[], Some(&body)).await?;
        message_handle(response).await
    }

    async fn delete(&self, destination: &str, handle: &MessageHandle) -> Result<(), SinkError> {
        let url = format!("{}/messages/{}", self.channel_url(destination), handle);
        let response = self.http.send(Method::DELETE, &url, &[], None).await?;

        match response.status() {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(destination = %destination, handle = %handle, "Message already gone");
                Ok(())
            }
            _ => Err(status_error(response).await),
        }
    }
}

/// Posts through Discord webhooks. The destination id is the webhook URL.
#[derive(Debug, Clone)]
pub struct DiscordWebhookSink {
    http: DiscordHttp,
}

impl Default for DiscordWebhookSink {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscordWebhookSink {
    pub fn new() -> Self {
        Self {
            http: DiscordHttp::new(None),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.http.retries = retries;
        self
    }
}

#[async_trait]
impl DestinationSink for DiscordWebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn resolve(&self, destination: &str) -> Result<bool, SinkError> {
        let response = self.http.send(Method::GET, destination, &[], None).await?;

        match response.status() {
            s if s.is_success() => Ok(true),
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(false),
            _ => Err(status_error(response).await),
        }
    }

    async fn post(
        &self,
        destination: &str,
        payload: &NotificationPayload,
    ) -> Result<MessageHandle, SinkError> {
        let body = build_embed_message(payload);
        let response = self
            .http
            .send(Method::POST, destination, &[("wait", "true")], Some(&body))
            .await?;
        message_handle(response).await
    }

    async fn delete(&self, destination: &str, handle: &MessageHandle) -> Result<(), SinkError> {
        let url = format!("{}/messages/{}", destination.trim_end_matches('/'), handle);
        let response = self.http.send(Method::DELETE, &url, &[], None).await?;

        match response.status() {
            s if s.is_success() || s == StatusCode::NOT_FOUND => Ok(()),
            _ => Err(status_error(response).await),
        }
    }
}
