//! Destination sinks.
//!
//! A sink is how the synchronizer talks to the platform notifications are
//! posted on. The [`DestinationSink`] trait is the whole contract: resolve a
//! destination, post a payload, delete a previously posted message.
//!
//! ## Built-in Sinks
//!
//! - [`DiscordBotSink`]: Discord channels through the bot REST API
//! - [`DiscordWebhookSink`]: Discord webhooks, destination id is the webhook URL
//! - [`LogSink`]: dry run, logs payloads instead of posting them
//!
//! ## Creating Custom Sinks
//!
//! ```rust,ignore
//! use beacon::sink::{DestinationSink, MessageHandle, SinkError};
//! use beacon::render::NotificationPayload;
//! use async_trait::async_trait;
//!
//! struct MySink;
//!
//! #[async_trait]
//! impl DestinationSink for MySink {
//!     fn name(&self) -> &str {
//!         "my-sink"
//!     }
//!
//!     async fn resolve(&self, destination: &str) -> Result<bool, SinkError> {
//!         Ok(true)
//!     }
//!
//!     async fn post(
//!         &self,
//!         destination: &str,
//!         payload: &NotificationPayload,
//!     ) -> Result<MessageHandle, SinkError> {
//!         Ok(MessageHandle::new("1"))
//!     }
//!
//!     async fn delete(&self, destination: &str, handle: &MessageHandle) -> Result<(), SinkError> {
//!         Ok(())
//!     }
//! }
//! ```

pub mod discord;
pub mod log;

use crate::render::NotificationPayload;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use discord::{DiscordBotSink, DiscordWebhookSink};
pub use log::LogSink;

/// Errors a sink can report.
#[derive(Error, Debug)]
pub enum SinkError {
    /// HTTP transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The platform rejected the request
    #[error("platform returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// Still rate limited after all retries
    #[error("rate limited after {0} attempts")]
    RateLimited(u32),

    /// A post succeeded but the response carried no message id
    #[error("response did not include a message id")]
    MissingHandle,

    /// Generic sink failure
    #[error("sink failed: {0}")]
    Failed(String),
}

/// Opaque id of a posted message, needed to delete it later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageHandle(String);

impl MessageHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The platform notifications are posted to.
///
/// Implementations must be `Send + Sync`; the synchronizer calls them from
/// concurrent per-destination tasks.
#[async_trait]
pub trait DestinationSink: Send + Sync {
    /// Short name for logs (e.g. "discord", "log")
    fn name(&self) -> &str;

    /// Check whether a destination still exists and is reachable.
    ///
    /// * `Ok(true)` - present
    /// * `Ok(false)` - gone or inaccessible
    /// * `Err(_)` - could not tell (transient failure)
    async fn resolve(&self, destination: &str) -> Result<bool, SinkError>;

    /// Post a notification and return its handle.
    async fn post(
        &self,
        destination: &str,
        payload: &NotificationPayload,
    ) -> Result<MessageHandle, SinkError>;

    /// Delete a previously posted notification.
    ///
    /// Deleting a message that is already gone should return `Ok(())`.
    async fn delete(&self, destination: &str, handle: &MessageHandle) -> Result<(), SinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_serializes_as_string() {
        let handle = MessageHandle::new("1385559078801244180");
        assert_eq!(
            serde_json::to_string(&handle).unwrap(),
            "\"1385559078801244180\""
        );
        assert_eq!(handle.to_string(), "1385559078801244180");

        let back: MessageHandle = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(back.as_str(), "42");
    }
}
