//! Log Sink - dry-run destination.
//!
//! The [`LogSink`] logs every payload through `tracing` instead of posting
//! it anywhere. Every destination resolves, every post "succeeds" with a
//! fresh UUID handle. Useful for trying a configuration without touching a
//! real channel.

use super::{DestinationSink, MessageHandle, SinkError};
use crate::render::NotificationPayload;
use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct LogSink {
    /// Prefix for log messages
    prefix: String,
}

impl LogSink {
    pub fn new() -> Self {
        Self {
            prefix: "dry-run".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DestinationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn resolve(&self, _destination: &str) -> Result<bool, SinkError> {
        Ok(true)
    }

    async fn post(
        &self,
        destination: &str,
        payload: &NotificationPayload,
    ) -> Result<MessageHandle, SinkError> {
        let handle = MessageHandle::new(Uuid::new_v4().to_string());

        info!(
            prefix = %self.prefix,
            destination = %destination,
            handle = %handle,
            title = %payload.title,
            body = %payload.body,
            "[{}] Would post '{}' to {}",
            self.prefix,
            payload.title,
            destination
        );

        Ok(handle)
    }

    async fn delete(&self, destination: &str, handle: &MessageHandle) -> Result<(), SinkError> {
        info!(
            prefix = %self.prefix,
            destination = %destination,
            handle = %handle,
            "[{}] Would delete {} from {}",
            self.prefix,
            handle,
            destination
        );
        Ok(())
    }
}
