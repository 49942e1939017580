//! Core event types for Beacon.
//!
//! A [`RawEvent`] is one record exactly as the events API returns it. The
//! normalizer turns it into an [`Event`], which is what the renderer works
//! with. Both are rebuilt from scratch every synchronization cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Strings the events API uses in place of a real value.
const MISSING_SENTINELS: [&str; 2] = ["null", "None"];

/// One event record as returned by the events API.
///
/// Every field is optional: the upstream is loosely typed and a record with
/// junk in one field must not break deserialization of the whole response.
///
/// # Example
///
/// ```json
/// {
///   "title": "Siege",
///   "created_at": "2025-12-01T03:00:00.000Z",
///   "end_at": "2026-01-10T00:00:00.000Z",
///   "region": "asia",
///   "link": "https://example.com/events/siege",
///   "img": "https://example.com/img/siege.png"
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RawEvent {
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub created_at: Option<String>,

    #[serde(default)]
    pub end_at: Option<String>,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub link: Option<String>,

    #[serde(default)]
    pub img: Option<String>,
}

impl RawEvent {
    /// Create a record with only a title set
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }

    pub fn with_created_at(mut self, created_at: impl Into<String>) -> Self {
        self.created_at = Some(created_at.into());
        self
    }

    pub fn with_end_at(mut self, end_at: impl Into<String>) -> Self {
        self.end_at = Some(end_at.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn with_img(mut self, img: impl Into<String>) -> Self {
        self.img = Some(img.into());
        self
    }

    /// Title for log lines, even when the record has none.
    pub fn display_title(&self) -> &str {
        present(&self.title).unwrap_or("<untitled>")
    }
}

/// Returns the trimmed value unless it is absent, empty or a null sentinel.
pub(crate) fn present(value: &Option<String>) -> Option<&str> {
    let value = value.as_deref()?.trim();
    if value.is_empty() || MISSING_SENTINELS.contains(&value) {
        None
    } else {
        Some(value)
    }
}

/// A validated, displayable event.
///
/// Timestamps are kept as UTC instants; shifting to the display timezone
/// happens only when rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Display title, also used as the key in logs
    pub title: String,

    /// When the source created the event, if it said so
    pub created_at: Option<DateTime<Utc>>,

    /// When the event ends
    pub end_at: DateTime<Utc>,

    pub region: Option<String>,

    pub link: Option<String>,

    pub image_url: Option<String>,
}
