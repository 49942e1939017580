//! Notification rendering.
//!
//! [`Renderer::render`] turns an [`Event`] into a destination-agnostic
//! [`NotificationPayload`]. Rendering is infallible: a missing optional
//! field becomes a placeholder, never an error.

use crate::event::Event;
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use std::fmt;

/// Embed accent used for event notifications
pub const DEFAULT_ACCENT_COLOR: u32 = 0x00b0f4;

/// Shown when a timestamp is unavailable
const NO_DATE: &str = "No date";

/// Shown when the event carries no region
const UNKNOWN_REGION: &str = "UNKNOWN";

const SEPARATOR: &str = "━━━━━━━━━━━━━━━━━━";

/// A rendered notification, ready for any sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    /// Plain event title (the body carries the formatted one)
    pub title: String,

    /// Markdown body
    pub body: String,

    pub accent_color: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// Time remaining until an event ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaysLeft {
    Ended,
    EndsToday,
    Days(i64),
}

impl DaysLeft {
    /// Classify `end_at - now`.
    ///
    /// Non-positive is `Ended`, under one day is `EndsToday`, otherwise the
    /// whole number of days remaining (rounded down).
    pub fn between(end_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let remaining = end_at - now;
        if remaining <= Duration::zero() {
            DaysLeft::Ended
        } else if remaining < Duration::days(1) {
            DaysLeft::EndsToday
        } else {
            DaysLeft::Days(remaining.num_days())
        }
    }
}

impl fmt::Display for DaysLeft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaysLeft::Ended => f.write_str("Ended"),
            DaysLeft::EndsToday => f.write_str("Ends today"),
            DaysLeft::Days(n) => write!(f, "{} days left", n),
        }
    }
}

/// Label for a fixed offset, e.g. `UTC+8`, `UTC-3`, `UTC+5:30`.
pub fn offset_label(offset: &FixedOffset) -> String {
    let secs = offset.local_minus_utc();
    if secs == 0 {
        return "UTC".to_string();
    }

    let sign = if secs < 0 { '-' } else { '+' };
    let hours = secs.abs() / 3600;
    let minutes = (secs.abs() % 3600) / 60;

    if minutes == 0 {
        format!("UTC{}{}", sign, hours)
    } else {
        format!("UTC{}{}:{:02}", sign, hours, minutes)
    }
}

#[derive(Debug, Clone)]
pub struct Renderer {
    display_offset: FixedOffset,
    accent_color: u32,
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new(crate::default_display_offset())
    }
}

impl Renderer {
    pub fn new(display_offset: FixedOffset) -> Self {
        Self {
            display_offset,
            accent_color: DEFAULT_ACCENT_COLOR,
        }
    }

    pub fn with_accent_color(mut self, color: u32) -> Self {
        self.accent_color = color;
        self
    }

    fn format_time(&self, instant: Option<DateTime<Utc>>) -> String {
        match instant {
            Some(instant) => format!(
                "{} {}",
                instant
                    .with_timezone(&self.display_offset)
                    .format("%Y-%m-%d %H:%M"),
                offset_label(&self.display_offset)
            ),
            None => NO_DATE.to_string(),
        }
    }

    /// Render an event as of `now`.
    pub fn render(&self, event: &Event, now: DateTime<Utc>) -> NotificationPayload {
        let heading = match &event.link {
            Some(link) => format!("**[{}]({})**", event.title, link),
            None => format!("**{}**", event.title),
        };
        let region = event
            .region
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| UNKNOWN_REGION.to_string());

        let body = format!(
            "🗓️ {heading}\n\
             {SEPARATOR}\n\
             📅 **Start:** {start}\n\
             ⏰ **End:** {end}\n\
             ⏳ **{days}**\n\
             🌏 **Region:** {region}\n",
            start = self.format_time(event.created_at),
            end = self.format_time(Some(event.end_at)),
            days = DaysLeft::between(event.end_at, now),
        );

        NotificationPayload {
            title: event.title.clone(),
            body,
            accent_color: self.accent_color,
            thumbnail_url: event.image_url.clone(),
        }
    }
}
