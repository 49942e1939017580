//! Event filter and normalizer.
//!
//! Turns [`RawEvent`]s into displayable [`Event`]s. Rejection rules, first
//! match wins:
//!
//! 1. `end_at` missing, a null sentinel, or not a valid RFC 3339 instant.
//! 2. `end_at` falls on the configured excluded date. By default the date is
//!    read in the timezone the source wrote it in, *before* any shift to the
//!    display timezone, so a `23:00Z` end does not drift into the next day.
//!
//! Normalization never looks at the wall clock.

use crate::event::{present, Event, RawEvent};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

/// Why a raw record was dropped.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Rejection {
    #[error("no end date")]
    MissingEndAt,

    #[error("unparsable end date '{0}'")]
    UnparsableEndAt(String),

    #[error("ends on excluded date {0}")]
    ExcludedDate(NaiveDate),
}

/// Which calendar date of `end_at` is compared against the excluded date.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExclusionBasis {
    /// Date in the timezone of the source timestamp (un-shifted)
    #[default]
    Source,

    /// Date after shifting to the display timezone
    Display,
}

/// Filtering policy.
#[derive(Debug, Clone)]
pub struct NormalizePolicy {
    pub excluded_date: Option<NaiveDate>,
    pub basis: ExclusionBasis,
    pub display_offset: FixedOffset,
}

impl Default for NormalizePolicy {
    fn default() -> Self {
        Self {
            excluded_date: None,
            basis: ExclusionBasis::Source,
            display_offset: crate::default_display_offset(),
        }
    }
}

/// Output of normalizing one API response.
#[derive(Debug, Default)]
pub struct Normalized {
    /// Displayable events, in source order
    pub events: Vec<Event>,

    /// Dropped records as (title, reason)
    pub rejected: Vec<(String, Rejection)>,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    policy: NormalizePolicy,
}

impl Normalizer {
    pub fn new(policy: NormalizePolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &NormalizePolicy {
        &self.policy
    }

    /// Normalize a single record.
    pub fn normalize(&self, raw: &RawEvent) -> Result<Event, Rejection> {
        let end_raw = present(&raw.end_at).ok_or(Rejection::MissingEndAt)?;
        let end_at = DateTime::parse_from_rfc3339(end_raw)
            .map_err(|_| Rejection::UnparsableEndAt(end_raw.to_string()))?;

        if let Some(excluded) = self.policy.excluded_date {
            let end_date = match self.policy.basis {
                ExclusionBasis::Source => end_at.date_naive(),
                ExclusionBasis::Display => end_at
                    .with_timezone(&self.policy.display_offset)
                    .date_naive(),
            };
            if end_date == excluded {
                return Err(Rejection::ExcludedDate(excluded));
            }
        }

        Ok(Event {
            title: present(&raw.title).unwrap_or("Untitled event").to_string(),
            created_at: present(&raw.created_at)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            end_at: end_at.with_timezone(&Utc),
            region: present(&raw.region).map(str::to_string),
            link: present(&raw.link).map(str::to_string),
            image_url: present(&raw.img).map(str::to_string),
        })
    }

    /// Normalize a whole response, preserving source order.
    pub fn normalize_all(&self, raws: &[RawEvent]) -> Normalized {
        let mut out = Normalized::default();

        for raw in raws {
            match self.normalize(raw) {
                Ok(event) => out.events.push(event),
                Err(reason) => {
                    debug!(title = %raw.display_title(), reason = %reason, "Event rejected");
                    out.rejected.push((raw.display_title().to_string(), reason));
                }
            }
        }

        out
    }
}
