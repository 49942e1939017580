//! # Beacon
//!
//! Keeps chat destinations showing the current list of in-game events.
//!
//! Each cycle polls an events API, drops records that must not be shown,
//! renders the rest, then replaces every tracked destination's previous
//! notifications with the fresh set.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler / HTTP -> Synchronizer -> Source -> Normalizer -> Renderer
//!                          |
//!                          +-> Registry, Sink (delete, then post), Store
//! ```
//!
//! ## Modules
//!
//! - [`event`]: raw and normalized event types
//! - [`normalize`]: filtering and normalization
//! - [`render`]: notification rendering
//! - [`source`]: events API client
//! - [`sink`]: destination platforms
//! - [`store`]: persisted key-value state
//! - [`registry`]: tracked destinations
//! - [`lifecycle`]: the synchronization cycle
//! - [`scheduler`]: when cycles run
//! - [`server`]: HTTP health and command surface

pub mod config;
pub mod event;
pub mod lifecycle;
pub mod metrics;
pub mod normalize;
pub mod registry;
pub mod render;
pub mod scheduler;
pub mod server;
pub mod shutdown;
pub mod sink;
pub mod source;
pub mod store;

use chrono::{FixedOffset, Offset, Utc};

// Re-export commonly used types at crate root
pub use event::{Event, RawEvent};
pub use lifecycle::{CycleError, CycleReport, CycleState, Synchronizer, Trigger};
pub use registry::DestinationRegistry;
pub use sink::{DestinationSink, MessageHandle, SinkError};
pub use source::{EventSource, FetchError};

/// Hours east of UTC that times are displayed in unless configured otherwise
pub const DEFAULT_DISPLAY_OFFSET_HOURS: i32 = 8;

/// UTC+8.
pub fn default_display_offset() -> FixedOffset {
    FixedOffset::east_opt(DEFAULT_DISPLAY_OFFSET_HOURS * 3600).unwrap_or_else(|| Utc.fix())
}
