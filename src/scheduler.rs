//! Scheduler - decides when cycles run.
//!
//! One configurable [`SchedulePolicy`] covers every deployment shape:
//! once a day at a fixed wall-clock time, every N seconds (optionally starting
//! at the next local midnight), or manual triggers only.
//!
//! The loop in [`Scheduler::run`] sleeps until the next due time, runs a
//! scheduled cycle and repeats until shutdown. Shutdown during a cycle
//! cancels it, which leaves the posted-message record untouched.

use crate::lifecycle::{Clock, Synchronizer, Trigger};
use crate::shutdown::ShutdownSignal;
use chrono::{DateTime, Days, FixedOffset, NaiveTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Once a day at `at`, wall-clock time in `offset`
    DailyAt { at: NaiveTime, offset: FixedOffset },

    /// Every `every`. The first run is immediate, or at the next midnight in
    /// `offset` when `align_to_midnight` is set.
    Interval {
        every: Duration,
        align_to_midnight: bool,
        offset: FixedOffset,
    },

    /// Only manual triggers run cycles
    ManualOnly,
}

impl Default for SchedulePolicy {
    fn default() -> Self {
        SchedulePolicy::DailyAt {
            at: NaiveTime::MIN,
            offset: crate::default_display_offset(),
        }
    }
}

impl SchedulePolicy {
    /// When the next cycle is due, given the current time and whether any
    /// scheduled cycle has run yet. `None` means never.
    pub fn next_run(&self, now: DateTime<Utc>, first: bool) -> Option<DateTime<Utc>> {
        match self {
            SchedulePolicy::DailyAt { at, offset } => next_at(now, *at, offset),
            SchedulePolicy::Interval {
                every,
                align_to_midnight,
                offset,
            } => {
                if first {
                    if *align_to_midnight {
                        next_at(now, NaiveTime::MIN, offset)
                    } else {
                        Some(now)
                    }
                } else {
                    let every = chrono::Duration::from_std(*every).ok()?;
                    now.checked_add_signed(every)
                }
            }
            SchedulePolicy::ManualOnly => None,
        }
    }
}

/// First instant strictly after `now` whose wall-clock time in `offset` is `at`.
fn next_at(now: DateTime<Utc>, at: NaiveTime, offset: &FixedOffset) -> Option<DateTime<Utc>> {
    let local_date = now.with_timezone(offset).date_naive();
    let today = offset
        .from_local_datetime(&local_date.and_time(at))
        .single()?
        .with_timezone(&Utc);

    if today > now {
        return Some(today);
    }

    let tomorrow = local_date.checked_add_days(Days::new(1))?;
    offset
        .from_local_datetime(&tomorrow.and_time(at))
        .single()
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct Scheduler {
    synchronizer: Arc<Synchronizer>,
    policy: SchedulePolicy,
    clock: Clock,
}

impl Scheduler {
    pub fn new(synchronizer: Arc<Synchronizer>, policy: SchedulePolicy) -> Self {
        Self {
            synchronizer,
            policy,
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.policy
    }

    /// Run scheduled cycles until shutdown.
    pub async fn run(self, shutdown: ShutdownSignal) {
        info!(policy = ?self.policy, "Scheduler started");
        let mut first = true;

        loop {
            let now = (self.clock)();
            let Some(due) = self.policy.next_run(now, first) else {
                info!("No scheduled runs, waiting for manual triggers");
                shutdown.triggered().await;
                break;
            };
            first = false;

            let wait = (due - now).to_std().unwrap_or(Duration::ZERO);
            info!(next_run = %due, wait_secs = wait.as_secs(), "Next synchronization scheduled");

            tokio::select! {
                _ = shutdown.triggered() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            tokio::select! {
                _ = shutdown.triggered() => {
                    warn!("Shutdown during synchronization cycle, cycle cancelled");
                    break;
                }
                result = self.synchronizer.run_cycle(Trigger::Scheduled) => {
                    // Outcome already logged by the synchronizer.
                    debug!(ok = result.is_ok(), "Scheduled cycle finished");
                }
            }
        }

        info!("Scheduler stopped");
    }
}
