//! Timezone-aware daily counter reset
//!
//! The next fire instant is always derived from the *local* wall-clock target
//! in the configured IANA zone and converted to UTC last, so DST transitions
//! move the UTC instant rather than the local one.
//!
//! The scheduler never mutates a session. It polls each hub at a coarse
//! interval and, when a reset is due, submits it through the hub's
//! serialized command path where the double-fire guard is re-checked.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;

use crate::clock::SharedClock;
use crate::error::{SyncError, SyncResult};
use crate::hub::Hubs;
use crate::models::ResetConfiguration;

/// Longest DST gap we step across when a local target does not exist
const MAX_GAP_MINUTES: i64 = 180;

pub fn resolve_timezone(name: &str) -> SyncResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| SyncError::TimezoneResolution(name.to_string()))
}

/// UTC instant of the configured local reset time on a given local date.
///
/// Ambiguous local times (DST fall-back) resolve to the earlier instant;
/// nonexistent ones (spring-forward gap) resolve to the first valid local
/// minute after the gap.
fn reset_instant_on(tz: &Tz, date: NaiveDate, hour: u32, minute: u32) -> SyncResult<DateTime<Utc>> {
    let naive = date
        .and_hms_opt(hour, minute, 0)
        .ok_or_else(|| SyncError::InvalidInput(format!("invalid reset time {hour:02}:{minute:02}")))?;

    if let Some(local) = tz.from_local_datetime(&naive).earliest() {
        return Ok(local.with_timezone(&Utc));
    }

    for step in 1..=MAX_GAP_MINUTES {
        let probe = naive + Duration::minutes(step);
        if let Some(local) = tz.from_local_datetime(&probe).earliest() {
            return Ok(local.with_timezone(&Utc));
        }
    }

    Err(SyncError::TimezoneResolution(format!(
        "{} has no valid local time near {}",
        tz.name(),
        naive
    )))
}

/// Next UTC instant strictly after `now` at which the counter resets
pub fn compute_next_fire(config: &ResetConfiguration, now: DateTime<Utc>) -> SyncResult<DateTime<Utc>> {
    let tz = resolve_timezone(&config.timezone)?;
    let (hour, minute) = config.reset_time.hour_minute();

    let mut date = now.with_timezone(&tz).date_naive();
    loop {
        let candidate = reset_instant_on(&tz, date, hour, minute)?;
        if candidate > now {
            return Ok(candidate);
        }
        date = date
            .succ_opt()
            .ok_or_else(|| SyncError::InvalidInput("date out of range".to_string()))?;
    }
}

/// Most recent UTC instant at or before `now` at which the counter reset was due
pub fn previous_fire(config: &ResetConfiguration, now: DateTime<Utc>) -> SyncResult<DateTime<Utc>> {
    let tz = resolve_timezone(&config.timezone)?;
    let (hour, minute) = config.reset_time.hour_minute();

    let mut date = now.with_timezone(&tz).date_naive();
    loop {
        let candidate = reset_instant_on(&tz, date, hour, minute)?;
        if candidate <= now {
            return Ok(candidate);
        }
        date = date
            .pred_opt()
            .ok_or_else(|| SyncError::InvalidInput("date out of range".to_string()))?;
    }
}

/// Derived schedule for one session; recomputed after every fire and config change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScheduledResetTask {
    /// None while resets are disabled
    pub next_fire_utc: Option<DateTime<Utc>>,
}

impl ScheduledResetTask {
    pub fn plan(config: &ResetConfiguration, now: DateTime<Utc>) -> SyncResult<Self> {
        // Validate the zone even when disabled so a bad config is never stored.
        resolve_timezone(&config.timezone)?;
        if !config.enabled {
            return Ok(Self::default());
        }
        Ok(Self {
            next_fire_utc: Some(compute_next_fire(config, now)?),
        })
    }

    /// Due when the target has passed and no reset happened since it.
    ///
    /// A target far in the past (process asleep) is still a single fire:
    /// once it fires, `last_reset` moves past the target and the plan is
    /// recomputed from the current time.
    pub fn is_due(&self, now: DateTime<Utc>, last_reset: Option<DateTime<Utc>>) -> bool {
        match self.next_fire_utc {
            Some(target) => now >= target && last_reset.is_none_or(|last| last < target),
            None => false,
        }
    }
}

/// One pass over every live session; returns how many resets fired
pub async fn check_due_resets(hubs: &Hubs, clock: &SharedClock) -> usize {
    let now = clock.now();
    let mut fired = 0;

    for hub in hubs.all().await {
        let snapshot = match hub.fetch().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(session_id = %hub.session_id(), error = %e, "Skipping reset check");
                continue;
            }
        };

        let plan = ScheduledResetTask {
            next_fire_utc: snapshot.next_reset_utc,
        };
        if !plan.is_due(now, snapshot.counter.last_reset_utc) {
            continue;
        }

        match hub.fire_scheduled_reset().await {
            Ok(outcome) if outcome.applied => {
                fired += 1;
                tracing::info!(
                    session_id = %hub.session_id(),
                    target = ?snapshot.next_reset_utc,
                    next = ?outcome.snapshot.next_reset_utc,
                    "Daily counter reset fired"
                );
            }
            Ok(_) => {
                tracing::debug!(session_id = %hub.session_id(), "Reset already handled");
            }
            Err(e) => {
                tracing::warn!(session_id = %hub.session_id(), error = %e, "Scheduled reset failed");
            }
        }
    }

    fired
}

/// Spawn the periodic reset check
pub fn start_scheduler(
    hubs: Arc<Hubs>,
    clock: SharedClock,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let fired = check_due_resets(&hubs, &clock).await;
            tracing::debug!(fired, "Reset scheduler pass");
        }
    })
}
