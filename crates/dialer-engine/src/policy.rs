//! Campaign policy evaluation: is dialing permitted right now, and if not,
//! when is the next instant it could be.

use chrono::{DateTime, Datelike, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::campaign::{Campaign, WorkingWindow};
use crate::error::Result;

/// Why dialing is not permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotRunning,
    BeforeStart,
    AfterStop,
    OutsideWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialPermission {
    pub permitted: bool,
    /// Next instant dialing could become permitted. `None` while permitted,
    /// when the campaign is not running, or when `stop_at` rules out any
    /// future window.
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub reason: Option<DenyReason>,
}

impl DialPermission {
    fn permitted() -> Self {
        Self {
            permitted: true,
            next_eligible_at: None,
            reason: None,
        }
    }

    fn denied(reason: DenyReason, next_eligible_at: Option<DateTime<Utc>>) -> Self {
        Self {
            permitted: false,
            next_eligible_at,
            reason: Some(reason),
        }
    }
}

/// Stateless; the result is never cached and callers evaluate before every dial.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyEvaluator;

impl PolicyEvaluator {
    pub fn new() -> Self {
        Self
    }

    pub fn evaluate(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<DialPermission> {
        if !campaign.run_state.is_dialing() {
            return Ok(DialPermission::denied(DenyReason::NotRunning, None));
        }

        if let Some(stop_at) = campaign.stop_at {
            if now >= stop_at {
                return Ok(DialPermission::denied(DenyReason::AfterStop, None));
            }
        }

        let window = &campaign.working_window;
        let tz = window.tz()?;
        let before_stop = |t: DateTime<Utc>| campaign.stop_at.map_or(true, |stop| t < stop);

        if let Some(start_at) = campaign.start_at {
            if now < start_at {
                let next = next_window_open(window, tz, start_at).filter(|t| before_stop(*t));
                return Ok(DialPermission::denied(DenyReason::BeforeStart, next));
            }
        }

        if window_open(window, tz, now) {
            return Ok(DialPermission::permitted());
        }

        let next = next_window_open(window, tz, now).filter(|t| before_stop(*t));
        Ok(DialPermission::denied(DenyReason::OutsideWindow, next))
    }

    /// Re-check the campaign's weekday/time-of-day window in a lead's own
    /// timezone. A missing or unparseable lead timezone defers to the
    /// campaign timezone, which the caller has already checked.
    pub fn lead_window_open(
        &self,
        campaign: &Campaign,
        lead_timezone: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        match lead_timezone.and_then(|tz| tz.parse::<Tz>().ok()) {
            Some(tz) => window_open(&campaign.working_window, tz, now),
            None => true,
        }
    }
}

/// Whether `now` falls inside the window, evaluated in `tz`
pub fn window_open(window: &WorkingWindow, tz: Tz, now: DateTime<Utc>) -> bool {
    let local = now.with_timezone(&tz);
    let time = local.time();
    window.allows_weekday(local.weekday()) && time >= window.start && time < window.end
}

/// Earliest instant at or after `from` when the window is open. Scans a
/// week ahead, which covers every weekday set.
pub fn next_window_open(window: &WorkingWindow, tz: Tz, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if window_open(window, tz, from) {
        return Some(from);
    }

    let first_day = from.with_timezone(&tz).date_naive();
    for offset in 0..=7 {
        let date = first_day + Duration::days(offset);
        if !window.allows_weekday(date.weekday()) {
            continue;
        }

        let Some(opening) = resolve_local(tz, date.and_time(window.start)) else {
            continue;
        };
        // a DST gap can push the resolved opening past the window end
        if opening.with_timezone(&tz).time() >= window.end {
            continue;
        }
        if opening > from {
            return Some(opening);
        }
    }
    None
}

/// Map a local wall-clock time to UTC. Ambiguous times take the earlier
/// instant; times inside a DST gap move forward to the first valid minute.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    for minutes in 0..=180 {
        match tz.from_local_datetime(&(local + Duration::minutes(minutes))) {
            LocalResult::Single(t) => return Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
            LocalResult::None => continue,
        }
    }
    None
}
