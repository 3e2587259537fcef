//! Campaign definitions and run-state lifecycle.
//!
//! A campaign owns its leads and carries everything the scheduler needs to
//! decide whether and how fast to dial: the working window, pacing limits
//! and retry policy. Run-state changes follow a fixed transition table;
//! `stopped` is final and `completed` is only entered automatically.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::lead::validate_contact_number;

/// Opaque campaign identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CampaignId(pub String);

impl CampaignId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CampaignId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CampaignId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CampaignId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Campaign run state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Draft,
    Running,
    Paused,
    Stopped,
    Completed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Draft => "draft",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Stopped => "stopped",
            RunState::Completed => "completed",
        }
    }

    /// Transitions an operator may request. Self transitions are handled by
    /// the caller as no-ops and are not listed here.
    pub fn operator_can_transition_to(&self, target: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, target),
            (Draft, Running)
                | (Draft, Stopped)
                | (Running, Paused)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Stopped)
                | (Completed, Running)
        )
    }

    /// Whether the scheduler may dial leads of a campaign in this state
    pub fn is_dialing(&self) -> bool {
        matches!(self, RunState::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(RunState::Draft),
            "running" => Ok(RunState::Running),
            "paused" => Ok(RunState::Paused),
            "stopped" => Ok(RunState::Stopped),
            "completed" => Ok(RunState::Completed),
            other => Err(EngineError::invalid_input(format!("unknown run state '{}'", other))),
        }
    }
}

/// Local time-of-day range and weekdays during which a campaign may dial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingWindow {
    /// IANA timezone name, e.g. `America/New_York`
    pub timezone: String,
    /// Inclusive local start
    pub start: NaiveTime,
    /// Exclusive local end
    pub end: NaiveTime,
    /// Allowed weekdays, 0 = Monday .. 6 = Sunday
    pub days: Vec<u8>,
}

impl WorkingWindow {
    pub fn tz(&self) -> Result<Tz> {
        parse_timezone(&self.timezone)
    }

    pub fn allows_weekday(&self, weekday: chrono::Weekday) -> bool {
        let day = weekday.num_days_from_monday() as u8;
        self.days.contains(&day)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.timezone.parse::<Tz>().is_err() {
            return Err(format!("unknown timezone '{}'", self.timezone));
        }
        if self.start >= self.end {
            return Err("working window start must be before end".to_string());
        }
        if self.days.is_empty() {
            return Err("working window must allow at least one weekday".to_string());
        }
        if let Some(day) = self.days.iter().find(|d| **d > 6) {
            return Err(format!("weekday {} is out of range 0..=6", day));
        }
        Ok(())
    }
}

/// Attempt limit and per-retry delays
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(default)]
    pub retry_after_minutes: Vec<u32>,
}

impl RetryPolicy {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Dial rate and concurrency limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pacing {
    pub calls_per_minute: u32,
    pub max_concurrent: u32,
}

impl Pacing {
    pub fn validate(&self, ceiling: u32) -> std::result::Result<(), String> {
        if self.calls_per_minute == 0 {
            return Err("calls_per_minute must be at least 1".to_string());
        }
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        if self.max_concurrent > ceiling {
            return Err(format!(
                "max_concurrent {} exceeds the ceiling of {}",
                self.max_concurrent, ceiling
            ));
        }
        Ok(())
    }
}

/// A stored campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub working_window: WorkingWindow,
    pub retry_policy: RetryPolicy,
    pub pacing: Pacing,
    pub run_state: RunState,
    pub caller_id: Option<String>,
    pub assistant_id: Option<String>,
    pub test_number: Option<String>,
    pub start_at: Option<DateTime<Utc>>,
    pub stop_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// Checks that must pass before the campaign may enter `running`.
    pub fn validate_for_dialing(&self, ceiling: u32) -> Result<()> {
        if self.caller_id.as_deref().map_or(true, |c| c.trim().is_empty()) {
            return Err(EngineError::configuration(format!(
                "campaign {} has no caller_id",
                self.id
            )));
        }
        if self.assistant_id.as_deref().map_or(true, |a| a.trim().is_empty()) {
            return Err(EngineError::configuration(format!(
                "campaign {} has no assistant_id",
                self.id
            )));
        }
        self.working_window.validate().map_err(EngineError::configuration)?;
        self.retry_policy.validate().map_err(EngineError::configuration)?;
        self.pacing.validate(ceiling).map_err(EngineError::configuration)?;
        Ok(())
    }
}

/// Campaign definition supplied on create and update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCampaign {
    pub name: String,
    pub working_window: WorkingWindow,
    pub retry_policy: RetryPolicy,
    pub pacing: Pacing,
    #[serde(default)]
    pub caller_id: Option<String>,
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub test_number: Option<String>,
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_at: Option<DateTime<Utc>>,
}

impl NewCampaign {
    /// Structural validation. `caller_id`/`assistant_id` may still be absent
    /// here; they are only required to start dialing.
    pub fn validate(&self, ceiling: u32) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::invalid_input("campaign name cannot be empty"));
        }
        self.working_window.validate().map_err(EngineError::invalid_input)?;
        self.retry_policy.validate().map_err(EngineError::invalid_input)?;
        self.pacing.validate(ceiling).map_err(EngineError::invalid_input)?;

        if let (Some(start), Some(stop)) = (self.start_at, self.stop_at) {
            if start >= stop {
                return Err(EngineError::invalid_input("start_at must be before stop_at"));
            }
        }

        if let Some(number) = &self.test_number {
            validate_contact_number(number)?;
        }
        Ok(())
    }
}

pub(crate) fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| EngineError::invalid_input(format!("unknown timezone '{}'", name)))
}
