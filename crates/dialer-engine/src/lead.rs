//! Leads and their status lifecycle.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::campaign::{parse_timezone, CampaignId};
use crate::error::{EngineError, Result};

/// Opaque lead identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeadId(pub String);

impl LeadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for LeadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for LeadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lead status
///
/// `queued` is initial. `initiated`, `ringing`, `answered` and `calling`
/// are in-flight states held only while a tracker owns the lead. The rest
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeadStatus {
    Queued,
    Initiated,
    Ringing,
    Answered,
    Calling,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Machine,
}

impl LeadStatus {
    pub const ALL: [LeadStatus; 10] = [
        LeadStatus::Queued,
        LeadStatus::Initiated,
        LeadStatus::Ringing,
        LeadStatus::Answered,
        LeadStatus::Calling,
        LeadStatus::Completed,
        LeadStatus::Failed,
        LeadStatus::Busy,
        LeadStatus::NoAnswer,
        LeadStatus::Machine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Queued => "queued",
            LeadStatus::Initiated => "initiated",
            LeadStatus::Ringing => "ringing",
            LeadStatus::Answered => "answered",
            LeadStatus::Calling => "calling",
            LeadStatus::Completed => "completed",
            LeadStatus::Failed => "failed",
            LeadStatus::Busy => "busy",
            LeadStatus::NoAnswer => "no-answer",
            LeadStatus::Machine => "machine",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            LeadStatus::Initiated | LeadStatus::Ringing | LeadStatus::Answered | LeadStatus::Calling
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LeadStatus::Completed
                | LeadStatus::Failed
                | LeadStatus::Busy
                | LeadStatus::NoAnswer
                | LeadStatus::Machine
        )
    }

    /// Progress rank of in-flight states; mirrored statuses only move forward.
    fn progress(&self) -> u8 {
        match self {
            LeadStatus::Initiated => 1,
            LeadStatus::Ringing => 2,
            LeadStatus::Answered => 3,
            LeadStatus::Calling => 4,
            _ => 0,
        }
    }

    pub fn can_transition_to(&self, next: LeadStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self {
            LeadStatus::Queued => next == LeadStatus::Initiated,
            _ => {
                // in flight: back to the queue (retry or rejected dial),
                // forward to a later in-flight state, or to any terminal state
                next == LeadStatus::Queued
                    || next.is_terminal()
                    || (next.is_in_flight() && next.progress() > self.progress())
            }
        }
    }
}

impl fmt::Display for LeadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LeadStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        LeadStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| EngineError::internal(format!("unknown lead status '{}'", s)))
    }
}

/// Result of one finished call attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallOutcome {
    Completed,
    Busy,
    NoAnswer,
    Failed,
    Machine,
    Canceled,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Completed => "completed",
            CallOutcome::Busy => "busy",
            CallOutcome::NoAnswer => "no-answer",
            CallOutcome::Failed => "failed",
            CallOutcome::Machine => "machine",
            CallOutcome::Canceled => "canceled",
        }
    }

    /// Lead status once retries for this outcome are exhausted
    pub fn exhausted_status(&self) -> LeadStatus {
        match self {
            CallOutcome::Busy => LeadStatus::Busy,
            CallOutcome::NoAnswer => LeadStatus::NoAnswer,
            CallOutcome::Machine => LeadStatus::Machine,
            CallOutcome::Failed => LeadStatus::Failed,
            CallOutcome::Completed | CallOutcome::Canceled => LeadStatus::Completed,
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallOutcome {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "completed" => Ok(CallOutcome::Completed),
            "busy" => Ok(CallOutcome::Busy),
            "no-answer" => Ok(CallOutcome::NoAnswer),
            "failed" => Ok(CallOutcome::Failed),
            "machine" => Ok(CallOutcome::Machine),
            "canceled" => Ok(CallOutcome::Canceled),
            other => Err(EngineError::internal(format!("unknown call outcome '{}'", other))),
        }
    }
}

/// A stored lead
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub campaign_id: CampaignId,
    pub batch_label: String,
    pub first_name: String,
    pub last_name: Option<String>,
    pub contact_number: String,
    pub timezone: Option<String>,
    pub status: LeadStatus,
    pub attempts: u32,
    pub last_outcome: Option<CallOutcome>,
    pub order_index: i64,
    pub next_eligible_at: Option<DateTime<Utc>>,
    pub dial_failures: u32,
    pub active_session_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of an uploaded lead list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLead {
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    pub contact_number: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

impl NewLead {
    /// Validate and normalize in place
    pub fn normalize(mut self) -> Result<Self> {
        self.contact_number = validate_contact_number(&self.contact_number)?;
        self.first_name = self.first_name.trim().to_string();
        self.last_name = self
            .last_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self.timezone = match self.timezone.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(tz) => {
                parse_timezone(tz)?;
                Some(tz.to_string())
            }
        };
        Ok(self)
    }
}

/// Strip formatting from a phone number and check its length.
///
/// Accepts an optional leading `+` followed by 5 to 15 digits; spaces,
/// dashes, dots and parentheses are dropped.
pub fn validate_contact_number(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::invalid_input("contact number cannot be empty"));
    }

    let (plus, rest) = match trimmed.strip_prefix('+') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };

    let mut digits = String::with_capacity(rest.len());
    for c in rest.chars() {
        match c {
            '0'..='9' => digits.push(c),
            ' ' | '-' | '.' | '(' | ')' => {}
            _ => {
                return Err(EngineError::invalid_input(format!(
                    "contact number '{}' contains '{}'",
                    raw, c
                )));
            }
        }
    }

    if !(5..=15).contains(&digits.len()) {
        return Err(EngineError::invalid_input(format!(
            "contact number '{}' must have 5 to 15 digits",
            raw
        )));
    }

    Ok(if plus { format!("+{}", digits) } else { digits })
}
