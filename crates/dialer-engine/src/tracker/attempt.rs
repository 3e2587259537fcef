//! Call attempt records and the live view exposed to dashboards.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::campaign::CampaignId;
use crate::error::{EngineError, Result};
use crate::lead::{CallOutcome, LeadId};
use crate::telephony::{CallSessionId, ProviderCallStatus};

/// Where an attempt came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    /// Dialed by a campaign scheduler for a lead
    Scheduled,
    /// Campaign test call to its `test_number`
    Test,
    /// Operator-initiated call to an arbitrary number
    Manual,
}

impl AttemptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptKind::Scheduled => "scheduled",
            AttemptKind::Test => "test",
            AttemptKind::Manual => "manual",
        }
    }
}

impl fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduled" => Ok(AttemptKind::Scheduled),
            "test" => Ok(AttemptKind::Test),
            "manual" => Ok(AttemptKind::Manual),
            other => Err(EngineError::internal(format!("unknown attempt kind '{}'", other))),
        }
    }
}

/// One persisted call attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub session_id: CallSessionId,
    pub kind: AttemptKind,
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
    pub attempt_number: u32,
    pub callee_number: String,
    pub status: ProviderCallStatus,
    pub outcome: Option<CallOutcome>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u32>,
    pub sentiment: Option<f64>,
}

/// Snapshot of an attempt that is still live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCallInfo {
    pub session_id: CallSessionId,
    pub kind: AttemptKind,
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
    pub callee_number: String,
    pub status: ProviderCallStatus,
    pub started_at: DateTime<Utc>,
    pub last_update_at: DateTime<Utc>,
}
