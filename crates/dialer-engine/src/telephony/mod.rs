//! # Telephony Provider Seam
//!
//! The engine talks to the outside phone network only through
//! [`TelephonyProvider`]: originate a call, read its current status, hang
//! it up. Status changes are pushed back as [`ProviderEvent`]s, either
//! through the HTTP webhook route or through the [`ProviderEventSink`] a
//! provider is handed at start-up.

pub mod http;
pub mod simulated;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::campaign::CampaignId;
use crate::error::Result;
use crate::lead::{CallOutcome, LeadId, LeadStatus};

pub use http::HttpTelephonyProvider;
pub use simulated::SimulatedProvider;

/// Provider-assigned call session id
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallSessionId(pub String);

impl CallSessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CallSessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CallSessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Everything a provider needs to place one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginateRequest {
    pub caller_id: String,
    pub callee_number: String,
    pub assistant_id: String,
    /// Correlation only; providers echo these back in metadata if they can
    pub campaign_id: Option<CampaignId>,
    pub lead_id: Option<LeadId>,
}

/// Call status as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderCallStatus {
    Initiated,
    Ringing,
    Answered,
    InProgress,
    Completed,
    Busy,
    NoAnswer,
    Failed,
    Machine,
    Canceled,
}

impl ProviderCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderCallStatus::Initiated => "initiated",
            ProviderCallStatus::Ringing => "ringing",
            ProviderCallStatus::Answered => "answered",
            ProviderCallStatus::InProgress => "in-progress",
            ProviderCallStatus::Completed => "completed",
            ProviderCallStatus::Busy => "busy",
            ProviderCallStatus::NoAnswer => "no-answer",
            ProviderCallStatus::Failed => "failed",
            ProviderCallStatus::Machine => "machine",
            ProviderCallStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome().is_some()
    }

    /// Attempt outcome for terminal statuses
    pub fn outcome(&self) -> Option<CallOutcome> {
        match self {
            ProviderCallStatus::Completed => Some(CallOutcome::Completed),
            ProviderCallStatus::Busy => Some(CallOutcome::Busy),
            ProviderCallStatus::NoAnswer => Some(CallOutcome::NoAnswer),
            ProviderCallStatus::Failed => Some(CallOutcome::Failed),
            ProviderCallStatus::Machine => Some(CallOutcome::Machine),
            ProviderCallStatus::Canceled => Some(CallOutcome::Canceled),
            _ => None,
        }
    }

    /// Lead status mirrored while the call is live
    pub fn live_lead_status(&self) -> Option<LeadStatus> {
        match self {
            ProviderCallStatus::Initiated => Some(LeadStatus::Initiated),
            ProviderCallStatus::Ringing => Some(LeadStatus::Ringing),
            ProviderCallStatus::Answered => Some(LeadStatus::Answered),
            ProviderCallStatus::InProgress => Some(LeadStatus::Calling),
            _ => None,
        }
    }

    /// Ordering of live states; an attempt never moves backwards
    pub fn rank(&self) -> u8 {
        match self {
            ProviderCallStatus::Initiated => 0,
            ProviderCallStatus::Ringing => 1,
            ProviderCallStatus::Answered => 2,
            ProviderCallStatus::InProgress => 3,
            _ => 4,
        }
    }
}

impl fmt::Display for ProviderCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status notification for one call session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEvent {
    pub session_id: CallSessionId,
    pub status: ProviderCallStatus,
    #[serde(default)]
    pub duration_seconds: Option<u32>,
    /// Assistant-reported sentiment, -1.0 ..= 1.0
    #[serde(default)]
    pub sentiment: Option<f64>,
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,
}

impl ProviderEvent {
    pub fn new(session_id: CallSessionId, status: ProviderCallStatus) -> Self {
        Self {
            session_id,
            status,
            duration_seconds: None,
            sentiment: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_duration(mut self, seconds: u32) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_sentiment(mut self, sentiment: f64) -> Self {
        self.sentiment = Some(sentiment);
        self
    }
}

/// Channel end providers push status notifications into
#[derive(Debug, Clone)]
pub struct ProviderEventSink {
    sender: mpsc::UnboundedSender<ProviderEvent>,
}

impl ProviderEventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProviderEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Returns `false` once the engine has stopped listening
    pub fn send(&self, event: ProviderEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// External telephony provider
#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Place a call. An error means the provider refused the dial.
    async fn originate(&self, request: OriginateRequest) -> Result<CallSessionId>;

    /// Current status of a session, if the provider knows it
    async fn status(&self, session_id: &CallSessionId) -> Result<Option<ProviderEvent>>;

    /// Terminate a session
    async fn hangup(&self, session_id: &CallSessionId) -> Result<()>;

    /// Hand the provider a sink for pushed status events. Providers that
    /// only deliver through webhooks ignore it.
    fn attach_event_sink(&self, _sink: ProviderEventSink) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_map_to_outcomes() {
        assert_eq!(ProviderCallStatus::NoAnswer.outcome(), Some(CallOutcome::NoAnswer));
        assert_eq!(ProviderCallStatus::Canceled.outcome(), Some(CallOutcome::Canceled));
        assert!(ProviderCallStatus::Machine.is_terminal());
        assert!(!ProviderCallStatus::Ringing.is_terminal());
    }

    #[test]
    fn in_progress_mirrors_as_calling() {
        assert_eq!(
            ProviderCallStatus::InProgress.live_lead_status(),
            Some(LeadStatus::Calling)
        );
        assert_eq!(ProviderCallStatus::Completed.live_lead_status(), None);
        assert!(ProviderCallStatus::Answered.rank() > ProviderCallStatus::Ringing.rank());
    }

    #[test]
    fn webhook_payload_defaults_optional_fields() {
        let event: ProviderEvent =
            serde_json::from_str(r#"{"session_id":"sim-7","status":"no-answer"}"#).unwrap();
        assert_eq!(event.session_id, CallSessionId::from("sim-7"));
        assert_eq!(event.status, ProviderCallStatus::NoAnswer);
        assert_eq!(event.duration_seconds, None);
    }
}
