//! Engine event broadcast for live monitoring consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::campaign::{CampaignId, RunState};
use crate::lead::{CallOutcome, LeadId, LeadStatus};
use crate::telephony::CallSessionId;
use crate::tracker::AttemptKind;

/// Something observable happened inside the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CampaignStateChanged {
        campaign_id: CampaignId,
        from: RunState,
        to: RunState,
        at: DateTime<Utc>,
    },
    LeadStatusChanged {
        campaign_id: CampaignId,
        lead_id: LeadId,
        from: LeadStatus,
        to: LeadStatus,
        at: DateTime<Utc>,
    },
    AttemptStarted {
        session_id: CallSessionId,
        kind: AttemptKind,
        campaign_id: Option<CampaignId>,
        lead_id: Option<LeadId>,
        at: DateTime<Utc>,
    },
    AttemptEnded {
        session_id: CallSessionId,
        kind: AttemptKind,
        campaign_id: Option<CampaignId>,
        lead_id: Option<LeadId>,
        outcome: CallOutcome,
        at: DateTime<Utc>,
    },
}

/// Cloneable handle over a broadcast channel. Publishing never blocks and
/// never fails; slow subscribers observe `Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: EngineEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let event = EngineEvent::CampaignStateChanged {
            campaign_id: CampaignId::from("c-1"),
            from: RunState::Draft,
            to: RunState::Running,
            at: Utc::now(),
        };
        bus.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::new(1);
        bus.publish(EngineEvent::CampaignStateChanged {
            campaign_id: CampaignId::from("c-1"),
            from: RunState::Running,
            to: RunState::Completed,
            at: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
