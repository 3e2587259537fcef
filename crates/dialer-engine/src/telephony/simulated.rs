//! Deterministic in-process provider for development and tests.
//!
//! Session ids are `sim-1`, `sim-2`, ... in origination order. Numbers can
//! be marked as rejected, the whole provider can be made unavailable, and an
//! optional script pushes ringing/answered/completed events through the
//! attached sink.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{
    CallSessionId, OriginateRequest, ProviderCallStatus, ProviderEvent, ProviderEventSink,
    TelephonyProvider,
};
use crate::config::SimulationConfig;
use crate::error::{EngineError, Result};

#[derive(Default)]
struct SimState {
    originated: Vec<(CallSessionId, OriginateRequest)>,
    statuses: HashMap<CallSessionId, ProviderEvent>,
    hangups: Vec<CallSessionId>,
    rejected_numbers: HashSet<String>,
    unavailable: bool,
}

pub struct SimulatedProvider {
    next_id: AtomicU64,
    state: Arc<Mutex<SimState>>,
    sink: Arc<Mutex<Option<ProviderEventSink>>>,
    script: Option<SimulationConfig>,
}

impl SimulatedProvider {
    /// Provider that only reports what tests tell it to
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Arc::new(Mutex::new(SimState::default())),
            sink: Arc::new(Mutex::new(None)),
            script: None,
        }
    }

    /// Provider that plays `config`'s ring/answer/complete script for every call
    pub fn with_script(config: SimulationConfig) -> Self {
        let mut provider = Self::new();
        if config.auto_progress {
            provider.script = Some(config);
        }
        provider
    }

    /// Refuse every origination to `number`
    pub fn reject_number(&self, number: &str) {
        self.state.lock().rejected_numbers.insert(number.to_string());
    }

    /// Refuse (or accept again) every origination
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// All accepted originations, oldest first
    pub fn originated(&self) -> Vec<(CallSessionId, OriginateRequest)> {
        self.state.lock().originated.clone()
    }

    pub fn origination_count(&self) -> usize {
        self.state.lock().originated.len()
    }

    pub fn hangups(&self) -> Vec<CallSessionId> {
        self.state.lock().hangups.clone()
    }

    /// Set what `status()` reports for a session
    pub fn set_status(&self, session_id: &CallSessionId, status: ProviderCallStatus) {
        self.state
            .lock()
            .statuses
            .insert(session_id.clone(), ProviderEvent::new(session_id.clone(), status));
    }

    /// Push an event through the attached sink, as a webhook would.
    /// Returns `false` if no sink is attached.
    pub fn emit(&self, event: ProviderEvent) -> bool {
        self.state.lock().statuses.insert(event.session_id.clone(), event.clone());
        match self.sink.lock().as_ref() {
            Some(sink) => sink.send(event),
            None => false,
        }
    }

    fn spawn_script(&self, session_id: CallSessionId, script: SimulationConfig) {
        let state = Arc::clone(&self.state);
        let sink = Arc::clone(&self.sink);

        tokio::spawn(async move {
            let steps = [
                (script.ring_after_ms, ProviderCallStatus::Ringing),
                (script.answer_after_ms, ProviderCallStatus::Answered),
                (script.complete_after_ms, ProviderCallStatus::Completed),
            ];

            for (delay_ms, status) in steps {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                let mut event = ProviderEvent::new(session_id.clone(), status);
                if status == ProviderCallStatus::Completed {
                    event = event
                        .with_duration((script.complete_after_ms / 1000) as u32)
                        .with_sentiment(0.5);
                }

                {
                    let mut state = state.lock();
                    if state.hangups.contains(&session_id) {
                        return;
                    }
                    state.statuses.insert(session_id.clone(), event.clone());
                }

                let delivered = sink.lock().as_ref().map(|s| s.send(event)).unwrap_or(false);
                if !delivered {
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl TelephonyProvider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn originate(&self, request: OriginateRequest) -> Result<CallSessionId> {
        let session_id = {
            let mut state = self.state.lock();
            if state.unavailable {
                return Err(EngineError::provider("simulated provider unavailable"));
            }
            if state.rejected_numbers.contains(&request.callee_number) {
                return Err(EngineError::provider(format!(
                    "number {} rejected",
                    request.callee_number
                )));
            }

            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let session_id = CallSessionId(format!("sim-{}", id));
            state.originated.push((session_id.clone(), request));
            session_id
        };

        debug!("Simulated origination {}", session_id);

        if let Some(script) = self.script.clone() {
            self.spawn_script(session_id.clone(), script);
        }
        Ok(session_id)
    }

    async fn status(&self, session_id: &CallSessionId) -> Result<Option<ProviderEvent>> {
        Ok(self.state.lock().statuses.get(session_id).cloned())
    }

    async fn hangup(&self, session_id: &CallSessionId) -> Result<()> {
        let mut state = self.state.lock();
        state.hangups.push(session_id.clone());
        state.statuses.insert(
            session_id.clone(),
            ProviderEvent::new(session_id.clone(), ProviderCallStatus::Canceled),
        );
        Ok(())
    }

    fn attach_event_sink(&self, sink: ProviderEventSink) {
        *self.sink.lock() = Some(sink);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(number: &str) -> OriginateRequest {
        OriginateRequest {
            caller_id: "+15550001111".to_string(),
            callee_number: number.to_string(),
            assistant_id: "asst-1".to_string(),
            campaign_id: None,
            lead_id: None,
        }
    }

    #[tokio::test]
    async fn session_ids_are_sequential() {
        let provider = SimulatedProvider::new();
        let first = provider.originate(request("5550100")).await.unwrap();
        let second = provider.originate(request("5550101")).await.unwrap();
        assert_eq!(first.as_str(), "sim-1");
        assert_eq!(second.as_str(), "sim-2");
        assert_eq!(provider.origination_count(), 2);
    }

    #[tokio::test]
    async fn rejected_numbers_and_outages_fail_origination() {
        let provider = SimulatedProvider::new();
        provider.reject_number("5550199");
        assert!(provider.originate(request("5550199")).await.is_err());

        provider.set_unavailable(true);
        assert!(matches!(
            provider.originate(request("5550100")).await,
            Err(EngineError::Provider(_))
        ));
        assert_eq!(provider.origination_count(), 0);
    }

    #[tokio::test]
    async fn status_is_unknown_until_set() {
        let provider = SimulatedProvider::new();
        let session = provider.originate(request("5550100")).await.unwrap();
        assert!(provider.status(&session).await.unwrap().is_none());

        provider.set_status(&session, ProviderCallStatus::Ringing);
        let event = provider.status(&session).await.unwrap().unwrap();
        assert_eq!(event.status, ProviderCallStatus::Ringing);
    }

    #[tokio::test]
    async fn script_pushes_events_through_sink() {
        let provider = SimulatedProvider::with_script(SimulationConfig {
            auto_progress: true,
            ring_after_ms: 1,
            answer_after_ms: 1,
            complete_after_ms: 1,
        });
        let (sink, mut events) = ProviderEventSink::channel();
        provider.attach_event_sink(sink);

        let session = provider.originate(request("5550100")).await.unwrap();
        let mut seen = Vec::new();
        while let Some(event) = events.recv().await {
            assert_eq!(event.session_id, session);
            seen.push(event.status);
            if event.status.is_terminal() {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![
                ProviderCallStatus::Ringing,
                ProviderCallStatus::Answered,
                ProviderCallStatus::Completed
            ]
        );
    }
}
