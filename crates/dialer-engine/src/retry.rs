//! Retry planning for leads whose attempt ended without a contact.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::campaign::RetryPolicy;
use crate::lead::{CallOutcome, LeadStatus};

/// How a delay is chosen once attempts run past the end of
/// `retry_after_minutes`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryDelayMode {
    /// Reuse the last configured delay
    #[default]
    ClampLast,
    /// Wrap around to the start of the list
    Cycle,
    /// Retry without delay
    Immediate,
}

/// What happens to a lead after an unsuccessful attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Back to `queued`, not dialable before `next_eligible_at`
    Requeue {
        next_eligible_at: DateTime<Utc>,
        delay: Duration,
    },
    /// Attempts used up; the lead ends in `final_status`
    Exhausted { final_status: LeadStatus },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPlanner {
    mode: RetryDelayMode,
}

impl RetryPlanner {
    pub fn new(mode: RetryDelayMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> RetryDelayMode {
        self.mode
    }

    /// Delay before the retry that follows attempt number `attempts`.
    pub fn delay_for(&self, policy: &RetryPolicy, attempts: u32) -> Duration {
        let delays = &policy.retry_after_minutes;
        if delays.is_empty() {
            return Duration::zero();
        }

        let index = attempts.saturating_sub(1) as usize;
        let minutes = match self.mode {
            RetryDelayMode::ClampLast => delays[index.min(delays.len() - 1)],
            RetryDelayMode::Cycle => delays[index % delays.len()],
            RetryDelayMode::Immediate => delays.get(index).copied().unwrap_or(0),
        };
        Duration::minutes(minutes as i64)
    }

    /// Decide the fate of a lead that has made `attempts` attempts, the last
    /// of which ended with `outcome`.
    pub fn plan(
        &self,
        policy: &RetryPolicy,
        attempts: u32,
        outcome: CallOutcome,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if attempts < policy.max_attempts {
            let delay = self.delay_for(policy, attempts);
            RetryDecision::Requeue {
                next_eligible_at: now + delay,
                delay,
            }
        } else {
            RetryDecision::Exhausted {
                final_status: outcome.exhausted_status(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32, delays: &[u32]) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            retry_after_minutes: delays.to_vec(),
        }
    }

    #[test]
    fn fifteen_sixty_then_terminal() {
        let planner = RetryPlanner::default();
        let policy = policy(3, &[15, 60]);
        let now = Utc::now();

        assert_eq!(
            planner.plan(&policy, 1, CallOutcome::Failed, now),
            RetryDecision::Requeue {
                next_eligible_at: now + Duration::minutes(15),
                delay: Duration::minutes(15),
            }
        );
        assert_eq!(
            planner.plan(&policy, 2, CallOutcome::Failed, now),
            RetryDecision::Requeue {
                next_eligible_at: now + Duration::minutes(60),
                delay: Duration::minutes(60),
            }
        );
        assert_eq!(
            planner.plan(&policy, 3, CallOutcome::Failed, now),
            RetryDecision::Exhausted {
                final_status: LeadStatus::Failed
            }
        );
    }

    #[test]
    fn exhausted_status_reflects_last_outcome() {
        let planner = RetryPlanner::default();
        let policy = policy(1, &[]);
        let now = Utc::now();
        assert_eq!(
            planner.plan(&policy, 1, CallOutcome::NoAnswer, now),
            RetryDecision::Exhausted {
                final_status: LeadStatus::NoAnswer
            }
        );
        assert_eq!(
            planner.plan(&policy, 1, CallOutcome::Busy, now),
            RetryDecision::Exhausted {
                final_status: LeadStatus::Busy
            }
        );
    }

    #[test]
    fn short_delay_list_per_mode() {
        let policy = policy(6, &[5, 10]);

        let clamp = RetryPlanner::new(RetryDelayMode::ClampLast);
        assert_eq!(clamp.delay_for(&policy, 3), Duration::minutes(10));
        assert_eq!(clamp.delay_for(&policy, 5), Duration::minutes(10));

        let cycle = RetryPlanner::new(RetryDelayMode::Cycle);
        assert_eq!(cycle.delay_for(&policy, 3), Duration::minutes(5));
        assert_eq!(cycle.delay_for(&policy, 4), Duration::minutes(10));

        let immediate = RetryPlanner::new(RetryDelayMode::Immediate);
        assert_eq!(immediate.delay_for(&policy, 2), Duration::minutes(10));
        assert_eq!(immediate.delay_for(&policy, 3), Duration::zero());
    }

    #[test]
    fn empty_delay_list_retries_immediately() {
        let planner = RetryPlanner::default();
        let policy = policy(2, &[]);
        let now = Utc::now();
        assert_eq!(
            planner.plan(&policy, 1, CallOutcome::Busy, now),
            RetryDecision::Requeue {
                next_eligible_at: now,
                delay: Duration::zero(),
            }
        );
    }
}
