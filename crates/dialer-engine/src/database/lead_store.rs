//! Lead persistence and atomic status transitions.
//!
//! Every method that moves a lead between statuses is a conditional update
//! on the status it expects to find, returning `false` when another actor
//! got there first. Successful transitions are reported to the stats
//! aggregator and broadcast as `LeadStatusChanged`.
//!
//! A claimed lead carries the claiming engine instance in `owner_id` until
//! it leaves flight, which is what recovery uses to tell live calls of a
//! peer engine from calls abandoned by a dead one.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::campaign::CampaignId;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::lead::{CallOutcome, Lead, LeadId, LeadStatus, NewLead};
use crate::retry::RetryDecision;
use crate::stats::StatsAggregator;
use crate::telephony::CallSessionId;
use crate::tracker::AttemptKind;

use super::attempt_store::{close_attempt, insert_attempt, AttemptClose, NewAttempt};
use super::instance_store::InstanceId;
use super::{from_millis, from_millis_opt, to_millis};

const SELECT_LEAD: &str = r#"
    SELECT id, campaign_id, batch_label, first_name, last_name, contact_number, timezone,
           status, attempts, last_outcome, order_index, next_eligible_at, dial_failures,
           active_session_id, created_at, updated_at
    FROM leads
"#;

const IN_FLIGHT: &str = "('initiated', 'ringing', 'answered', 'calling')";

#[derive(sqlx::FromRow, Debug, Clone)]
struct LeadRow {
    id: String,
    campaign_id: String,
    batch_label: String,
    first_name: String,
    last_name: Option<String>,
    contact_number: String,
    timezone: Option<String>,
    status: String,
    attempts: i64,
    last_outcome: Option<String>,
    order_index: i64,
    next_eligible_at: Option<i64>,
    dial_failures: i64,
    active_session_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<LeadRow> for Lead {
    type Error = EngineError;

    fn try_from(row: LeadRow) -> Result<Self> {
        Ok(Lead {
            id: LeadId(row.id),
            campaign_id: CampaignId(row.campaign_id),
            batch_label: row.batch_label,
            first_name: row.first_name,
            last_name: row.last_name,
            contact_number: row.contact_number,
            timezone: row.timezone,
            status: row.status.parse()?,
            attempts: row.attempts as u32,
            last_outcome: row
                .last_outcome
                .as_deref()
                .map(str::parse::<CallOutcome>)
                .transpose()?,
            order_index: row.order_index,
            next_eligible_at: from_millis_opt(row.next_eligible_at)?,
            dial_failures: row.dial_failures as u32,
            active_session_id: row.active_session_id,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

/// Where a lead goes when its attempt ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeadResolution {
    /// Contact made (or operator hangup): terminal `completed`
    Complete,
    /// Back to `queued`, dialable again from `next_eligible_at`
    Requeue { next_eligible_at: DateTime<Utc> },
    /// Attempts exhausted, terminal in `status`
    Exhausted { status: LeadStatus },
}

impl LeadResolution {
    pub fn status(&self) -> LeadStatus {
        match self {
            LeadResolution::Complete => LeadStatus::Completed,
            LeadResolution::Requeue { .. } => LeadStatus::Queued,
            LeadResolution::Exhausted { status } => *status,
        }
    }

    pub fn next_eligible_at(&self) -> Option<DateTime<Utc>> {
        match self {
            LeadResolution::Requeue { next_eligible_at } => Some(*next_eligible_at),
            _ => None,
        }
    }
}

impl From<RetryDecision> for LeadResolution {
    fn from(decision: RetryDecision) -> Self {
        match decision {
            RetryDecision::Requeue { next_eligible_at, .. } => LeadResolution::Requeue { next_eligible_at },
            RetryDecision::Exhausted { final_status } => LeadResolution::Exhausted { status: final_status },
        }
    }
}

/// Result of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The lead moved `queued → initiated` and now belongs to this instance
    Claimed,
    /// Someone else claimed it, or it is no longer eligible
    Lost,
    /// The campaign already has `max_concurrent` leads in flight
    AtCapacity,
    /// The campaign left `running`
    CampaignNotRunning,
}

/// Remaining work for a campaign
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWork {
    pub queued: u64,
    pub in_flight: u64,
    /// Earliest future `next_eligible_at` among queued leads
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl PendingWork {
    pub fn is_drained(&self) -> bool {
        self.queued == 0 && self.in_flight == 0
    }
}

#[derive(Clone)]
pub struct LeadStore {
    pool: SqlitePool,
    stats: Arc<StatsAggregator>,
    events: EventBus,
    owner: InstanceId,
}

impl LeadStore {
    pub fn new(pool: SqlitePool, stats: Arc<StatsAggregator>, events: EventBus, owner: InstanceId) -> Self {
        Self {
            pool,
            stats,
            events,
            owner,
        }
    }

    /// Instance recorded as owner of every lead this store claims
    pub fn owner(&self) -> &InstanceId {
        &self.owner
    }

    fn after_transition(&self, lead: &Lead, from: LeadStatus, to: LeadStatus, now: DateTime<Utc>) {
        self.stats.record_transition(&lead.campaign_id, from, to);
        self.events.publish(EngineEvent::LeadStatusChanged {
            campaign_id: lead.campaign_id.clone(),
            lead_id: lead.id.clone(),
            from,
            to,
            at: now,
        });
    }

    /// Validate and insert a batch of leads as `queued`, continuing the
    /// campaign's `order_index` sequence. The batch is all-or-nothing.
    pub async fn import(
        &self,
        campaign_id: &CampaignId,
        batch_label: &str,
        leads: Vec<NewLead>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lead>> {
        let leads = leads
            .into_iter()
            .enumerate()
            .map(|(i, lead)| {
                lead.normalize()
                    .map_err(|e| EngineError::invalid_input(format!("lead {}: {}", i, e)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self.pool.begin().await?;
        let mut imported = Vec::with_capacity(leads.len());

        for lead in leads {
            let id = LeadId::new();
            let (order_index,): (i64,) = sqlx::query_as(
                r#"
                INSERT INTO leads (
                    id, campaign_id, batch_label, first_name, last_name, contact_number,
                    timezone, status, attempts, order_index, dial_failures, created_at, updated_at
                ) VALUES (
                    ?, ?, ?, ?, ?, ?, ?, 'queued', 0,
                    (SELECT COALESCE(MAX(order_index), 0) + 1 FROM leads WHERE campaign_id = ?),
                    0, ?, ?
                )
                RETURNING order_index
                "#,
            )
            .bind(id.as_str())
            .bind(campaign_id.as_str())
            .bind(batch_label)
            .bind(&lead.first_name)
            .bind(&lead.last_name)
            .bind(&lead.contact_number)
            .bind(&lead.timezone)
            .bind(campaign_id.as_str())
            .bind(to_millis(now))
            .bind(to_millis(now))
            .fetch_one(&mut *tx)
            .await?;

            imported.push(Lead {
                id,
                campaign_id: campaign_id.clone(),
                batch_label: batch_label.to_string(),
                first_name: lead.first_name,
                last_name: lead.last_name,
                contact_number: lead.contact_number,
                timezone: lead.timezone,
                status: LeadStatus::Queued,
                attempts: 0,
                last_outcome: None,
                order_index,
                next_eligible_at: None,
                dial_failures: 0,
                active_session_id: None,
                created_at: now,
                updated_at: now,
            });
        }

        tx.commit().await?;

        self.stats.record_import(campaign_id, imported.len() as u64);
        debug!("Imported {} leads into campaign {} ({})", imported.len(), campaign_id, batch_label);
        Ok(imported)
    }

    pub async fn get(&self, id: &LeadId) -> Result<Option<Lead>> {
        let row = sqlx::query_as::<_, LeadRow>(&format!("{} WHERE id = ?", SELECT_LEAD))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Lead::try_from).transpose()
    }

    pub async fn require(&self, id: &LeadId) -> Result<Lead> {
        self.get(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("lead {}", id)))
    }

    /// Leads of a campaign in dialing order
    pub async fn list(&self, campaign_id: &CampaignId, limit: u32) -> Result<Vec<Lead>> {
        let rows = sqlx::query_as::<_, LeadRow>(&format!(
            "{} WHERE campaign_id = ? ORDER BY order_index, created_at, id LIMIT ?",
            SELECT_LEAD
        ))
        .bind(campaign_id.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Lead::try_from).collect()
    }

    /// Queued leads eligible at `now`: smallest `order_index` first, then
    /// oldest. `after` continues a previous page past that `order_index`.
    pub async fn next_candidates(
        &self,
        campaign_id: &CampaignId,
        now: DateTime<Utc>,
        after: Option<i64>,
        limit: u32,
    ) -> Result<Vec<Lead>> {
        let rows = sqlx::query_as::<_, LeadRow>(&format!(
            r#"{} WHERE campaign_id = ? AND status = 'queued'
                 AND (next_eligible_at IS NULL OR next_eligible_at <= ?)
                 AND order_index > ?
               ORDER BY order_index, created_at, id
               LIMIT ?"#,
            SELECT_LEAD
        ))
        .bind(campaign_id.as_str())
        .bind(to_millis(now))
        .bind(after.unwrap_or(i64::MIN))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Lead::try_from).collect()
    }

    /// Atomically move `queued → initiated`, provided the campaign is still
    /// `running` and has fewer than `max_concurrent` leads in flight across
    /// every engine sharing the database.
    pub async fn try_claim(&self, lead: &Lead, max_concurrent: u32, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE leads SET status = 'initiated', owner_id = ?, updated_at = ?
            WHERE id = ? AND status = 'queued'
              AND (next_eligible_at IS NULL OR next_eligible_at <= ?)
              AND EXISTS (
                  SELECT 1 FROM campaigns
                  WHERE campaigns.id = leads.campaign_id AND campaigns.run_state = 'running'
              )
              AND (SELECT COUNT(*) FROM leads AS busy
                   WHERE busy.campaign_id = ? AND busy.status IN {}) < ?
            "#,
            IN_FLIGHT
        ))
        .bind(self.owner.as_str())
        .bind(to_millis(now))
        .bind(lead.id.as_str())
        .bind(to_millis(now))
        .bind(lead.campaign_id.as_str())
        .bind(max_concurrent as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            self.after_transition(lead, LeadStatus::Queued, LeadStatus::Initiated, now);
            return Ok(ClaimOutcome::Claimed);
        }

        let (run_state, in_flight): (Option<String>, i64) = sqlx::query_as(&format!(
            r#"
            SELECT (SELECT run_state FROM campaigns WHERE id = ?),
                   (SELECT COUNT(*) FROM leads WHERE campaign_id = ? AND status IN {})
            "#,
            IN_FLIGHT
        ))
        .bind(lead.campaign_id.as_str())
        .bind(lead.campaign_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(if run_state.as_deref() != Some("running") {
            ClaimOutcome::CampaignNotRunning
        } else if in_flight >= max_concurrent as i64 {
            ClaimOutcome::AtCapacity
        } else {
            ClaimOutcome::Lost
        })
    }

    /// The provider refused the dial: back to `queued` with a cooldown,
    /// `attempts` untouched, `dial_failures` bumped.
    pub async fn release_claim(&self, lead: &Lead, cooldown_until: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leads
            SET status = 'queued', dial_failures = dial_failures + 1, next_eligible_at = ?,
                owner_id = NULL, updated_at = ?
            WHERE id = ? AND status = 'initiated' AND active_session_id IS NULL
            "#,
        )
        .bind(to_millis(cooldown_until))
        .bind(to_millis(now))
        .bind(lead.id.as_str())
        .execute(&self.pool)
        .await?;

        let released = result.rows_affected() > 0;
        if released {
            self.after_transition(lead, LeadStatus::Initiated, LeadStatus::Queued, now);
        }
        Ok(released)
    }

    /// Return a claimed lead whose dial never started (e.g. left over from a
    /// crash) to the queue without counting anything.
    pub async fn requeue_unstarted(&self, lead: &Lead, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE leads SET status = 'queued', owner_id = NULL, updated_at = ?
            WHERE id = ? AND status = 'initiated' AND active_session_id IS NULL
            "#,
        )
        .bind(to_millis(now))
        .bind(lead.id.as_str())
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected() > 0;
        if requeued {
            self.after_transition(lead, LeadStatus::Initiated, LeadStatus::Queued, now);
        }
        Ok(requeued)
    }

    /// Repeated dial rejections: count the rejection as a failed attempt and
    /// apply `resolution`.
    pub async fn fail_origination(&self, lead: &Lead, resolution: LeadResolution, now: DateTime<Utc>) -> Result<bool> {
        let to = resolution.status();
        let result = sqlx::query(
            r#"
            UPDATE leads
            SET status = ?, attempts = attempts + 1, dial_failures = 0, last_outcome = 'failed',
                next_eligible_at = ?, owner_id = NULL, updated_at = ?
            WHERE id = ? AND status = 'initiated' AND active_session_id IS NULL
            "#,
        )
        .bind(to.as_str())
        .bind(resolution.next_eligible_at().map(to_millis))
        .bind(to_millis(now))
        .bind(lead.id.as_str())
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if applied {
            self.after_transition(lead, LeadStatus::Initiated, to, now);
        }
        Ok(applied)
    }

    /// The provider accepted the dial: count the attempt, bind the session
    /// to the lead and open its attempt row, in one transaction.
    pub async fn record_origination(
        &self,
        lead: &Lead,
        session_id: &CallSessionId,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE leads
            SET attempts = attempts + 1, dial_failures = 0, active_session_id = ?, updated_at = ?
            WHERE id = ? AND status = 'initiated' AND active_session_id IS NULL
            "#,
        )
        .bind(session_id.as_str())
        .bind(to_millis(now))
        .bind(lead.id.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        insert_attempt(
            &mut tx,
            &NewAttempt {
                session_id,
                kind: AttemptKind::Scheduled,
                campaign_id: Some(&lead.campaign_id),
                lead_id: Some(&lead.id),
                attempt_number: lead.attempts + 1,
                callee_number: &lead.contact_number,
                started_at: now,
                owner: &self.owner,
            },
        )
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Mirror a live provider status onto the lead owned by `session_id`
    pub async fn mirror_status(
        &self,
        lead: &Lead,
        session_id: &CallSessionId,
        from: LeadStatus,
        to: LeadStatus,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        if !from.is_in_flight() || !to.is_in_flight() || !from.can_transition_to(to) {
            return Err(EngineError::invalid_transition(format!(
                "lead {} cannot move {} -> {}",
                lead.id, from, to
            )));
        }

        let result = sqlx::query(
            r#"
            UPDATE leads SET status = ?, updated_at = ?
            WHERE id = ? AND status = ? AND active_session_id = ?
            "#,
        )
        .bind(to.as_str())
        .bind(to_millis(now))
        .bind(lead.id.as_str())
        .bind(from.as_str())
        .bind(session_id.as_str())
        .execute(&self.pool)
        .await?;

        let mirrored = result.rows_affected() > 0;
        if mirrored {
            self.after_transition(lead, from, to, now);
        }
        Ok(mirrored)
    }

    /// End the lead's active attempt: record the outcome, release the
    /// session binding, close the attempt row and apply `resolution`.
    pub async fn finalize_attempt(
        &self,
        lead: &Lead,
        expected: LeadStatus,
        session_id: &CallSessionId,
        close: &AttemptClose,
        resolution: LeadResolution,
    ) -> Result<bool> {
        let to = resolution.status();
        if !expected.can_transition_to(to) {
            return Err(EngineError::invalid_transition(format!(
                "lead {} cannot move {} -> {}",
                lead.id, expected, to
            )));
        }

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE leads
            SET status = ?, last_outcome = ?, next_eligible_at = ?, active_session_id = NULL,
                owner_id = NULL, updated_at = ?
            WHERE id = ? AND status = ? AND active_session_id = ?
            "#,
        )
        .bind(to.as_str())
        .bind(close.outcome.as_str())
        .bind(resolution.next_eligible_at().map(to_millis))
        .bind(to_millis(close.ended_at))
        .bind(lead.id.as_str())
        .bind(expected.as_str())
        .bind(session_id.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        close_attempt(&mut tx, session_id, close).await?;
        tx.commit().await?;

        self.after_transition(lead, expected, to, close.ended_at);
        Ok(true)
    }

    pub async fn pending_work(&self, campaign_id: &CampaignId, now: DateTime<Utc>) -> Result<PendingWork> {
        let (queued, in_flight, next): (Option<i64>, Option<i64>, Option<i64>) = sqlx::query_as(&format!(
            r#"
            SELECT
                SUM(CASE WHEN status = 'queued' THEN 1 ELSE 0 END),
                SUM(CASE WHEN status IN {} THEN 1 ELSE 0 END),
                MIN(CASE WHEN status = 'queued' AND next_eligible_at > ? THEN next_eligible_at END)
            FROM leads WHERE campaign_id = ?
            "#,
            IN_FLIGHT
        ))
        .bind(to_millis(now))
        .bind(campaign_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(PendingWork {
            queued: queued.unwrap_or(0) as u64,
            in_flight: in_flight.unwrap_or(0) as u64,
            next_eligible_at: from_millis_opt(next)?,
        })
    }

    /// In-flight leads whose owner has no lease renewed at or after
    /// `live_cutoff`. Leads owned by live engines, this one included, are
    /// never returned.
    pub async fn orphaned_in_flight(&self, live_cutoff: DateTime<Utc>) -> Result<Vec<Lead>> {
        let rows = sqlx::query_as::<_, LeadRow>(&format!(
            r#"{} WHERE status IN {}
                 AND (owner_id IS NULL
                      OR owner_id NOT IN (SELECT id FROM engine_instances WHERE heartbeat_at >= ?))
               ORDER BY campaign_id, order_index"#,
            SELECT_LEAD, IN_FLIGHT
        ))
        .bind(to_millis(live_cutoff))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Lead::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::{NewCampaign, Pacing, RetryPolicy, RunState, WorkingWindow};
    use crate::database::{CampaignStore, EngineDatabase, InstanceStore};
    use crate::telephony::ProviderCallStatus;
    use chrono::{Duration, NaiveTime};

    struct Fixture {
        db: EngineDatabase,
        campaigns: CampaignStore,
        leads: LeadStore,
        stats: Arc<StatsAggregator>,
        campaign_id: CampaignId,
    }

    const MAX_CONCURRENT: u32 = 2;

    async fn fixture() -> Fixture {
        let db = EngineDatabase::new_in_memory().await.unwrap();
        let campaigns = CampaignStore::new(db.pool().clone());
        let campaign = campaigns
            .create(
                NewCampaign {
                    name: "Leads".to_string(),
                    working_window: WorkingWindow {
                        timezone: "UTC".to_string(),
                        start: NaiveTime::from_hms_opt(0, 0, 0).unwrap(),
                        end: NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
                        days: vec![0, 1, 2, 3, 4, 5, 6],
                    },
                    retry_policy: RetryPolicy {
                        max_attempts: 3,
                        retry_after_minutes: vec![15, 60],
                    },
                    pacing: Pacing {
                        calls_per_minute: 60,
                        max_concurrent: MAX_CONCURRENT,
                    },
                    caller_id: Some("+15550001111".to_string()),
                    assistant_id: Some("asst-1".to_string()),
                    test_number: None,
                    start_at: None,
                    stop_at: None,
                },
                Utc::now(),
            )
            .await
            .unwrap();

        campaigns
            .transition(&campaign.id, RunState::Draft, RunState::Running, Utc::now())
            .await
            .unwrap();

        let stats = Arc::new(StatsAggregator::new(db.pool().clone()));
        stats.install_empty(&campaign.id);
        let owner = InstanceId::new();
        InstanceStore::new(db.pool().clone())
            .heartbeat(&owner, Utc::now())
            .await
            .unwrap();
        let leads = LeadStore::new(db.pool().clone(), Arc::clone(&stats), EventBus::new(64), owner);
        Fixture {
            db,
            campaigns,
            leads,
            stats,
            campaign_id: campaign.id,
        }
    }

    fn new_lead(name: &str, number: &str) -> NewLead {
        NewLead {
            first_name: name.to_string(),
            last_name: None,
            contact_number: number.to_string(),
            timezone: None,
        }
    }

    #[tokio::test]
    async fn import_continues_order_index_across_batches() {
        let f = fixture().await;
        let now = Utc::now();
        let first = f
            .leads
            .import(&f.campaign_id, "batch-1", vec![new_lead("A", "5550001"), new_lead("B", "5550002")], now)
            .await
            .unwrap();
        let second = f
            .leads
            .import(&f.campaign_id, "batch-2", vec![new_lead("C", "5550003")], now)
            .await
            .unwrap();

        assert_eq!(first[0].order_index, 1);
        assert_eq!(first[1].order_index, 2);
        assert_eq!(second[0].order_index, 3);

        let listed = f.leads.list(&f.campaign_id, 10).await.unwrap();
        let names: Vec<_> = listed.iter().map(|l| l.first_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn invalid_batch_is_rejected_whole() {
        let f = fixture().await;
        let err = f
            .leads
            .import(&f.campaign_id, "bad", vec![new_lead("A", "5550001"), new_lead("B", "")], Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
        assert!(f.leads.list(&f.campaign_id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let f = fixture().await;
        let now = Utc::now();
        let lead = f
            .leads
            .import(&f.campaign_id, "b", vec![new_lead("A", "5550001")], now)
            .await
            .unwrap()
            .remove(0);

        assert_eq!(f.leads.try_claim(&lead, MAX_CONCURRENT, now).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(f.leads.try_claim(&lead, MAX_CONCURRENT, now).await.unwrap(), ClaimOutcome::Lost);
        assert_eq!(f.leads.require(&lead.id).await.unwrap().status, LeadStatus::Initiated);
    }

    #[tokio::test]
    async fn claim_stops_at_campaign_capacity() {
        let f = fixture().await;
        let now = Utc::now();
        let leads = f
            .leads
            .import(
                &f.campaign_id,
                "b",
                vec![new_lead("A", "5550001"), new_lead("B", "5550002"), new_lead("C", "5550003")],
                now,
            )
            .await
            .unwrap();

        assert_eq!(f.leads.try_claim(&leads[0], MAX_CONCURRENT, now).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(f.leads.try_claim(&leads[1], MAX_CONCURRENT, now).await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            f.leads.try_claim(&leads[2], MAX_CONCURRENT, now).await.unwrap(),
            ClaimOutcome::AtCapacity
        );
        assert_eq!(f.leads.require(&leads[2].id).await.unwrap().status, LeadStatus::Queued);

        // a finished call frees its place
        f.leads.requeue_unstarted(&leads[0], now).await.unwrap();
        assert_eq!(f.leads.try_claim(&leads[2], MAX_CONCURRENT, now).await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn claim_requires_running_campaign() {
        let f = fixture().await;
        let now = Utc::now();
        let lead = f
            .leads
            .import(&f.campaign_id, "b", vec![new_lead("A", "5550001")], now)
            .await
            .unwrap()
            .remove(0);

        f.campaigns
            .transition(&f.campaign_id, RunState::Running, RunState::Paused, now)
            .await
            .unwrap();
        assert_eq!(
            f.leads.try_claim(&lead, MAX_CONCURRENT, now).await.unwrap(),
            ClaimOutcome::CampaignNotRunning
        );
        assert_eq!(f.leads.require(&lead.id).await.unwrap().status, LeadStatus::Queued);
    }

    #[tokio::test]
    async fn candidates_page_by_order_index() {
        let f = fixture().await;
        let now = Utc::now();
        let leads = f
            .leads
            .import(
                &f.campaign_id,
                "b",
                (1..=5).map(|i| new_lead("L", &format!("555000{}", i))).collect(),
                now,
            )
            .await
            .unwrap();

        let first = f.leads.next_candidates(&f.campaign_id, now, None, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        let second = f
            .leads
            .next_candidates(&f.campaign_id, now, Some(first[1].order_index), 2)
            .await
            .unwrap();
        let ids: Vec<_> = second.iter().map(|l| l.id.clone()).collect();
        assert_eq!(ids, vec![leads[2].id.clone(), leads[3].id.clone()]);
        let last = f
            .leads
            .next_candidates(&f.campaign_id, now, Some(second[1].order_index), 2)
            .await
            .unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].id, leads[4].id);
    }

    #[tokio::test]
    async fn only_leads_of_expired_owners_are_orphaned() {
        let f = fixture().await;
        let now = Utc::now();
        let leads = f
            .leads
            .import(&f.campaign_id, "b", vec![new_lead("A", "5550001"), new_lead("B", "5550002")], now)
            .await
            .unwrap();

        let instances = InstanceStore::new(f.db.pool().clone());
        let dead = InstanceId::new();
        instances.heartbeat(&dead, now - Duration::minutes(5)).await.unwrap();
        let peer = LeadStore::new(
            f.db.pool().clone(),
            Arc::clone(&f.stats),
            EventBus::new(64),
            dead,
        );

        f.leads.try_claim(&leads[0], MAX_CONCURRENT, now).await.unwrap();
        peer.try_claim(&leads[1], MAX_CONCURRENT, now).await.unwrap();

        let orphans = f.leads.orphaned_in_flight(now - Duration::seconds(30)).await.unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, leads[1].id);
    }

    #[tokio::test]
    async fn candidates_skip_future_eligibility() {
        let f = fixture().await;
        let now = Utc::now();
        let leads = f
            .leads
            .import(&f.campaign_id, "b", vec![new_lead("A", "5550001"), new_lead("B", "5550002")], now)
            .await
            .unwrap();

        f.leads.try_claim(&leads[0], MAX_CONCURRENT, now).await.unwrap();
        f.leads
            .release_claim(&leads[0], now + Duration::seconds(30), now)
            .await
            .unwrap();

        let candidates = f.leads.next_candidates(&f.campaign_id, now, None, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, leads[1].id);

        let later = f
            .leads
            .next_candidates(&f.campaign_id, now + Duration::seconds(31), None, 10)
            .await
            .unwrap();
        assert_eq!(later[0].id, leads[0].id);
        assert_eq!(later[0].dial_failures, 1);
        assert_eq!(later[0].attempts, 0);

        let pending = f.leads.pending_work(&f.campaign_id, now).await.unwrap();
        assert_eq!(pending.queued, 2);
        assert_eq!(pending.in_flight, 0);
        assert_eq!(
            pending.next_eligible_at.map(|t| t.timestamp_millis()),
            Some((now + Duration::seconds(30)).timestamp_millis())
        );
    }

    #[tokio::test]
    async fn attempt_lifecycle_updates_lead_and_history() {
        let f = fixture().await;
        let now = Utc::now();
        let lead = f
            .leads
            .import(&f.campaign_id, "b", vec![new_lead("A", "5550001")], now)
            .await
            .unwrap()
            .remove(0);
        let session = CallSessionId::from("sim-1");

        assert_eq!(f.leads.try_claim(&lead, MAX_CONCURRENT, now).await.unwrap(), ClaimOutcome::Claimed);
        assert!(f.leads.record_origination(&lead, &session, now).await.unwrap());
        assert!(f
            .leads
            .mirror_status(&lead, &session, LeadStatus::Initiated, LeadStatus::Ringing, now)
            .await
            .unwrap());

        let close = AttemptClose {
            status: ProviderCallStatus::NoAnswer,
            outcome: CallOutcome::NoAnswer,
            ended_at: now,
            duration_seconds: None,
            sentiment: None,
        };
        let resolution = LeadResolution::Requeue {
            next_eligible_at: now + Duration::minutes(15),
        };
        assert!(f
            .leads
            .finalize_attempt(&lead, LeadStatus::Ringing, &session, &close, resolution)
            .await
            .unwrap());
        // a stale second finalize is rejected by the session guard
        assert!(!f
            .leads
            .finalize_attempt(&lead, LeadStatus::Ringing, &session, &close, resolution)
            .await
            .unwrap());

        let stored = f.leads.require(&lead.id).await.unwrap();
        assert_eq!(stored.status, LeadStatus::Queued);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_outcome, Some(CallOutcome::NoAnswer));
        assert_eq!(stored.active_session_id, None);

        let snapshot = f.stats.snapshot(&f.campaign_id, 0).await.unwrap();
        assert_eq!(snapshot.queued, 1);
        assert_eq!(snapshot.bucket_sum(), 1);
    }

    #[tokio::test]
    async fn mirror_refuses_backward_moves() {
        let f = fixture().await;
        let now = Utc::now();
        let lead = f
            .leads
            .import(&f.campaign_id, "b", vec![new_lead("A", "5550001")], now)
            .await
            .unwrap()
            .remove(0);
        let session = CallSessionId::from("sim-1");
        f.leads.try_claim(&lead, MAX_CONCURRENT, now).await.unwrap();
        f.leads.record_origination(&lead, &session, now).await.unwrap();

        let err = f
            .leads
            .mirror_status(&lead, &session, LeadStatus::Answered, LeadStatus::Ringing, now)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn repeated_rejection_counts_as_failed_attempt() {
        let f = fixture().await;
        let now = Utc::now();
        let lead = f
            .leads
            .import(&f.campaign_id, "b", vec![new_lead("A", "5550001")], now)
            .await
            .unwrap()
            .remove(0);

        f.leads.try_claim(&lead, MAX_CONCURRENT, now).await.unwrap();
        assert!(f
            .leads
            .fail_origination(&lead, LeadResolution::Exhausted { status: LeadStatus::Failed }, now)
            .await
            .unwrap());

        let stored = f.leads.require(&lead.id).await.unwrap();
        assert_eq!(stored.status, LeadStatus::Failed);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_outcome, Some(CallOutcome::Failed));
    }
}
