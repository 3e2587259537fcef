//! Per-campaign lead counters for dashboard polling.
//!
//! Counters move incrementally on every lead transition the store commits,
//! so a poll is a map lookup. A campaign's counters are rebuilt from a full
//! scan the first time they are read and whenever `rebuild` is called.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use crate::campaign::CampaignId;
use crate::database::attempt_store::AttemptStore;
use crate::error::Result;
use crate::lead::LeadStatus;

const BUCKETS: usize = LeadStatus::ALL.len();

fn bucket(status: LeadStatus) -> usize {
    LeadStatus::ALL
        .iter()
        .position(|s| *s == status)
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default)]
struct CampaignCounters {
    by_status: [i64; BUCKETS],
    total: i64,
    duration_sum: f64,
    duration_count: u64,
    sentiment_sum: f64,
    sentiment_count: u64,
}

impl CampaignCounters {
    fn count(&self, status: LeadStatus) -> u64 {
        self.by_status[bucket(status)].max(0) as u64
    }
}

/// Read-side projection returned to dashboards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignStats {
    pub campaign_id: CampaignId,
    pub total_leads: u64,
    pub queued: u64,
    pub initiated: u64,
    pub ringing: u64,
    pub answered: u64,
    pub calling: u64,
    pub completed: u64,
    pub failed: u64,
    pub busy: u64,
    pub no_answer: u64,
    pub machine: u64,
    /// Leads currently owned by a tracker
    pub in_progress: u64,
    /// Live scheduled calls known to the tracker
    pub active_calls: u64,
    pub average_duration_seconds: Option<f64>,
    pub average_sentiment: Option<f64>,
}

impl CampaignStats {
    /// Sum of every status bucket; always equals `total_leads`
    pub fn bucket_sum(&self) -> u64 {
        self.queued
            + self.initiated
            + self.ringing
            + self.answered
            + self.calling
            + self.completed
            + self.failed
            + self.busy
            + self.no_answer
            + self.machine
    }
}

pub struct StatsAggregator {
    pool: SqlitePool,
    counters: DashMap<CampaignId, CampaignCounters>,
}

impl StatsAggregator {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            counters: DashMap::new(),
        }
    }

    /// Start tracking a campaign that has no leads yet
    pub fn install_empty(&self, campaign_id: &CampaignId) {
        self.counters.entry(campaign_id.clone()).or_default();
    }

    /// Newly imported leads enter `queued`
    pub fn record_import(&self, campaign_id: &CampaignId, count: u64) {
        if let Some(mut counters) = self.counters.get_mut(campaign_id) {
            counters.by_status[bucket(LeadStatus::Queued)] += count as i64;
            counters.total += count as i64;
        }
    }

    pub fn record_transition(&self, campaign_id: &CampaignId, from: LeadStatus, to: LeadStatus) {
        if from == to {
            return;
        }
        // untracked campaigns pick this up on their first rebuild
        if let Some(mut counters) = self.counters.get_mut(campaign_id) {
            counters.by_status[bucket(from)] -= 1;
            counters.by_status[bucket(to)] += 1;
        }
    }

    pub fn record_call_metrics(&self, campaign_id: &CampaignId, duration_seconds: Option<u32>, sentiment: Option<f64>) {
        if let Some(mut counters) = self.counters.get_mut(campaign_id) {
            if let Some(duration) = duration_seconds {
                counters.duration_sum += duration as f64;
                counters.duration_count += 1;
            }
            if let Some(sentiment) = sentiment {
                counters.sentiment_sum += sentiment;
                counters.sentiment_count += 1;
            }
        }
    }

    /// Replace a campaign's counters with a full scan of its leads and attempts
    pub async fn rebuild(&self, campaign_id: &CampaignId) -> Result<()> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM leads WHERE campaign_id = ? GROUP BY status")
                .bind(campaign_id.as_str())
                .fetch_all(&self.pool)
                .await?;

        let mut counters = CampaignCounters::default();
        for (status, count) in rows {
            let status: LeadStatus = status.parse()?;
            counters.by_status[bucket(status)] = count;
            counters.total += count;
        }

        let metrics = AttemptStore::new(self.pool.clone())
            .campaign_metrics(campaign_id)
            .await?;
        counters.duration_sum = metrics.duration_sum;
        counters.duration_count = metrics.duration_count;
        counters.sentiment_sum = metrics.sentiment_sum;
        counters.sentiment_count = metrics.sentiment_count;

        debug!("Rebuilt stats for campaign {} ({} leads)", campaign_id, counters.total);
        self.counters.insert(campaign_id.clone(), counters);
        Ok(())
    }

    pub fn forget(&self, campaign_id: &CampaignId) {
        self.counters.remove(campaign_id);
    }

    /// Current stats; rebuilds first if the campaign is not tracked yet
    pub async fn snapshot(&self, campaign_id: &CampaignId, active_calls: usize) -> Result<CampaignStats> {
        if !self.counters.contains_key(campaign_id) {
            self.rebuild(campaign_id).await?;
        }

        let counters = self
            .counters
            .get(campaign_id)
            .map(|c| c.value().clone())
            .unwrap_or_default();

        let initiated = counters.count(LeadStatus::Initiated);
        let ringing = counters.count(LeadStatus::Ringing);
        let answered = counters.count(LeadStatus::Answered);
        let calling = counters.count(LeadStatus::Calling);

        Ok(CampaignStats {
            campaign_id: campaign_id.clone(),
            total_leads: counters.total.max(0) as u64,
            queued: counters.count(LeadStatus::Queued),
            initiated,
            ringing,
            answered,
            calling,
            completed: counters.count(LeadStatus::Completed),
            failed: counters.count(LeadStatus::Failed),
            busy: counters.count(LeadStatus::Busy),
            no_answer: counters.count(LeadStatus::NoAnswer),
            machine: counters.count(LeadStatus::Machine),
            in_progress: initiated + ringing + answered + calling,
            active_calls: active_calls as u64,
            average_duration_seconds: (counters.duration_count > 0)
                .then(|| counters.duration_sum / counters.duration_count as f64),
            average_sentiment: (counters.sentiment_count > 0)
                .then(|| counters.sentiment_sum / counters.sentiment_count as f64),
        })
    }
}
