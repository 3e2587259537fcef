//! # Outbound Campaign Dialing Engine
//!
//! This crate decides which lead to call next, when, and how many calls may
//! run at once, then tracks every call to an outcome and retries the ones
//! that did not reach anybody. Dashboards create campaigns, upload lead
//! lists, start/pause/stop dialing and poll for progress.
//!
//! ## Features
//!
//! - **Dial Scheduling**: one loop per running campaign with working-window,
//!   pacing and concurrency limits
//! - **Call Tracking**: per-attempt state machine mirrored onto the lead,
//!   with status polling and silence timeouts
//! - **Retry Planning**: configurable delay schedules and terminal
//!   classification
//! - **Stats**: incremental per-campaign counters for cheap polling
//! - **Test/Manual Calls**: out-of-band calls under an account-wide ceiling
//! - **HTTP API**: JSON REST surface and provider webhook
//!
//! ## Architecture
//!
//! - [`database`]: SQLite stores for campaigns, leads, call attempts and
//!   engine instance leases
//! - [`recovery`]: settling calls left behind by expired engine instances
//! - [`policy`]: working window and run-state evaluation
//! - [`scheduler`]: dial loops, pacing gate and concurrency budgets
//! - [`tracker`]: call lifecycle tracking
//! - [`retry`]: retry planning
//! - [`stats`]: per-campaign counters
//! - [`gateway`]: test and manual calls
//! - [`telephony`]: provider seam plus simulated and HTTP providers
//! - [`engine`]: wiring, operator commands and read API
//! - [`api`]: admin/supervisor APIs and the axum router
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dialer_engine::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let database = EngineDatabase::new_in_memory().await?;
//!     let provider = Arc::new(SimulatedProvider::new());
//!     let engine = CampaignEngine::with_database(EngineConfig::default(), database, provider).await?;
//!     engine.start().await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod config;
pub mod error;
pub mod logging;

// Domain model
pub mod campaign;
pub mod lead;

// Dialing components
pub mod events;
pub mod gateway;
pub mod policy;
pub mod retry;
pub mod scheduler;
pub mod stats;
pub mod tracker;

// External interfaces
pub mod api;
pub mod telephony;

// Persistence
pub mod database;
pub mod recovery;

pub mod engine;
pub mod server;

pub use config::EngineConfig;
pub use engine::CampaignEngine;
pub use error::{EngineError, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{CampaignEngine, EngineConfig, EngineError, Result};

    pub use crate::campaign::{Campaign, CampaignId, NewCampaign, Pacing, RetryPolicy, RunState, WorkingWindow};
    pub use crate::lead::{CallOutcome, Lead, LeadId, LeadStatus, NewLead};

    pub use crate::api::{AdminApi, SupervisorApi};
    pub use crate::database::EngineDatabase;
    pub use crate::events::EngineEvent;
    pub use crate::policy::{DialPermission, PolicyEvaluator};
    pub use crate::retry::{RetryDecision, RetryDelayMode, RetryPlanner};
    pub use crate::server::{DialerServer, DialerServerBuilder};
    pub use crate::stats::CampaignStats;
    pub use crate::telephony::{
        CallSessionId, ProviderCallStatus, ProviderEvent, SimulatedProvider, TelephonyProvider,
    };
    pub use crate::tracker::{ActiveCallInfo, AttemptKind};
}
