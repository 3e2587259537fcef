//! Dialer Server Manager
//!
//! Owns the lifecycle of the campaign engine: start it, serve the HTTP API,
//! log campaign progress periodically and shut everything down gracefully.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{router, AdminApi, SupervisorApi};
use crate::config::{EngineConfig, ProviderConfig, ProviderKind};
use crate::database::EngineDatabase;
use crate::engine::CampaignEngine;
use crate::error::{EngineError, Result};
use crate::telephony::{HttpTelephonyProvider, SimulatedProvider, TelephonyProvider};
use crate::tracker::CallLifecycleTracker;

/// Build the provider named by the configuration
pub fn provider_from_config(config: &ProviderConfig) -> Result<Arc<dyn TelephonyProvider>> {
    match config.kind {
        ProviderKind::Simulated => Ok(Arc::new(SimulatedProvider::with_script(config.simulation.clone()))),
        ProviderKind::Http => Ok(Arc::new(HttpTelephonyProvider::new(config)?)),
    }
}

/// A complete dialer server: engine, HTTP API and status monitor
pub struct DialerServer {
    engine: Arc<CampaignEngine>,
    admin_api: AdminApi,
    supervisor_api: SupervisorApi,
    config: EngineConfig,
    shutdown: CancellationToken,
    api_handle: Option<JoinHandle<()>>,
    monitor_handle: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl DialerServer {
    /// Create a server over an existing engine
    pub fn new(engine: Arc<CampaignEngine>) -> Self {
        let config = engine.config().clone();
        Self {
            admin_api: AdminApi::new(Arc::clone(&engine)),
            supervisor_api: SupervisorApi::new(Arc::clone(&engine)),
            engine,
            config,
            shutdown: CancellationToken::new(),
            api_handle: None,
            monitor_handle: None,
            local_addr: None,
        }
    }

    /// Start the engine, the HTTP API (if enabled) and the status monitor
    pub async fn start(&mut self) -> Result<()> {
        self.engine.start().await?;

        if self.config.api.enabled {
            let listener = TcpListener::bind(&self.config.api.bind_address)
                .await
                .map_err(|e| {
                    EngineError::configuration(format!(
                        "cannot bind {}: {}",
                        self.config.api.bind_address, e
                    ))
                })?;
            let addr = listener
                .local_addr()
                .map_err(|e| EngineError::internal(format!("listener address: {}", e)))?;
            self.local_addr = Some(addr);

            let app = router(Arc::clone(&self.engine));
            let shutdown = self.shutdown.clone();
            self.api_handle = Some(tokio::spawn(async move {
                let server = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await });
                if let Err(e) = server.await {
                    error!("HTTP API failed: {}", e);
                }
            }));
            info!("🌐 HTTP API listening on {}", addr);
        }

        let engine = Arc::clone(&self.engine);
        let shutdown = self.shutdown.clone();
        let every = Duration::from_secs(self.config.monitoring.status_log_interval_secs.max(1));
        self.monitor_handle = Some(tokio::spawn(async move {
            Self::monitor_loop(engine, every, shutdown).await;
        }));

        info!("✅ Dialer server started");
        Ok(())
    }

    /// Stop the monitor, the HTTP API and every dial loop
    pub async fn stop(&mut self) -> Result<()> {
        info!("🛑 Stopping dialer server...");
        self.shutdown.cancel();

        if let Some(handle) = self.monitor_handle.take() {
            let _ = handle.await;
        }
        if let Some(handle) = self.api_handle.take() {
            let _ = handle.await;
        }
        self.engine.shutdown().await;

        info!("✅ Dialer server stopped");
        Ok(())
    }

    /// Start, then run until Ctrl+C
    pub async fn run_until_shutdown(&mut self) -> Result<()> {
        self.start().await?;
        info!("📞 Dialer server is running; press Ctrl+C to stop");
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
        self.stop().await
    }

    /// Address the HTTP API bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn admin_api(&self) -> &AdminApi {
        &self.admin_api
    }

    pub fn supervisor_api(&self) -> &SupervisorApi {
        &self.supervisor_api
    }

    pub fn engine(&self) -> &Arc<CampaignEngine> {
        &self.engine
    }

    async fn monitor_loop(engine: Arc<CampaignEngine>, every: Duration, shutdown: CancellationToken) {
        let mut ticker = interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match engine.running_campaign_stats().await {
                Ok(all) => {
                    for stats in all {
                        info!(
                            "📊 Campaign {} - queued: {}, in progress: {}, completed: {}, failed: {}, active calls: {}",
                            stats.campaign_id,
                            stats.queued,
                            stats.in_progress,
                            stats.completed,
                            stats.failed,
                            stats.active_calls
                        );
                    }
                }
                Err(e) => error!("Failed to collect campaign stats: {}", e),
            }

            sweep(engine.tracker());
        }
    }
}

fn sweep(tracker: &CallLifecycleTracker) {
    let dropped = tracker.sweep_pending();
    if dropped > 0 {
        warn!("Dropped early provider events for {} unknown sessions", dropped);
    }
}

/// Builder for DialerServer with fluent API
pub struct DialerServerBuilder {
    config: Option<EngineConfig>,
    database: Option<EngineDatabase>,
    provider: Option<Arc<dyn TelephonyProvider>>,
}

impl DialerServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            database: None,
            provider: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_database(mut self, database: EngineDatabase) -> Self {
        self.database = Some(database);
        self
    }

    /// Use an in-memory database
    pub async fn with_in_memory_database(mut self) -> Result<Self> {
        self.database = Some(EngineDatabase::new_in_memory().await?);
        Ok(self)
    }

    pub fn with_provider(mut self, provider: Arc<dyn TelephonyProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Build the server. Without an explicit database or provider the
    /// configured ones are used.
    pub async fn build(self) -> Result<DialerServer> {
        let config = self
            .config
            .ok_or_else(|| EngineError::configuration("Configuration not provided"))?;
        let provider = match self.provider {
            Some(provider) => provider,
            None => provider_from_config(&config.provider)?,
        };
        let engine = match self.database {
            Some(database) => CampaignEngine::with_database(config, database, provider).await?,
            None => CampaignEngine::new(config, provider).await?,
        };
        Ok(DialerServer::new(Arc::new(engine)))
    }
}

impl Default for DialerServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_binds_an_ephemeral_port_and_stops() {
        let mut config = EngineConfig::default();
        config.api.bind_address = "127.0.0.1:0".to_string();
        config.monitoring.status_log_interval_secs = 1;

        let mut server = DialerServerBuilder::new()
            .with_config(config)
            .with_in_memory_database()
            .await
            .unwrap()
            .build()
            .await
            .unwrap();

        server.start().await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let body = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json::<serde_json::Value>()
            .await
            .unwrap();
        assert_eq!(body["status"], "ok");

        server.stop().await.unwrap();
    }

    #[test]
    fn http_provider_requires_base_url() {
        let config = ProviderConfig {
            kind: ProviderKind::Http,
            ..ProviderConfig::default()
        };
        assert!(provider_from_config(&config).is_err());
    }
}
