//! Engine assembly and the cooperative service loop.
//!
//! Startup sequence: open the Store (schema init included), refresh the
//! session policy registry from it, then wire admission, netting and the
//! settlement driver. The loop runs one netting pass per batch window and
//! one settlement pass per poll interval; netting never runs two batches
//! concurrently and settlement submits one transaction at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::admission::AdmissionController;
use crate::config::EngineConfig;
use crate::netting::{NettingEngine, Trigger};
use crate::policy::SessionPolicyRegistry;
use crate::settlement::{SettlementClient, SettlementDriver};
use crate::store::Store;
use crate::types::NettingBatch;

pub struct Engine {
    pub store: Arc<Store>,
    pub registry: Arc<SessionPolicyRegistry>,
    pub admission: Arc<AdmissionController>,
    pub netting: Arc<NettingEngine>,
    pub driver: Option<Arc<SettlementDriver>>,
    config: EngineConfig,
}

impl Engine {
    /// Build the engine from configuration. `chain` is the on-chain
    /// submission backend; pass `None` for store-only operator commands.
    pub async fn bootstrap(
        config: EngineConfig,
        chain: Option<Arc<dyn SettlementClient>>,
    ) -> Result<Self> {
        let store = Arc::new(
            Store::open(&config.store.path)
                .await
                .with_context(|| format!("open store at {}", config.store.path.display()))?,
        );

        let registry = Arc::new(SessionPolicyRegistry::new());
        let policies = registry
            .refresh(&store)
            .await
            .context("refresh session policy registry")?;
        info!(policies, "session policy registry loaded");

        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            config.admission.require_signature,
            config.admission.max_parallel,
        ));
        let netting = Arc::new(NettingEngine::new(
            Arc::clone(&store),
            config.batch.clone(),
        ));

        let driver = match chain {
            Some(client) if config.settlement.enabled => Some(Arc::new(SettlementDriver::new(
                Arc::clone(&store),
                client,
                config.settlement.clone(),
            ))),
            _ => None,
        };

        Ok(Self {
            store,
            registry,
            admission,
            netting,
            driver,
            config,
        })
    }

    /// Operator force-close: net whatever is pending right now.
    pub async fn force_close_current_batch(&self) -> Result<Option<NettingBatch>> {
        Ok(self.netting.run_once(Trigger::ForceClose).await?)
    }

    /// Run until a shutdown signal. Returns an error only for the
    /// unrecoverable on-chain mismatch class; everything else is logged
    /// and the loop keeps going.
    pub async fn run(&self) -> Result<()> {
        let netting_period =
            Duration::from_secs(self.config.batch.window_seconds.unwrap_or(5).max(1));
        let settlement_period =
            Duration::from_secs(self.config.settlement.poll_interval_secs.max(1));
        let mut netting_tick = tokio::time::interval(netting_period);
        let mut settlement_tick = tokio::time::interval(settlement_period);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        info!(
            settlement_enabled = self.driver.is_some(),
            "netting engine running"
        );

        loop {
            tokio::select! {
                _ = netting_tick.tick() => {
                    if let Err(e) = self.netting.run_once(Trigger::Scheduled).await {
                        error!(%e, "netting failed; batch aborted, intents remain pending");
                    }
                }
                _ = settlement_tick.tick() => {
                    if let Some(driver) = &self.driver {
                        match driver.run_once().await {
                            Ok(_) => {}
                            Err(e) if e.is_permanent_chain() => {
                                error!(%e, "unrecoverable on-chain mismatch");
                                return Err(e.into());
                            }
                            Err(e) => error!(%e, "settlement attempt failed"),
                        }
                    }
                }
                result = &mut shutdown => {
                    result.context("shutdown signal handler")?;
                    info!("shutdown signal received");
                    return Ok(());
                }
            }
        }
    }
}
