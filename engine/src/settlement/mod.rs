//! Settlement driver: one on-chain transaction per netted batch, at most
//! once.
//!
//! The driver scans for the oldest unsettled batch meeting the size
//! threshold, builds the on-chain payload, and submits through a
//! [`SettlementClient`]. Transient chain failures retry with exponential
//! backoff, re-checking the Store row before every attempt so a
//! concurrent driver's success is detected instead of re-submitted.
//! A batch that exhausts its retry budget, or fails permanently, is
//! quarantined until an operator intervenes with `retry`.
//!
//! Batch states: `NETTED -> SUBMITTING -> SETTLED`, or back to `NETTED`
//! on transient failure. Nothing else.

pub mod chain;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::SettlementConfig;
use crate::error::{ChainError, SettlementError, StoreError};
use crate::store::Store;

pub use chain::{
    build_payload, SettlementClient, SettlementPayload, SolanaSettlementClient,
};

pub struct SettlementDriver {
    store: Arc<Store>,
    client: Arc<dyn SettlementClient>,
    config: SettlementConfig,
    /// Batch ids withheld from the scan after a permanent failure or an
    /// exhausted retry budget. Per-process; cleared by operator retry.
    quarantined: Mutex<HashSet<String>>,
}

impl SettlementDriver {
    pub fn new(
        store: Arc<Store>,
        client: Arc<dyn SettlementClient>,
        config: SettlementConfig,
    ) -> Self {
        Self {
            store,
            client,
            config,
            quarantined: Mutex::new(HashSet::new()),
        }
    }

    fn is_quarantined(&self, batch_id: &str) -> bool {
        self.quarantined
            .lock()
            .map(|set| set.contains(batch_id))
            .unwrap_or(false)
    }

    fn quarantine(&self, batch_id: &str) {
        if let Ok(mut set) = self.quarantined.lock() {
            set.insert(batch_id.to_string());
        }
        error!(batch_id, "batch quarantined; operator intervention required");
    }

    /// Settle the oldest eligible batch, if any. Returns the transaction
    /// signature when a batch was settled this call.
    pub async fn run_once(&self) -> Result<Option<String>, SettlementError> {
        let batch = match self
            .store
            .find_oldest_unsettled_batch(self.config.min_intents)
            .await?
        {
            Some(batch) => batch,
            None => return Ok(None),
        };

        // Batches settle in FIFO order: a quarantined head blocks the
        // queue until the operator resolves it.
        if self.is_quarantined(&batch.batch_id) {
            debug!(batch_id = %batch.batch_id, "head of settlement queue is quarantined");
            return Ok(None);
        }

        let signature = self.settle_batch(&batch.batch_id).await?;
        Ok(Some(signature))
    }

    /// Operator override: lift the quarantine and attempt settlement.
    pub async fn retry_settlement(&self, batch_id: &str) -> Result<String, SettlementError> {
        if let Ok(mut set) = self.quarantined.lock() {
            set.remove(batch_id);
        }
        self.settle_batch(batch_id).await
    }

    /// Drive one batch to `SETTLED`, submitting at most one transaction
    /// per attempt and never submitting for a batch the Store already
    /// shows settled.
    pub async fn settle_batch(&self, batch_id: &str) -> Result<String, SettlementError> {
        let mut attempts: u32 = 0;
        let mut backoff = Duration::from_millis(self.config.backoff_initial_ms);
        let backoff_cap = Duration::from_millis(self.config.backoff_cap_ms);

        loop {
            // Re-read the row every attempt: a concurrent driver (or a
            // previous life of this process) may already have settled it.
            let batch = self
                .store
                .get_batch(batch_id)
                .await?
                .ok_or_else(|| StoreError::Fatal(format!("unknown batch {batch_id}")))?;
            if batch.settled {
                let signature = batch.tx_signature.unwrap_or_default();
                debug!(batch_id, %signature, "batch already settled; nothing to submit");
                return Ok(signature);
            }

            let items = self.store.get_settled_items(batch_id).await?;
            let deltas = self.store.get_net_deltas(batch_id).await?;
            let payload = build_payload(&batch, &items, &deltas).map_err(|e| {
                self.quarantine(batch_id);
                SettlementError::Chain(e)
            })?;

            debug!(
                batch_id,
                batch_id_numeric = batch.batch_id_numeric,
                items = payload.items.len(),
                deltas = payload.cash_deltas.len(),
                attempt = attempts + 1,
                "submitting settlement transaction"
            );

            // The RPC client is blocking; keep it off the async workers.
            let client = Arc::clone(&self.client);
            let submitted = payload.clone();
            let outcome = match tokio::task::spawn_blocking(move || client.submit_batch(&submitted))
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.quarantine(batch_id);
                    return Err(SettlementError::Chain(ChainError::Permanent(format!(
                        "settlement submission task failed: {e}"
                    ))));
                }
            };

            match outcome {
                Ok(signature) => {
                    return self.record_settled(batch_id, signature).await;
                }
                Err(ChainError::AlreadySettled { tx_signature }) => {
                    return match tx_signature {
                        Some(signature) => {
                            info!(batch_id, "chain reports batch already settled");
                            self.record_settled(batch_id, signature).await
                        }
                        None => {
                            // Settled on-chain, but the original signature
                            // is unknown: do not invent one.
                            self.quarantine(batch_id);
                            Err(SettlementError::Chain(ChainError::Permanent(format!(
                                "batch {batch_id} is settled on-chain but the original \
                                 transaction signature is unknown"
                            ))))
                        }
                    };
                }
                Err(ChainError::Transient(reason)) => {
                    attempts += 1;
                    if attempts >= self.config.max_retries {
                        self.quarantine(batch_id);
                        return Err(SettlementError::Quarantined(batch_id.to_string()));
                    }
                    warn!(
                        batch_id,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        %reason,
                        "transient chain error; backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(backoff_cap);
                }
                Err(e @ ChainError::Permanent(_)) => {
                    self.quarantine(batch_id);
                    return Err(e.into());
                }
            }
        }
    }

    async fn record_settled(
        &self,
        batch_id: &str,
        signature: String,
    ) -> Result<String, SettlementError> {
        match self.store.mark_batch_settled(batch_id, &signature).await {
            Ok(()) => {
                info!(batch_id, %signature, "batch settled");
                Ok(signature)
            }
            // A concurrent driver recorded a different signature first.
            // The chain accepted exactly one of the submissions; the
            // Store row is the truth.
            Err(StoreError::AlreadySettled) => {
                let recorded = self
                    .store
                    .get_batch(batch_id)
                    .await?
                    .and_then(|b| b.tx_signature)
                    .unwrap_or(signature);
                warn!(batch_id, %recorded, "batch was settled concurrently");
                Ok(recorded)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use crate::error::ChainError;

    use super::chain::{SettlementClient, SettlementPayload};

    /// Scripted chain backend: pops one outcome per submission, defaulting
    /// to success.
    #[derive(Default)]
    pub struct MockChain {
        outcomes: Mutex<VecDeque<Result<String, ChainError>>>,
        submissions: Mutex<Vec<SettlementPayload>>,
    }

    impl MockChain {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_outcome(&self, outcome: Result<String, ChainError>) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        pub fn submissions(&self) -> Vec<SettlementPayload> {
            self.submissions.lock().unwrap().clone()
        }

        pub fn submission_count(&self) -> usize {
            self.submissions.lock().unwrap().len()
        }
    }

    impl SettlementClient for MockChain {
        fn submit_batch(&self, payload: &SettlementPayload) -> Result<String, ChainError> {
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(payload.clone());
            let count = submissions.len();
            drop(submissions);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("mock-sig-{count}")))
        }
    }
}
