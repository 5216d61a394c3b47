//! Batch formation and linear netting.
//!
//! One pass over the formed intent list maintains two working maps: item
//! id to current owner, and owner to signed cash delta. A chain
//! `A -> B -> C -> D` on one item collapses to final owner `D` with cash
//! conserved among the four wallets. O(N) in intents, O(M + W) extra
//! space in distinct items and owners; no sorting beyond the load order,
//! no graph algorithms.
//!
//! An intent whose `from` no longer owns the item within the batch is
//! stale: it is consumed-and-dropped (stamped with the batch id and a
//! dropped marker so it can never re-enter a later window) and excluded
//! from the consumed set and all outputs.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::commitment;
use crate::config::BatchConfig;
use crate::error::NettingError;
use crate::store::Store;
use crate::types::{now_ts, NetCashDelta, NettingBatch, SettledItem, TradeIntent};

/// Why the engine was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Periodic tick: honors the minimum batch size and window timeout.
    Scheduled,
    /// Operator force-close: nets whatever is pending.
    ForceClose,
}

/// Result of the single netting pass, before persistence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NettingOutcome {
    /// Final owner of every item touched by a consumed intent.
    pub final_owners: HashMap<String, String>,
    /// Non-zero per-owner lamport deltas; they sum to zero.
    pub net_deltas: HashMap<String, i128>,
    /// Consumed intent ids, in consumption order.
    pub consumed: Vec<String>,
    /// Stale-in-batch intent ids.
    pub dropped: Vec<String>,
}

/// Collapse an ordered intent list into final owners and net deltas.
pub fn net_intents(intents: &[TradeIntent]) -> Result<NettingOutcome, NettingError> {
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut deltas: HashMap<String, i128> = HashMap::new();
    let mut consumed = Vec::with_capacity(intents.len());
    let mut dropped = Vec::new();

    for intent in intents {
        let current = owners
            .entry(intent.item_id.clone())
            .or_insert_with(|| intent.from.clone());
        if *current != intent.from {
            // The item was transferred away from this seller earlier in
            // the batch.
            dropped.push(intent.id.clone());
            continue;
        }
        *current = intent.to.clone();
        *deltas.entry(intent.from.clone()).or_insert(0) += intent.amount_lamports as i128;
        *deltas.entry(intent.to.clone()).or_insert(0) -= intent.amount_lamports as i128;
        consumed.push(intent.id.clone());
    }

    let sum: i128 = deltas.values().sum();
    if sum != 0 {
        return Err(NettingError::DeltaSumNotZero(sum));
    }
    deltas.retain(|_, delta| *delta != 0);

    Ok(NettingOutcome {
        final_owners: owners,
        net_deltas: deltas,
        consumed,
        dropped,
    })
}

pub struct NettingEngine {
    store: Arc<Store>,
    config: BatchConfig,
}

impl NettingEngine {
    pub fn new(store: Arc<Store>, config: BatchConfig) -> Self {
        Self { store, config }
    }

    /// Form and persist at most one batch. Returns the persisted batch,
    /// or `None` when formation policy held it back.
    ///
    /// Concurrent invocations are forbidden: admission's conflict check
    /// reasons about a single pending set, so the engine nets one batch
    /// at a time.
    pub async fn run_once(&self, trigger: Trigger) -> Result<Option<NettingBatch>, NettingError> {
        let pending = self
            .store
            .load_pending_intents(self.config.max_intents)
            .await?;
        if pending.is_empty() {
            return Ok(None);
        }

        if trigger == Trigger::Scheduled && (pending.len() as u32) < self.config.min_intents {
            let window_elapsed = match self.config.window_seconds {
                Some(window) => {
                    now_ts().saturating_sub(pending[0].created_at) >= window as i64
                }
                None => false,
            };
            if !window_elapsed {
                return Ok(None);
            }
        }

        // The batch is closed from here on; no further intent joins it.
        let outcome = net_intents(&pending)?;
        if outcome.consumed.is_empty() {
            // Unreachable by construction: an item's first intent is
            // never stale.
            return Err(NettingError::EmptyBatchAfterFormation);
        }

        let batch_id = Uuid::new_v4().to_string();
        let final_owners: Vec<(String, String)> = outcome
            .final_owners
            .iter()
            .map(|(item, owner)| (item.clone(), owner.clone()))
            .collect();
        let net_deltas: Vec<(String, i128)> = outcome
            .net_deltas
            .iter()
            .map(|(owner, delta)| (owner.clone(), *delta))
            .collect();

        let num_intents = outcome.consumed.len() as u64;
        let num_items_settled = final_owners.len() as u64;
        let num_wallets = net_deltas.len() as u64;
        let batch_hash =
            commitment::batch_hash(&final_owners, &net_deltas, num_intents, num_items_settled);

        let now = now_ts();
        let batch = NettingBatch {
            batch_id_numeric: commitment::batch_id_numeric(&batch_id),
            batch_id: batch_id.clone(),
            created_at: now,
            netted_at: Some(now),
            settled_at: None,
            settled: false,
            tx_signature: None,
            batch_hash,
            intent_ids: outcome.consumed.clone(),
            num_intents,
            num_items_settled,
            num_wallets,
        };

        let items: Vec<SettledItem> = final_owners
            .iter()
            .map(|(item_id, final_owner)| SettledItem {
                batch_id: batch_id.clone(),
                item_id: item_id.clone(),
                final_owner: final_owner.clone(),
            })
            .collect();
        let delta_rows: Vec<NetCashDelta> = net_deltas
            .iter()
            .map(|(owner, delta)| NetCashDelta {
                batch_id: batch_id.clone(),
                owner_pubkey: owner.clone(),
                delta_lamports: *delta,
            })
            .collect();

        self.store
            .persist_batch_atomically(&batch, &items, &delta_rows, &outcome.consumed, &outcome.dropped)
            .await?;

        if !outcome.dropped.is_empty() {
            warn!(
                batch_id = %batch_id,
                rejected_in_netting = outcome.dropped.len(),
                "stale intents dropped within batch"
            );
        }
        info!(
            batch_id = %batch_id,
            num_intents,
            num_items_settled,
            num_wallets,
            compression_ratio = batch.compression_ratio(),
            "batch netted"
        );
        Ok(Some(batch))
    }
}
