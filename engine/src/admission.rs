//! Intent admission.
//!
//! [`AdmissionController::submit_intent`] runs the decision procedure in a
//! fixed order: shape, session policy, signature, volume cap, uniqueness,
//! pending-item conflict, store write. The first failing step decides the
//! rejection; every rejection is final and surfaced to the caller
//! verbatim.
//!
//! The nonce/id/conflict checks and the store write run inside one async
//! critical section so a concurrent submission cannot slip between the
//! conflict probe and the insert. Overall fan-in is bounded by a
//! semaphore; rejections are logged at `debug` only.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use tokio::sync::{Mutex, Semaphore};
use tracing::debug;

use crate::error::{AdmissionError, StoreError};
use crate::policy::SessionPolicyRegistry;
use crate::store::Store;
use crate::types::TradeIntent;

/// Transport-facing admission outcome: `{accepted, reason?}`.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AdmissionDecision {
    pub fn from_result(result: &Result<(), AdmissionError>) -> Self {
        match result {
            Ok(()) => Self { accepted: true, reason: None },
            Err(e) => Self { accepted: false, reason: Some(e.to_string()) },
        }
    }
}

pub struct AdmissionController {
    store: Arc<Store>,
    registry: Arc<SessionPolicyRegistry>,
    require_signature: bool,
    fan_in: Semaphore,
    /// Serializes the uniqueness/conflict window and the volume cache so
    /// admission reads its own writes.
    gate: Mutex<()>,
    /// Per-session cumulative admitted volume, faulted in from the Store.
    volumes: Mutex<HashMap<String, u128>>,
}

impl AdmissionController {
    pub fn new(
        store: Arc<Store>,
        registry: Arc<SessionPolicyRegistry>,
        require_signature: bool,
        max_parallel: u32,
    ) -> Self {
        Self {
            store,
            registry,
            require_signature,
            fan_in: Semaphore::new(max_parallel.max(1) as usize),
            gate: Mutex::new(()),
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one intent.
    pub async fn submit_intent(&self, intent: TradeIntent) -> Result<(), AdmissionError> {
        let _permit = self
            .fan_in
            .acquire()
            .await
            .map_err(|_| StoreError::Fatal("admission controller shut down".into()))?;

        let result = self.decide(&intent).await;
        if let Err(rejection) = &result {
            debug!(intent_id = %intent.id, %rejection, "intent rejected");
        }
        result
    }

    async fn decide(&self, intent: &TradeIntent) -> Result<(), AdmissionError> {
        // 1. Shape.
        self.check_shape(intent)?;

        // 2. Live policy allowing this action.
        let policy = self
            .registry
            .lookup(&intent.session_pubkey)
            .await
            .ok_or(AdmissionError::UnknownOrExpiredSession)?;
        if !policy.allows(intent.intent_type) {
            return Err(AdmissionError::ActionNotAllowed(intent.intent_type));
        }

        // 3. Authorization.
        if self.require_signature {
            verify_signature(intent)?;
        }

        let _gate = self.gate.lock().await;

        // 4. Volume cap over everything this session has ever admitted.
        {
            let mut volumes = self.volumes.lock().await;
            let current = match volumes.get(&intent.session_pubkey) {
                Some(v) => *v,
                None => {
                    let loaded = self.store.session_volume(&intent.session_pubkey).await?;
                    volumes.insert(intent.session_pubkey.clone(), loaded);
                    loaded
                }
            };
            if current + intent.amount_lamports as u128 > policy.max_volume_lamports {
                return Err(AdmissionError::VolumeCapExceeded);
            }
        }

        // 5/6. Uniqueness. An identical resubmission duplicates both its
        // id and its nonce; the id rejection wins so callers can tell a
        // replay from a nonce collision.
        if self.store.intent_id_exists(&intent.id).await? {
            return Err(AdmissionError::DuplicateId);
        }
        if self
            .store
            .nonce_used(&intent.session_pubkey, intent.nonce)
            .await?
        {
            return Err(AdmissionError::DuplicateNonce);
        }

        // 7. Same-owner pending sell of the same item. Cross-owner
        // duplicates are admitted; netting resolves them.
        if self
            .store
            .has_pending_conflict(&intent.item_id, &intent.from)
            .await?
        {
            return Err(AdmissionError::ConflictingPendingIntent);
        }

        // 8. The store's UNIQUE constraints re-check 5/6 at commit; a
        // collision maps to the same rejection.
        match self.store.insert_intent(intent).await {
            Ok(()) => {}
            Err(StoreError::DuplicateId) => return Err(AdmissionError::DuplicateId),
            Err(StoreError::DuplicateNonce) => return Err(AdmissionError::DuplicateNonce),
            Err(e) => return Err(e.into()),
        }

        let mut volumes = self.volumes.lock().await;
        if let Some(total) = volumes.get_mut(&intent.session_pubkey) {
            *total += intent.amount_lamports as u128;
        }
        Ok(())
    }

    fn check_shape(&self, intent: &TradeIntent) -> Result<(), AdmissionError> {
        let malformed = |reason: &str| AdmissionError::MalformedIntent(reason.to_string());

        if intent.id.is_empty() {
            return Err(malformed("missing id"));
        }
        if intent.session_pubkey.is_empty() {
            return Err(malformed("missing session_pubkey"));
        }
        if intent.item_id.is_empty() {
            return Err(malformed("missing item_id"));
        }
        if intent.from.is_empty() || intent.to.is_empty() {
            return Err(malformed("missing from/to owner"));
        }
        if intent.from != intent.owner_pubkey {
            return Err(malformed("from must equal owner_pubkey"));
        }
        if intent.from == intent.to {
            return Err(malformed("from and to must differ"));
        }
        if intent.amount_lamports == 0 {
            return Err(malformed("amount_lamports must be positive"));
        }
        if intent.amount_lamports > i64::MAX as u64 {
            return Err(malformed("amount_lamports out of range"));
        }
        if intent.nonce > i64::MAX as u64 {
            return Err(malformed("nonce out of range"));
        }
        if self.require_signature && intent.signature.is_empty() {
            return Err(malformed("missing signature"));
        }
        Ok(())
    }
}

fn verify_signature(intent: &TradeIntent) -> Result<(), AdmissionError> {
    let session_key =
        Pubkey::from_str(&intent.session_pubkey).map_err(|_| AdmissionError::BadSignature)?;
    let signature =
        Signature::from_str(&intent.signature).map_err(|_| AdmissionError::BadSignature)?;
    if signature.verify(session_key.as_ref(), &intent.signing_bytes()) {
        Ok(())
    } else {
        Err(AdmissionError::BadSignature)
    }
}
