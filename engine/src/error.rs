//! Error taxonomy.
//!
//! Admission rejections are client-caused and non-retriable: their
//! `Display` strings are surfaced to the caller verbatim and they are
//! never logged as errors. Netting assertions indicate corruption and
//! abort the batch. Store and chain errors split into transient
//! (bounded retry) and permanent (quarantine / operator) classes.

use thiserror::Error;

use crate::types::IntentType;

/// Why an intent was refused admission. All rejections are final; the
/// caller is expected to regenerate and resubmit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("malformed intent: {0}")]
    MalformedIntent(String),
    #[error("unknown or expired session key")]
    UnknownOrExpiredSession,
    #[error("intent type {0} not allowed by session policy")]
    ActionNotAllowed(IntentType),
    #[error("signature does not verify against session key")]
    BadSignature,
    #[error("session volume cap exceeded")]
    VolumeCapExceeded,
    #[error("nonce already used for this session")]
    DuplicateNonce,
    #[error("intent id already used")]
    DuplicateId,
    #[error("a pending intent already sells this item from the same owner")]
    ConflictingPendingIntent,
    #[error("store unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Store failures. Uniqueness collisions carry their own variants so
/// admission can map them onto the matching rejection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("duplicate intent id")]
    DuplicateId,
    #[error("duplicate (session, nonce)")]
    DuplicateNonce,
    #[error("batch already settled with a different signature")]
    AlreadySettled,
    #[error("transient store error: {0}")]
    Transient(String),
    #[error("fatal store error: {0}")]
    Fatal(String),
}

/// Netting failures. The assertion variants indicate corruption: the
/// batch is aborted, nothing is persisted, and the operator is alerted.
#[derive(Debug, Error)]
pub enum NettingError {
    #[error("net cash deltas sum to {0}, expected 0")]
    DeltaSumNotZero(i128),
    #[error("formed batch consumed no intents")]
    EmptyBatchAfterFormation,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// On-chain submission failures, classified for the retry loop.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// Network trouble, RPC 5xx, expired blockhash. Retried with backoff.
    #[error("transient chain error: {0}")]
    Transient(String),
    /// The program already accepted this batch id. Success for the
    /// driver; `tx_signature` is the original transaction when the chain
    /// can report it.
    #[error("batch already settled on-chain")]
    AlreadySettled { tx_signature: Option<String> },
    /// Hash mismatch, unauthorized signer, malformed payload. Never
    /// retried.
    #[error("permanent chain error: {0}")]
    Permanent(String),
}

/// Settlement driver failures surfaced to the operator.
#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("batch {0} quarantined after exhausting the retry budget")]
    Quarantined(String),
}

impl SettlementError {
    /// True for the unrecoverable on-chain mismatch class that maps to
    /// operator exit code 2.
    pub fn is_permanent_chain(&self) -> bool {
        matches!(self, SettlementError::Chain(ChainError::Permanent(_)))
    }
}
