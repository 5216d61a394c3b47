//! Off-chain netting and settlement engine.
//!
//! A marketplace sequencer that admits signed trade intents from delegated
//! session keys, periodically closes a batch, collapses the batch's item
//! ownership chains and per-wallet cash obligations into a minimal set of
//! final assignments, persists the result durably, and submits exactly one
//! on-chain settlement transaction per batch carrying a 32-byte commitment
//! hash.
//!
//! Data flow:
//!
//! ```text
//! intents -> AdmissionController -> Store -> NettingEngine -> Store
//!                                                 |
//!                                       SettlementDriver -> on-chain program
//! ```
//!
//! The engine runs as a single process with cooperative concurrency: the
//! netting engine nets one batch at a time and the settlement driver submits
//! one transaction at a time. All durable state lives in the [`Store`];
//! everything held in memory (session policies, per-session volume totals)
//! is a derived cache.

pub mod admission;
pub mod commitment;
pub mod config;
pub mod error;
pub mod netting;
pub mod policy;
pub mod service;
pub mod settlement;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use admission::AdmissionController;
pub use config::EngineConfig;
pub use error::{AdmissionError, ChainError, NettingError, SettlementError, StoreError};
pub use netting::{NettingEngine, Trigger};
pub use policy::SessionPolicyRegistry;
pub use service::Engine;
pub use settlement::SettlementDriver;
pub use store::Store;
pub use types::{
    IntentType, NetCashDelta, NettingBatch, SessionKeyPolicy, SettledItem, TradeIntent,
};
