//! Core data model: intents, session key policies, batches and their
//! settlement outputs.
//!
//! Identifiers (`id`, `batch_id`, `item_id`, owner and session pubkeys) are
//! opaque strings at every interface boundary. The Store owns all rows;
//! anything held in memory elsewhere is a derived cache.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unix seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// The kind of trade an intent authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Trade,
    Bid,
    BuyNow,
}

impl IntentType {
    pub const ALL: [IntentType; 3] = [IntentType::Trade, IntentType::Bid, IntentType::BuyNow];

    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::Trade => "trade",
            IntentType::Bid => "bid",
            IntentType::BuyNow => "buy_now",
        }
    }
}

impl fmt::Display for IntentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trade" => Ok(IntentType::Trade),
            "bid" => Ok(IntentType::Bid),
            "buy_now" => Ok(IntentType::BuyNow),
            other => Err(format!("unrecognized intent type: {other}")),
        }
    }
}

/// A signed authorization to move one item and pay a price.
///
/// Immutable after admission. `from` must equal `owner_pubkey`; the
/// delegated `session_pubkey` signs on the owner's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeIntent {
    /// Globally unique opaque identifier (UUID-class).
    pub id: String,
    /// Delegated key that signed this intent.
    pub session_pubkey: String,
    /// The real owner authorizing the session.
    pub owner_pubkey: String,
    /// Opaque item identifier.
    pub item_id: String,
    /// Current owner giving up the item; must equal `owner_pubkey`.
    pub from: String,
    /// Owner receiving the item and paying `amount_lamports`.
    pub to: String,
    /// Price paid by `to` to `from`, in lamports.
    pub amount_lamports: u64,
    /// Per-session monotonic counter; `(session_pubkey, nonce)` is unique.
    pub nonce: u64,
    /// Authorization blob over [`TradeIntent::signing_bytes`].
    pub signature: String,
    /// Unix seconds.
    pub created_at: i64,
    pub intent_type: IntentType,
}

impl TradeIntent {
    /// Canonical byte encoding covered by `signature`.
    ///
    /// Field order and separators are fixed; the transport layer and any
    /// client SDK must produce the identical encoding before signing.
    pub fn signing_bytes(&self) -> Vec<u8> {
        format!(
            "netsettle/intent/v1|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.id,
            self.session_pubkey,
            self.item_id,
            self.from,
            self.to,
            self.amount_lamports,
            self.nonce,
            self.created_at,
            self.intent_type,
        )
        .into_bytes()
    }
}

/// A short-lived delegated-signer authorization registered by an owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeyPolicy {
    pub owner_pubkey: String,
    pub session_pubkey: String,
    /// Cap on cumulative intent volume admitted under this session.
    pub max_volume_lamports: u128,
    /// Unix seconds; a policy past this instant is never returned.
    pub expires_at: i64,
    pub created_at: i64,
    pub allowed_actions: Vec<IntentType>,
}

impl SessionKeyPolicy {
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn allows(&self, intent_type: IntentType) -> bool {
        self.allowed_actions.contains(&intent_type)
    }
}

/// A closed set of intents netted together and committed in one on-chain
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NettingBatch {
    pub batch_id: String,
    /// Deterministic 32-bit projection of `batch_id`; both forms are
    /// persisted because the on-chain program takes an integer.
    pub batch_id_numeric: u32,
    pub created_at: i64,
    pub netted_at: Option<i64>,
    pub settled_at: Option<i64>,
    pub settled: bool,
    /// On-chain transaction signature; present iff `settled`.
    pub tx_signature: Option<String>,
    /// 32-byte commitment over the canonical batch serialization.
    pub batch_hash: [u8; 32],
    /// Consumed intent ids in consumption order.
    pub intent_ids: Vec<String>,
    pub num_intents: u64,
    pub num_items_settled: u64,
    /// Distinct owners appearing in the batch's net cash deltas.
    pub num_wallets: u64,
}

impl NettingBatch {
    /// Netting efficiency: intents consumed per item settled.
    pub fn compression_ratio(&self) -> f64 {
        if self.num_items_settled == 0 {
            0.0
        } else {
            self.num_intents as f64 / self.num_items_settled as f64
        }
    }
}

/// Final owner of one item within one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledItem {
    pub batch_id: String,
    pub item_id: String,
    pub final_owner: String,
}

/// Net lamport obligation of one owner within one batch.
///
/// Positive means the owner is owed lamports; the deltas of a batch sum
/// to zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetCashDelta {
    pub batch_id: String,
    pub owner_pubkey: String,
    pub delta_lamports: i128,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent() -> TradeIntent {
        TradeIntent {
            id: "intent-1".into(),
            session_pubkey: "session-1".into(),
            owner_pubkey: "alice".into(),
            item_id: "item-1".into(),
            from: "alice".into(),
            to: "bob".into(),
            amount_lamports: 42,
            nonce: 7,
            signature: String::new(),
            created_at: 1_700_000_000,
            intent_type: IntentType::Trade,
        }
    }

    #[test]
    fn intent_type_text_roundtrip() {
        for ty in IntentType::ALL {
            assert_eq!(ty.as_str().parse::<IntentType>().unwrap(), ty);
        }
        assert!("swap".parse::<IntentType>().is_err());
    }

    #[test]
    fn signing_bytes_are_deterministic() {
        let a = intent();
        let b = intent();
        assert_eq!(a.signing_bytes(), b.signing_bytes());
    }

    #[test]
    fn signing_bytes_bind_every_signed_field() {
        let base = intent().signing_bytes();

        let mut changed = intent();
        changed.amount_lamports = 43;
        assert_ne!(base, changed.signing_bytes());

        let mut changed = intent();
        changed.nonce = 8;
        assert_ne!(base, changed.signing_bytes());

        let mut changed = intent();
        changed.intent_type = IntentType::Bid;
        assert_ne!(base, changed.signing_bytes());

        // The signature blob itself is not part of the signed encoding.
        let mut changed = intent();
        changed.signature = "sig".into();
        assert_eq!(base, changed.signing_bytes());
    }

    #[test]
    fn policy_expiry_and_actions() {
        let policy = SessionKeyPolicy {
            owner_pubkey: "alice".into(),
            session_pubkey: "session-1".into(),
            max_volume_lamports: 1_000,
            expires_at: 2_000,
            created_at: 1_000,
            allowed_actions: vec![IntentType::Trade, IntentType::BuyNow],
        };
        assert!(!policy.is_expired(1_999));
        assert!(policy.is_expired(2_000));
        assert!(policy.allows(IntentType::Trade));
        assert!(!policy.allows(IntentType::Bid));
    }

    #[test]
    fn compression_ratio() {
        let batch = NettingBatch {
            batch_id: "b".into(),
            batch_id_numeric: 1,
            created_at: 0,
            netted_at: Some(0),
            settled_at: None,
            settled: false,
            tx_signature: None,
            batch_hash: [0u8; 32],
            intent_ids: vec![],
            num_intents: 30,
            num_items_settled: 10,
            num_wallets: 4,
        };
        assert_eq!(batch.compression_ratio(), 3.0);
    }
}
