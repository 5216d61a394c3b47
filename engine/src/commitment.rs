//! Canonical batch serialization and commitment hashing.
//!
//! The commitment is part of the on-chain contract: the program re-derives
//! the same 32 bytes from the payload it receives, and a single byte of
//! drift is a protocol break. The canonical form is therefore fixed here,
//! byte for byte:
//!
//! ```text
//! i|<item_id>|<final_owner>\n        items, sorted by item_id ascending
//! d|<owner_pubkey>|<delta>\n         deltas, sorted by owner ascending,
//!                                    delta as a signed decimal string
//! n|<num_intents>\n                  decimal
//! m|<num_items_settled>\n            decimal
//! ```
//!
//! `batch_hash` is SHA-256 over that byte string. The numeric projections
//! of string identifiers reuse the same hash: the on-chain program takes
//! integers, so `batch_id` maps onto the low 31 bits and `item_id` onto
//! 64 bits of their SHA-256 digests.

use sha2::{Digest, Sha256};

/// SHA-256 commitment over the canonical serialization of a netted batch.
///
/// `final_owners` and `net_deltas` may arrive in any order; they are
/// sorted here so callers do not need to agree on map iteration order.
pub fn batch_hash(
    final_owners: &[(String, String)],
    net_deltas: &[(String, i128)],
    num_intents: u64,
    num_items_settled: u64,
) -> [u8; 32] {
    let mut items: Vec<&(String, String)> = final_owners.iter().collect();
    items.sort_by(|a, b| a.0.cmp(&b.0));
    let mut deltas: Vec<&(String, i128)> = net_deltas.iter().collect();
    deltas.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (item_id, final_owner) in items {
        hasher.update(b"i|");
        hasher.update(item_id.as_bytes());
        hasher.update(b"|");
        hasher.update(final_owner.as_bytes());
        hasher.update(b"\n");
    }
    for (owner, delta) in deltas {
        hasher.update(b"d|");
        hasher.update(owner.as_bytes());
        hasher.update(b"|");
        hasher.update(delta.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hasher.update(b"n|");
    hasher.update(num_intents.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.update(b"m|");
    hasher.update(num_items_settled.to_string().as_bytes());
    hasher.update(b"\n");
    hasher.finalize().into()
}

/// Deterministic 32-bit projection of a string batch id (high bit clear;
/// the on-chain instruction takes a u32). Lossy: collisions on the 31-bit
/// domain are caught by the program's already-used check.
pub fn batch_id_numeric(batch_id: &str) -> u32 {
    let digest = Sha256::digest(batch_id.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) & 0x7fff_ffff
}

/// Deterministic 64-bit projection of a string item id for the on-chain
/// payload.
pub fn item_id_numeric(item_id: &str) -> u64 {
    let digest = Sha256::digest(item_id.as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owners() -> Vec<(String, String)> {
        vec![
            ("item-b".to_string(), "dave".to_string()),
            ("item-a".to_string(), "carol".to_string()),
        ]
    }

    fn deltas() -> Vec<(String, i128)> {
        vec![
            ("bob".to_string(), -25),
            ("alice".to_string(), 25),
        ]
    }

    #[test]
    fn hash_is_input_order_insensitive() {
        let forward = batch_hash(&owners(), &deltas(), 3, 2);
        let mut reversed_owners = owners();
        reversed_owners.reverse();
        let mut reversed_deltas = deltas();
        reversed_deltas.reverse();
        let reversed = batch_hash(&reversed_owners, &reversed_deltas, 3, 2);
        assert_eq!(forward, reversed);
    }

    #[test]
    fn hash_binds_every_component() {
        let base = batch_hash(&owners(), &deltas(), 3, 2);

        let mut other = owners();
        other[0].1 = "eve".to_string();
        assert_ne!(batch_hash(&other, &deltas(), 3, 2), base);

        let mut other = deltas();
        other[0].1 = -26;
        assert_ne!(batch_hash(&owners(), &other, 3, 2), base);

        assert_ne!(batch_hash(&owners(), &deltas(), 4, 2), base);
        assert_ne!(batch_hash(&owners(), &deltas(), 3, 3), base);
    }

    #[test]
    fn hash_matches_manual_canonical_form() {
        let canonical = "i|item-a|carol\ni|item-b|dave\nd|alice|25\nd|bob|-25\nn|3\nm|2\n";
        let expected: [u8; 32] = Sha256::digest(canonical.as_bytes()).into();
        assert_eq!(batch_hash(&owners(), &deltas(), 3, 2), expected);
    }

    #[test]
    fn negative_deltas_serialize_with_sign() {
        // A delta of -25 and one of 25 must not canonicalize identically.
        let positive = batch_hash(&[], &[("alice".to_string(), 25)], 1, 1);
        let negative = batch_hash(&[], &[("alice".to_string(), -25)], 1, 1);
        assert_ne!(positive, negative);
    }

    #[test]
    fn numeric_projections_are_stable_and_in_range() {
        let a = batch_id_numeric("0d9cdad1-9f5c-4e3a-9c55-2f6a8b3a6d01");
        let b = batch_id_numeric("0d9cdad1-9f5c-4e3a-9c55-2f6a8b3a6d01");
        assert_eq!(a, b);
        assert!(a <= i32::MAX as u32);
        assert_ne!(a, batch_id_numeric("0d9cdad1-9f5c-4e3a-9c55-2f6a8b3a6d02"));

        assert_eq!(item_id_numeric("item-1"), item_id_numeric("item-1"));
        assert_ne!(item_id_numeric("item-1"), item_id_numeric("item-2"));
    }
}
