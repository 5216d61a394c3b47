//! Cross-module scenario tests: the full admission -> netting ->
//! settlement pipeline over a real (in-memory or on-disk) store and a
//! scripted chain backend.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;

use crate::commitment;
use crate::config::EngineConfig;
use crate::service::Engine;
use crate::settlement::testing::MockChain;
use crate::settlement::SettlementClient;
use crate::store::Store;
use crate::types::{now_ts, IntentType, NettingBatch, SessionKeyPolicy, TradeIntent};

struct Wallet {
    owner: String,
    session: Keypair,
    next_nonce: u64,
}

impl Wallet {
    fn new() -> Self {
        Self {
            owner: Keypair::new().pubkey().to_string(),
            session: Keypair::new(),
            next_nonce: 1,
        }
    }

    async fn register(&self, engine: &Engine, max_volume: u128) {
        engine
            .registry
            .register(
                &engine.store,
                SessionKeyPolicy {
                    owner_pubkey: self.owner.clone(),
                    session_pubkey: self.session.pubkey().to_string(),
                    max_volume_lamports: max_volume,
                    expires_at: now_ts() + 3_600,
                    created_at: now_ts(),
                    allowed_actions: vec![IntentType::Trade],
                },
            )
            .await
            .unwrap();
    }

    fn sell(&mut self, id: &str, item: &str, to: &str, amount: u64, created_at: i64) -> TradeIntent {
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        let mut intent = TradeIntent {
            id: id.to_string(),
            session_pubkey: self.session.pubkey().to_string(),
            owner_pubkey: self.owner.clone(),
            item_id: item.to_string(),
            from: self.owner.clone(),
            to: to.to_string(),
            amount_lamports: amount,
            nonce,
            signature: String::new(),
            created_at,
            intent_type: IntentType::Trade,
        };
        intent.signature = self.session.sign_message(&intent.signing_bytes()).to_string();
        intent
    }
}

async fn engine_with_mock_chain(dir: &std::path::Path) -> (Engine, Arc<MockChain>) {
    let mut config = EngineConfig::default();
    config.store.path = dir.join("netsettle.db");
    config.batch.min_intents = 1;
    config.batch.max_intents = 2_000;
    config.settlement.backoff_initial_ms = 1;
    config.settlement.backoff_cap_ms = 2;
    let chain = Arc::new(MockChain::new());
    let engine = Engine::bootstrap(
        config,
        Some(Arc::clone(&chain) as Arc<dyn SettlementClient>),
    )
    .await
    .unwrap();
    (engine, chain)
}

/// Invariant 5: recompute the commitment from persisted rows, byte for
/// byte.
async fn recompute_hash(store: &Store, batch: &NettingBatch) -> [u8; 32] {
    let items = store.get_settled_items(&batch.batch_id).await.unwrap();
    let deltas = store.get_net_deltas(&batch.batch_id).await.unwrap();
    let owners: Vec<(String, String)> = items
        .into_iter()
        .map(|i| (i.item_id, i.final_owner))
        .collect();
    let delta_pairs: Vec<(String, i128)> = deltas
        .into_iter()
        .map(|d| (d.owner_pubkey, d.delta_lamports))
        .collect();
    commitment::batch_hash(&owners, &delta_pairs, batch.num_intents, batch.num_items_settled)
}

#[tokio::test]
async fn triangle_chain_settles_end_to_end() {
    // S1: A->B, B->C, C->D on item X for 10 each, through the whole
    // pipeline.
    let dir = tempfile::tempdir().unwrap();
    let (engine, chain) = engine_with_mock_chain(dir.path()).await;

    let mut a = Wallet::new();
    let mut b = Wallet::new();
    let mut c = Wallet::new();
    let d = Wallet::new();
    for w in [&a, &b, &c] {
        w.register(&engine, 1_000_000).await;
    }

    let base = now_ts() - 60;
    engine.admission.submit_intent(a.sell("t1", "item-x", &b.owner, 10, base)).await.unwrap();
    engine.admission.submit_intent(b.sell("t2", "item-x", &c.owner, 10, base + 1)).await.unwrap();
    engine.admission.submit_intent(c.sell("t3", "item-x", &d.owner, 10, base + 2)).await.unwrap();

    let batch = engine.force_close_current_batch().await.unwrap().unwrap();
    assert_eq!(batch.num_intents, 3);
    assert_eq!(batch.num_items_settled, 1);
    assert_eq!(batch.num_wallets, 2);
    assert_eq!(batch.intent_ids, vec!["t1", "t2", "t3"]);
    assert_eq!(batch.compression_ratio(), 3.0);

    // One settled item: X belongs to D. B and C netted to zero and are
    // omitted from the deltas.
    let items = engine.store.get_settled_items(&batch.batch_id).await.unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].final_owner, d.owner);

    let deltas = engine.store.get_net_deltas(&batch.batch_id).await.unwrap();
    assert_eq!(deltas.len(), 2);
    let delta_of = |owner: &str| {
        deltas
            .iter()
            .find(|x| x.owner_pubkey == owner)
            .map(|x| x.delta_lamports)
    };
    assert_eq!(delta_of(&a.owner), Some(10));
    assert_eq!(delta_of(&d.owner), Some(-10));

    // S5: the persisted hash reproduces from persisted rows.
    assert_eq!(recompute_hash(&engine.store, &batch).await, batch.batch_hash);

    // Settle on-chain; the payload carries every parseable owner.
    let driver = engine.driver.as_ref().unwrap();
    let signature = driver.run_once().await.unwrap().unwrap();
    let payloads = chain.submissions();
    assert_eq!(payloads.len(), 1);
    assert_eq!(payloads[0].batch_id, batch.batch_id_numeric);
    assert_eq!(payloads[0].batch_hash, batch.batch_hash);
    assert_eq!(payloads[0].items.len(), 1);
    assert_eq!(payloads[0].cash_deltas.len(), 2);

    let settled = engine.store.get_batch(&batch.batch_id).await.unwrap().unwrap();
    assert!(settled.settled);
    assert_eq!(settled.tx_signature, Some(signature));
    assert!(settled.settled_at.is_some());

    // Nothing left to do.
    assert!(driver.run_once().await.unwrap().is_none());
    assert_eq!(chain.submission_count(), 1);
}

#[tokio::test]
async fn bulk_chains_compress_and_conserve() {
    // S4: 1,000 chain intents across 100 items and 50 wallets.
    let dir = tempfile::tempdir().unwrap();
    let (engine, chain) = engine_with_mock_chain(dir.path()).await;

    let mut wallets: Vec<Wallet> = (0..50).map(|_| Wallet::new()).collect();
    for w in &wallets {
        w.register(&engine, u128::MAX).await;
    }
    let owners: Vec<String> = wallets.iter().map(|w| w.owner.clone()).collect();

    let mut rng = StdRng::seed_from_u64(7);
    let base = now_ts() - 600;
    let mut seq = 0i64;
    for item_idx in 0..100usize {
        let item = format!("item-{item_idx}");
        let mut holder = item_idx % 50;
        for _hop in 0..10 {
            let next = (holder + 1) % 50;
            let amount: u64 = rng.gen_range(1..1_000);
            seq += 1;
            let to = owners[next].clone();
            let intent =
                wallets[holder].sell(&format!("t{seq}"), &item, &to, amount, base + seq);
            engine.admission.submit_intent(intent).await.unwrap();
            holder = next;
        }
    }

    let batch = engine.force_close_current_batch().await.unwrap().unwrap();
    assert_eq!(batch.num_intents, 1_000);
    assert_eq!(batch.num_items_settled, 100);
    assert!(batch.num_wallets <= 50);
    assert_eq!(batch.compression_ratio(), 10.0);

    // Invariant 1: deltas conserve. Invariant 2: items are unique per
    // batch.
    let deltas = engine.store.get_net_deltas(&batch.batch_id).await.unwrap();
    assert!(deltas.len() <= 50);
    assert!(deltas.iter().all(|d| d.delta_lamports != 0));
    let sum: i128 = deltas.iter().map(|d| d.delta_lamports).sum();
    assert_eq!(sum, 0);

    let items = engine.store.get_settled_items(&batch.batch_id).await.unwrap();
    assert_eq!(items.len(), 100);
    let mut item_ids: Vec<&str> = items.iter().map(|i| i.item_id.as_str()).collect();
    item_ids.dedup();
    assert_eq!(item_ids.len(), 100);

    // Every chain's final owner is the last wallet it walked to.
    for item in &items {
        let item_idx: usize = item.item_id.strip_prefix("item-").unwrap().parse().unwrap();
        let expected_final = (item_idx % 50 + 10) % 50;
        assert_eq!(item.final_owner, owners[expected_final]);
    }

    // S5 at scale, then settle.
    assert_eq!(recompute_hash(&engine.store, &batch).await, batch.batch_hash);
    let driver = engine.driver.as_ref().unwrap();
    driver.run_once().await.unwrap().unwrap();
    assert_eq!(chain.submission_count(), 1);
    assert_eq!(chain.submissions()[0].items.len(), 100);
}

#[tokio::test]
async fn duplicate_resubmission_leaves_one_row_and_one_consumption() {
    // Invariant 7: the same intent submitted twice stores one row; the
    // second decision is a DuplicateId rejection.
    let dir = tempfile::tempdir().unwrap();
    let (engine, _chain) = engine_with_mock_chain(dir.path()).await;

    let mut a = Wallet::new();
    let b = Wallet::new();
    a.register(&engine, 1_000).await;

    let intent = a.sell("t1", "item-x", &b.owner, 10, now_ts() - 10);
    engine.admission.submit_intent(intent.clone()).await.unwrap();
    let rejection = engine.admission.submit_intent(intent).await.unwrap_err();
    assert_eq!(rejection, crate::error::AdmissionError::DuplicateId);

    let batch = engine.force_close_current_batch().await.unwrap().unwrap();
    assert_eq!(batch.num_intents, 1);

    // The consumed intent cannot be resubmitted either; its id and nonce
    // remain burned.
    let mut replay = a.sell("t1", "item-x", &b.owner, 10, now_ts());
    replay.nonce = 1;
    replay.signature = a.session.sign_message(&replay.signing_bytes()).to_string();
    assert!(engine.admission.submit_intent(replay).await.is_err());
}

#[tokio::test]
async fn settlement_survives_a_driver_restart() {
    // Invariant 8: a new driver over the same store never re-submits a
    // settled batch.
    let dir = tempfile::tempdir().unwrap();
    let (engine, chain) = engine_with_mock_chain(dir.path()).await;

    let mut a = Wallet::new();
    let b = Wallet::new();
    a.register(&engine, 1_000).await;
    engine
        .admission
        .submit_intent(a.sell("t1", "item-x", &b.owner, 10, now_ts() - 10))
        .await
        .unwrap();
    let batch = engine.force_close_current_batch().await.unwrap().unwrap();
    engine.driver.as_ref().unwrap().run_once().await.unwrap().unwrap();
    assert_eq!(chain.submission_count(), 1);
    drop(engine);

    // Same database, fresh process.
    let mut config = EngineConfig::default();
    config.store.path = dir.path().join("netsettle.db");
    let chain2 = Arc::new(MockChain::new());
    let restarted = Engine::bootstrap(
        config,
        Some(Arc::clone(&chain2) as Arc<dyn SettlementClient>),
    )
    .await
    .unwrap();

    let driver = restarted.driver.as_ref().unwrap();
    assert!(driver.run_once().await.unwrap().is_none());
    let replayed = driver.settle_batch(&batch.batch_id).await.unwrap();
    assert_eq!(chain2.submission_count(), 0);
    assert!(!replayed.is_empty());
}
