//! Durable persistence over SQLite.
//!
//! The Store owns every row: trade intents, session key policies, netting
//! batches and their settled items / net cash deltas. Writes are
//! serializable at the row level (WAL journal, single-writer SQLite), and
//! [`Store::persist_batch_atomically`] is one transaction: either the
//! whole batch lands or none of it does.
//!
//! 128-bit quantities (`max_volume_lamports`, `delta_lamports`) are stored
//! as decimal TEXT; SQLite integers are 64-bit, and admission caps every
//! 64-bit column at `i64::MAX` so INTEGER columns stay exact.

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::Row;

use crate::error::StoreError;
use crate::types::{
    now_ts, NetCashDelta, NettingBatch, SessionKeyPolicy, SettledItem, TradeIntent,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS trade_intents (
        id              TEXT PRIMARY KEY,
        session_pubkey  TEXT NOT NULL,
        owner_pubkey    TEXT NOT NULL,
        item_id         TEXT NOT NULL,
        from_owner      TEXT NOT NULL,
        to_owner        TEXT NOT NULL,
        amount_lamports INTEGER NOT NULL,
        nonce           INTEGER NOT NULL,
        signature       TEXT NOT NULL,
        created_at      INTEGER NOT NULL,
        intent_type     TEXT NOT NULL,
        batch_id        TEXT,
        dropped         INTEGER NOT NULL DEFAULT 0,
        UNIQUE (session_pubkey, nonce)
    )",
    "CREATE INDEX IF NOT EXISTS idx_intents_pending
        ON trade_intents (created_at, id) WHERE batch_id IS NULL",
    "CREATE INDEX IF NOT EXISTS idx_intents_session
        ON trade_intents (session_pubkey)",
    "CREATE TABLE IF NOT EXISTS netting_batches (
        batch_id          TEXT PRIMARY KEY,
        batch_id_numeric  INTEGER NOT NULL,
        created_at        INTEGER NOT NULL,
        netted_at         INTEGER,
        settled_at        INTEGER,
        settled           INTEGER NOT NULL DEFAULT 0,
        tx_signature      TEXT,
        batch_hash        BLOB NOT NULL,
        intent_ids        TEXT NOT NULL,
        num_intents       INTEGER NOT NULL,
        num_items_settled INTEGER NOT NULL,
        num_wallets       INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_batches_unsettled
        ON netting_batches (created_at, batch_id) WHERE settled = 0",
    "CREATE TABLE IF NOT EXISTS settled_items (
        batch_id    TEXT NOT NULL,
        item_id     TEXT NOT NULL,
        final_owner TEXT NOT NULL,
        PRIMARY KEY (batch_id, item_id)
    )",
    "CREATE TABLE IF NOT EXISTS net_cash_deltas (
        batch_id       TEXT NOT NULL,
        owner_pubkey   TEXT NOT NULL,
        delta_lamports TEXT NOT NULL,
        PRIMARY KEY (batch_id, owner_pubkey)
    )",
    "CREATE TABLE IF NOT EXISTS session_key_policies (
        session_pubkey      TEXT PRIMARY KEY,
        owner_pubkey        TEXT NOT NULL,
        max_volume_lamports TEXT NOT NULL,
        expires_at          INTEGER NOT NULL,
        created_at          INTEGER NOT NULL,
        allowed_actions     TEXT NOT NULL
    )",
];

/// Durable store for intents, policies and batches.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database file and initialize the
    /// schema.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Fatal(format!("create store directory: {e}")))?;
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory database for tests. A single connection: every extra
    /// SQLite `:memory:` connection is a distinct database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(map_sqlx)?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(())
    }

    /// Insert an admitted intent. Uniqueness collisions surface as
    /// [`StoreError::DuplicateId`] / [`StoreError::DuplicateNonce`].
    pub async fn insert_intent(&self, intent: &TradeIntent) -> Result<(), StoreError> {
        let amount = to_i64(intent.amount_lamports, "amount_lamports")?;
        let nonce = to_i64(intent.nonce, "nonce")?;
        sqlx::query(
            "INSERT INTO trade_intents
                (id, session_pubkey, owner_pubkey, item_id, from_owner, to_owner,
                 amount_lamports, nonce, signature, created_at, intent_type)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&intent.id)
        .bind(&intent.session_pubkey)
        .bind(&intent.owner_pubkey)
        .bind(&intent.item_id)
        .bind(&intent.from)
        .bind(&intent.to)
        .bind(amount)
        .bind(nonce)
        .bind(&intent.signature)
        .bind(intent.created_at)
        .bind(intent.intent_type.as_str())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    /// Intents not yet assigned to any batch, oldest first by
    /// `(created_at, id)`.
    pub async fn load_pending_intents(&self, max: u32) -> Result<Vec<TradeIntent>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM trade_intents
             WHERE batch_id IS NULL
             ORDER BY created_at ASC, id ASC
             LIMIT ?",
        )
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(intent_from_row).collect()
    }

    /// Has this intent id ever been admitted?
    pub async fn intent_id_exists(&self, id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM trade_intents WHERE id = ? LIMIT 1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.is_some())
    }

    /// Has this `(session_pubkey, nonce)` pair ever been used?
    pub async fn nonce_used(&self, session_pubkey: &str, nonce: u64) -> Result<bool, StoreError> {
        let nonce = to_i64(nonce, "nonce")?;
        let row = sqlx::query(
            "SELECT 1 FROM trade_intents WHERE session_pubkey = ? AND nonce = ? LIMIT 1",
        )
        .bind(session_pubkey)
        .bind(nonce)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.is_some())
    }

    /// Admission conflict probe: is there a pending intent selling
    /// `item_id` from the same owner?
    pub async fn has_pending_conflict(
        &self,
        item_id: &str,
        from: &str,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT 1 FROM trade_intents
             WHERE batch_id IS NULL AND item_id = ? AND from_owner = ?
             LIMIT 1",
        )
        .bind(item_id)
        .bind(from)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.is_some())
    }

    /// Cumulative admitted volume for a session, settled or not.
    pub async fn session_volume(&self, session_pubkey: &str) -> Result<u128, StoreError> {
        let rows = sqlx::query(
            "SELECT amount_lamports FROM trade_intents WHERE session_pubkey = ?",
        )
        .bind(session_pubkey)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        let mut total: u128 = 0;
        for row in &rows {
            let amount: i64 = row.try_get("amount_lamports").map_err(map_sqlx)?;
            total += amount as u128;
        }
        Ok(total)
    }

    /// Write the batch row, its settled items, its net deltas, and stamp
    /// every consumed and dropped intent with the batch id, in one
    /// transaction. Any failure leaves no partial batch.
    pub async fn persist_batch_atomically(
        &self,
        batch: &NettingBatch,
        items: &[SettledItem],
        deltas: &[NetCashDelta],
        consumed_intent_ids: &[String],
        dropped_intent_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        sqlx::query(
            "INSERT INTO netting_batches
                (batch_id, batch_id_numeric, created_at, netted_at, settled_at,
                 settled, tx_signature, batch_hash, intent_ids,
                 num_intents, num_items_settled, num_wallets)
             VALUES (?, ?, ?, ?, NULL, 0, NULL, ?, ?, ?, ?, ?)",
        )
        .bind(&batch.batch_id)
        .bind(batch.batch_id_numeric as i64)
        .bind(batch.created_at)
        .bind(batch.netted_at)
        .bind(batch.batch_hash.to_vec())
        .bind(serde_json::to_string(&batch.intent_ids).map_err(fatal)?)
        .bind(batch.num_intents as i64)
        .bind(batch.num_items_settled as i64)
        .bind(batch.num_wallets as i64)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        for item in items {
            sqlx::query(
                "INSERT INTO settled_items (batch_id, item_id, final_owner) VALUES (?, ?, ?)",
            )
            .bind(&item.batch_id)
            .bind(&item.item_id)
            .bind(&item.final_owner)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        for delta in deltas {
            sqlx::query(
                "INSERT INTO net_cash_deltas (batch_id, owner_pubkey, delta_lamports)
                 VALUES (?, ?, ?)",
            )
            .bind(&delta.batch_id)
            .bind(&delta.owner_pubkey)
            .bind(delta.delta_lamports.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }

        for id in consumed_intent_ids {
            let result = sqlx::query(
                "UPDATE trade_intents SET batch_id = ? WHERE id = ? AND batch_id IS NULL",
            )
            .bind(&batch.batch_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            if result.rows_affected() != 1 {
                return Err(StoreError::Fatal(format!(
                    "intent {id} vanished from the pending set while persisting batch {}",
                    batch.batch_id
                )));
            }
        }

        for id in dropped_intent_ids {
            let result = sqlx::query(
                "UPDATE trade_intents SET batch_id = ?, dropped = 1
                 WHERE id = ? AND batch_id IS NULL",
            )
            .bind(&batch.batch_id)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
            if result.rows_affected() != 1 {
                return Err(StoreError::Fatal(format!(
                    "stale intent {id} vanished from the pending set while persisting batch {}",
                    batch.batch_id
                )));
            }
        }

        tx.commit().await.map_err(map_sqlx)
    }

    /// Record the on-chain settlement of a batch. Idempotent for a repeat
    /// with the same signature; a different signature is
    /// [`StoreError::AlreadySettled`].
    pub async fn mark_batch_settled(
        &self,
        batch_id: &str,
        tx_signature: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE netting_batches
             SET settled = 1, tx_signature = ?, settled_at = ?
             WHERE batch_id = ? AND settled = 0",
        )
        .bind(tx_signature)
        .bind(now_ts())
        .bind(batch_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // The single-statement guard did not fire: either the batch is
        // unknown or it is already settled.
        let row = sqlx::query("SELECT tx_signature FROM netting_batches WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match row {
            None => Err(StoreError::Fatal(format!("unknown batch {batch_id}"))),
            Some(row) => {
                let existing: Option<String> = row.try_get("tx_signature").map_err(map_sqlx)?;
                if existing.as_deref() == Some(tx_signature) {
                    Ok(())
                } else {
                    Err(StoreError::AlreadySettled)
                }
            }
        }
    }

    /// Oldest batch with `settled = false` and at least `min_intents`
    /// consumed intents.
    pub async fn find_oldest_unsettled_batch(
        &self,
        min_intents: u64,
    ) -> Result<Option<NettingBatch>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM netting_batches
             WHERE settled = 0 AND num_intents >= ?
             ORDER BY created_at ASC, batch_id ASC
             LIMIT 1",
        )
        .bind(min_intents as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        row.as_ref().map(batch_from_row).transpose()
    }

    pub async fn get_batch(&self, batch_id: &str) -> Result<Option<NettingBatch>, StoreError> {
        let row = sqlx::query("SELECT * FROM netting_batches WHERE batch_id = ?")
            .bind(batch_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(batch_from_row).transpose()
    }

    /// Settled items of a batch, sorted by item id.
    pub async fn get_settled_items(&self, batch_id: &str) -> Result<Vec<SettledItem>, StoreError> {
        let rows = sqlx::query(
            "SELECT batch_id, item_id, final_owner FROM settled_items
             WHERE batch_id = ? ORDER BY item_id ASC",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| {
                Ok(SettledItem {
                    batch_id: row.try_get("batch_id").map_err(map_sqlx)?,
                    item_id: row.try_get("item_id").map_err(map_sqlx)?,
                    final_owner: row.try_get("final_owner").map_err(map_sqlx)?,
                })
            })
            .collect()
    }

    /// Net cash deltas of a batch, sorted by owner.
    pub async fn get_net_deltas(&self, batch_id: &str) -> Result<Vec<NetCashDelta>, StoreError> {
        let rows = sqlx::query(
            "SELECT batch_id, owner_pubkey, delta_lamports FROM net_cash_deltas
             WHERE batch_id = ? ORDER BY owner_pubkey ASC",
        )
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| {
                let text: String = row.try_get("delta_lamports").map_err(map_sqlx)?;
                Ok(NetCashDelta {
                    batch_id: row.try_get("batch_id").map_err(map_sqlx)?,
                    owner_pubkey: row.try_get("owner_pubkey").map_err(map_sqlx)?,
                    delta_lamports: text
                        .parse::<i128>()
                        .map_err(|e| StoreError::Fatal(format!("corrupt delta_lamports: {e}")))?,
                })
            })
            .collect()
    }

    pub async fn upsert_policy(&self, policy: &SessionKeyPolicy) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO session_key_policies
                (session_pubkey, owner_pubkey, max_volume_lamports,
                 expires_at, created_at, allowed_actions)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (session_pubkey) DO UPDATE SET
                owner_pubkey = excluded.owner_pubkey,
                max_volume_lamports = excluded.max_volume_lamports,
                expires_at = excluded.expires_at,
                created_at = excluded.created_at,
                allowed_actions = excluded.allowed_actions",
        )
        .bind(&policy.session_pubkey)
        .bind(&policy.owner_pubkey)
        .bind(policy.max_volume_lamports.to_string())
        .bind(policy.expires_at)
        .bind(policy.created_at)
        .bind(serde_json::to_string(&policy.allowed_actions).map_err(fatal)?)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    pub async fn load_policies(&self) -> Result<Vec<SessionKeyPolicy>, StoreError> {
        let rows = sqlx::query("SELECT * FROM session_key_policies")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| {
                let volume: String = row.try_get("max_volume_lamports").map_err(map_sqlx)?;
                let actions: String = row.try_get("allowed_actions").map_err(map_sqlx)?;
                Ok(SessionKeyPolicy {
                    session_pubkey: row.try_get("session_pubkey").map_err(map_sqlx)?,
                    owner_pubkey: row.try_get("owner_pubkey").map_err(map_sqlx)?,
                    max_volume_lamports: volume.parse::<u128>().map_err(|e| {
                        StoreError::Fatal(format!("corrupt max_volume_lamports: {e}"))
                    })?,
                    expires_at: row.try_get("expires_at").map_err(map_sqlx)?,
                    created_at: row.try_get("created_at").map_err(map_sqlx)?,
                    allowed_actions: serde_json::from_str(&actions)
                        .map_err(|e| StoreError::Fatal(format!("corrupt allowed_actions: {e}")))?,
                })
            })
            .collect()
    }
}

fn to_i64(value: u64, column: &str) -> Result<i64, StoreError> {
    i64::try_from(value)
        .map_err(|_| StoreError::Fatal(format!("{column} {value} exceeds the INTEGER range")))
}

fn fatal<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Fatal(e.to_string())
}

fn map_sqlx(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) => {
            let message = db.message().to_string();
            if message.contains("UNIQUE constraint failed") {
                if message.contains("trade_intents.id") {
                    return StoreError::DuplicateId;
                }
                if message.contains("trade_intents.session_pubkey") {
                    return StoreError::DuplicateNonce;
                }
            }
            if message.contains("database is locked") || message.contains("busy") {
                return StoreError::Transient(message);
            }
            StoreError::Fatal(message)
        }
        sqlx::Error::Io(io) => StoreError::Transient(io.to_string()),
        sqlx::Error::PoolTimedOut => StoreError::Transient("connection pool timed out".into()),
        _ => StoreError::Fatal(e.to_string()),
    }
}

fn intent_from_row(row: &SqliteRow) -> Result<TradeIntent, StoreError> {
    let amount: i64 = row.try_get("amount_lamports").map_err(map_sqlx)?;
    let nonce: i64 = row.try_get("nonce").map_err(map_sqlx)?;
    let intent_type: String = row.try_get("intent_type").map_err(map_sqlx)?;
    Ok(TradeIntent {
        id: row.try_get("id").map_err(map_sqlx)?,
        session_pubkey: row.try_get("session_pubkey").map_err(map_sqlx)?,
        owner_pubkey: row.try_get("owner_pubkey").map_err(map_sqlx)?,
        item_id: row.try_get("item_id").map_err(map_sqlx)?,
        from: row.try_get("from_owner").map_err(map_sqlx)?,
        to: row.try_get("to_owner").map_err(map_sqlx)?,
        amount_lamports: amount as u64,
        nonce: nonce as u64,
        signature: row.try_get("signature").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        intent_type: intent_type
            .parse()
            .map_err(|e: String| StoreError::Fatal(format!("corrupt intent_type: {e}")))?,
    })
}

fn batch_from_row(row: &SqliteRow) -> Result<NettingBatch, StoreError> {
    let hash: Vec<u8> = row.try_get("batch_hash").map_err(map_sqlx)?;
    let batch_hash: [u8; 32] = hash
        .try_into()
        .map_err(|_| StoreError::Fatal("batch_hash is not 32 bytes".into()))?;
    let intent_ids: String = row.try_get("intent_ids").map_err(map_sqlx)?;
    let numeric: i64 = row.try_get("batch_id_numeric").map_err(map_sqlx)?;
    let num_intents: i64 = row.try_get("num_intents").map_err(map_sqlx)?;
    let num_items: i64 = row.try_get("num_items_settled").map_err(map_sqlx)?;
    let num_wallets: i64 = row.try_get("num_wallets").map_err(map_sqlx)?;
    Ok(NettingBatch {
        batch_id: row.try_get("batch_id").map_err(map_sqlx)?,
        batch_id_numeric: numeric as u32,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        netted_at: row.try_get("netted_at").map_err(map_sqlx)?,
        settled_at: row.try_get("settled_at").map_err(map_sqlx)?,
        settled: row.try_get("settled").map_err(map_sqlx)?,
        tx_signature: row.try_get("tx_signature").map_err(map_sqlx)?,
        batch_hash,
        intent_ids: serde_json::from_str(&intent_ids)
            .map_err(|e| StoreError::Fatal(format!("corrupt intent_ids: {e}")))?,
        num_intents: num_intents as u64,
        num_items_settled: num_items as u64,
        num_wallets: num_wallets as u64,
    })
}
