//! On-chain settlement payload and RPC client.
//!
//! The on-chain program exposes one instruction,
//! `settle_net_batch(batch_id_u32, batch_hash, items, cash_deltas,
//! royalties, protocol_fee)`, accepts each `batch_id` exactly once, and is
//! signed by the server authority. The instruction is built the anchor
//! way: an 8-byte `sha256("global:settle_net_batch")` discriminator
//! followed by the borsh-serialized arguments, with the global config PDA
//! derived from the seed `"config"`.

use std::str::FromStr;

use borsh::BorshSerialize;
use sha2::{Digest, Sha256};
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::{AccountMeta, Instruction, InstructionError};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use solana_sdk::system_program;
use solana_sdk::transaction::{Transaction, TransactionError};
use tracing::debug;

use crate::commitment;
use crate::error::ChainError;
use crate::types::{NetCashDelta, NettingBatch, SettledItem};

/// Seed of the program's global config PDA.
pub const CONFIG_SEED: &[u8] = b"config";

/// Custom error code the program returns when a batch id was already
/// accepted. Part of the on-chain contract.
pub const BATCH_ALREADY_SETTLED_CODE: u32 = 6001;

const SETTLE_INSTRUCTION: &str = "global:settle_net_batch";

/// Arguments of `settle_net_batch`, borsh-encoded behind the
/// discriminator.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize)]
pub struct SettlementPayload {
    pub batch_id: u32,
    pub batch_hash: [u8; 32],
    /// `(item_id_u64, final_owner)` for owners with a valid on-chain
    /// address.
    pub items: Vec<(u64, [u8; 32])>,
    /// `(owner, delta)` filtered to non-zero, valid-address entries.
    pub cash_deltas: Vec<([u8; 32], i64)>,
    /// Zero while the royalty feature is disabled.
    pub royalties: Vec<([u8; 32], u64)>,
    /// Zero while the protocol fee is disabled.
    pub protocol_fee: u64,
}

/// Project a persisted batch into the on-chain argument form.
pub fn build_payload(
    batch: &NettingBatch,
    items: &[SettledItem],
    deltas: &[NetCashDelta],
) -> Result<SettlementPayload, ChainError> {
    let mut payload_items = Vec::with_capacity(items.len());
    for item in items {
        match Pubkey::from_str(&item.final_owner) {
            Ok(owner) => {
                payload_items.push((commitment::item_id_numeric(&item.item_id), owner.to_bytes()))
            }
            Err(_) => debug!(
                item_id = %item.item_id,
                final_owner = %item.final_owner,
                "final owner is not an on-chain address; item left off-chain"
            ),
        }
    }

    let mut payload_deltas = Vec::with_capacity(deltas.len());
    for delta in deltas {
        if delta.delta_lamports == 0 {
            continue;
        }
        let owner = match Pubkey::from_str(&delta.owner_pubkey) {
            Ok(owner) => owner,
            Err(_) => {
                debug!(
                    owner = %delta.owner_pubkey,
                    "delta owner is not an on-chain address; entry left off-chain"
                );
                continue;
            }
        };
        let amount = i64::try_from(delta.delta_lamports).map_err(|_| {
            ChainError::Permanent(format!(
                "delta for {} overflows the on-chain i64 range",
                delta.owner_pubkey
            ))
        })?;
        payload_deltas.push((owner.to_bytes(), amount));
    }

    Ok(SettlementPayload {
        batch_id: batch.batch_id_numeric,
        batch_hash: batch.batch_hash,
        items: payload_items,
        cash_deltas: payload_deltas,
        royalties: Vec::new(),
        protocol_fee: 0,
    })
}

/// Anchor instruction discriminator: first 8 bytes of the sha256 of the
/// namespaced instruction name.
fn settle_discriminator() -> [u8; 8] {
    let digest = Sha256::digest(SETTLE_INSTRUCTION.as_bytes());
    let mut disc = [0u8; 8];
    disc.copy_from_slice(&digest[..8]);
    disc
}

/// Submission backend, mockable for tests.
pub trait SettlementClient: Send + Sync {
    /// Submit one settlement transaction and return its signature.
    fn submit_batch(&self, payload: &SettlementPayload) -> Result<String, ChainError>;
}

/// Production client over a Solana RPC endpoint.
pub struct SolanaSettlementClient {
    client: RpcClient,
    program_id: Pubkey,
    authority: Keypair,
}

impl SolanaSettlementClient {
    pub fn new(endpoint: &str, program_id: Pubkey, authority: Keypair) -> Self {
        Self {
            client: RpcClient::new_with_commitment(
                endpoint.to_string(),
                CommitmentConfig::confirmed(),
            ),
            program_id,
            authority,
        }
    }

    fn instruction(&self, payload: &SettlementPayload) -> Result<Instruction, ChainError> {
        let (config_pda, _bump) =
            Pubkey::find_program_address(&[CONFIG_SEED], &self.program_id);

        let args = payload
            .try_to_vec()
            .map_err(|e| ChainError::Permanent(format!("payload serialization: {e}")))?;
        let mut data = settle_discriminator().to_vec();
        data.extend_from_slice(&args);

        Ok(Instruction {
            program_id: self.program_id,
            accounts: vec![
                AccountMeta::new(self.authority.pubkey(), true),
                AccountMeta::new(config_pda, false),
                AccountMeta::new_readonly(system_program::id(), false),
            ],
            data,
        })
    }
}

impl SettlementClient for SolanaSettlementClient {
    fn submit_batch(&self, payload: &SettlementPayload) -> Result<String, ChainError> {
        let instruction = self.instruction(payload)?;
        let recent_blockhash = self
            .client
            .get_latest_blockhash()
            .map_err(|e| ChainError::Transient(format!("get_latest_blockhash: {e}")))?;
        let transaction = Transaction::new_signed_with_payer(
            &[instruction],
            Some(&self.authority.pubkey()),
            &[&self.authority],
            recent_blockhash,
        );

        match self.client.send_and_confirm_transaction(&transaction) {
            Ok(signature) => Ok(signature.to_string()),
            // The chain has already processed this exact transaction: a
            // previous submit of ours landed.
            Err(e)
                if e.get_transaction_error() == Some(TransactionError::AlreadyProcessed) =>
            {
                Ok(transaction.signatures[0].to_string())
            }
            Err(e) => Err(classify_client_error(&e)),
        }
    }
}

/// Map an RPC client failure onto the retry classification.
pub fn classify_client_error(error: &ClientError) -> ChainError {
    if let Some(tx_error) = error.get_transaction_error() {
        return classify_transaction_error(&tx_error);
    }
    match error.kind() {
        ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) => {
            ChainError::Transient(error.to_string())
        }
        ClientErrorKind::RpcError(_) => ChainError::Transient(error.to_string()),
        _ => ChainError::Permanent(error.to_string()),
    }
}

/// Map an executed-transaction failure onto the retry classification.
pub fn classify_transaction_error(error: &TransactionError) -> ChainError {
    match error {
        TransactionError::BlockhashNotFound => ChainError::Transient(error.to_string()),
        TransactionError::InstructionError(_, InstructionError::Custom(code))
            if *code == BATCH_ALREADY_SETTLED_CODE =>
        {
            // The program cannot report the original signature here; the
            // driver resolves it or quarantines.
            ChainError::AlreadySettled { tx_signature: None }
        }
        _ => ChainError::Permanent(error.to_string()),
    }
}
