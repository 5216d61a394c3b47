//! Retry settlement for one batch, lifting any quarantine.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use netsettle_engine::config::EngineConfig;
use netsettle_engine::settlement::{SettlementClient, SolanaSettlementClient};
use netsettle_engine::{SettlementDriver, Store};
use solana_sdk::pubkey::Pubkey;

pub async fn run(
    config_path: Option<&Path>,
    rpc_url: Option<&str>,
    keypair_path: Option<&Path>,
    batch_id: &str,
) -> Result<()> {
    let mut config = EngineConfig::load(config_path)?;
    if let Some(url) = rpc_url {
        config.rpc.endpoint = url.to_string();
    }

    let authority = config.load_authority_keypair(keypair_path)?;
    let program_id: Pubkey = config
        .program
        .id
        .parse()
        .context("Invalid program id in config")?;
    let client: Arc<dyn SettlementClient> = Arc::new(SolanaSettlementClient::new(
        &config.rpc.endpoint,
        program_id,
        authority,
    ));

    let store = Arc::new(Store::open(&config.store.path).await?);
    let driver = SettlementDriver::new(store, client, config.settlement.clone());

    println!("Retrying settlement for batch {batch_id}...");
    let signature = driver.retry_settlement(batch_id).await?;

    println!();
    println!("{}", "Batch settled.".green().bold());
    println!("Transaction: {signature}");
    Ok(())
}
