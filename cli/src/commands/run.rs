//! Start the engine loop.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use netsettle_engine::config::EngineConfig;
use netsettle_engine::settlement::{SettlementClient, SolanaSettlementClient};
use netsettle_engine::Engine;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::Signer;

pub async fn run(
    config_path: Option<&Path>,
    rpc_url: Option<&str>,
    keypair_path: Option<&Path>,
) -> Result<()> {
    let mut config = EngineConfig::load(config_path)?;
    if let Some(url) = rpc_url {
        config.rpc.endpoint = url.to_string();
    }

    let chain: Option<Arc<dyn SettlementClient>> = if config.settlement.enabled {
        let authority = config.load_authority_keypair(keypair_path)?;
        let program_id: Pubkey = config
            .program
            .id
            .parse()
            .context("Invalid program id in config")?;

        println!("{}", "Starting netsettle engine...".cyan());
        println!("RPC:       {}", config.rpc.endpoint);
        println!("Program:   {}", program_id);
        println!("Authority: {}", authority.pubkey());
        println!("Store:     {}", config.store.path.display());
        println!();

        Some(Arc::new(SolanaSettlementClient::new(
            &config.rpc.endpoint,
            program_id,
            authority,
        )))
    } else {
        println!(
            "{}",
            "Starting netsettle engine (settlement disabled)...".cyan()
        );
        None
    };

    let engine = Engine::bootstrap(config, chain)
        .await
        .context("Engine initialization failed")?;
    engine.run().await?;

    println!("{}", "Engine stopped.".green());
    Ok(())
}
