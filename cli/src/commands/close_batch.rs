//! Force-close the current batch window.

use std::path::Path;

use anyhow::{Context, Result};
use colored::Colorize;
use netsettle_engine::config::EngineConfig;
use netsettle_engine::Engine;

pub async fn run(config_path: Option<&Path>) -> Result<()> {
    let config = EngineConfig::load(config_path)?;
    let engine = Engine::bootstrap(config, None)
        .await
        .context("Engine initialization failed")?;

    match engine.force_close_current_batch().await? {
        Some(batch) => {
            println!("{}", "Batch closed.".green().bold());
            println!();
            println!("Batch id:      {}", batch.batch_id);
            println!("Intents:       {}", batch.num_intents);
            println!("Items settled: {}", batch.num_items_settled);
            println!("Wallets:       {}", batch.num_wallets);
            println!("Compression:   {:.2}x", batch.compression_ratio());
            println!("Commitment:    {}", hex::encode(batch.batch_hash));
        }
        None => {
            println!("{}", "No pending intents; nothing to close.".yellow());
        }
    }
    Ok(())
}
