//! Inspect a netted batch.

use std::path::Path;

use anyhow::{bail, Result};
use colored::Colorize;
use netsettle_engine::config::EngineConfig;
use netsettle_engine::Store;

pub async fn run(config_path: Option<&Path>, batch_id: &str) -> Result<()> {
    let config = EngineConfig::load(config_path)?;
    let store = Store::open(&config.store.path).await?;

    let Some(batch) = store.get_batch(batch_id).await? else {
        bail!("No batch with id {batch_id}");
    };

    let status = if batch.settled {
        "settled".green().bold()
    } else {
        "unsettled".yellow().bold()
    };
    println!("Batch:         {} ({})", batch.batch_id, batch.batch_id_numeric);
    println!("Status:        {status}");
    if let Some(signature) = &batch.tx_signature {
        println!("Transaction:   {signature}");
    }
    println!("Created:       {}", batch.created_at);
    if let Some(netted_at) = batch.netted_at {
        println!("Netted:        {netted_at}");
    }
    if let Some(settled_at) = batch.settled_at {
        println!("Settled:       {settled_at}");
    }
    println!("Commitment:    {}", hex::encode(batch.batch_hash));
    println!("Intents:       {}", batch.num_intents);
    println!("Items settled: {}", batch.num_items_settled);
    println!("Wallets:       {}", batch.num_wallets);
    println!("Compression:   {:.2}x", batch.compression_ratio());

    let items = store.get_settled_items(batch_id).await?;
    if !items.is_empty() {
        println!();
        println!("{}", "Final owners:".cyan());
        for item in &items {
            println!("  {}  ->  {}", item.item_id, item.final_owner);
        }
    }

    let deltas = store.get_net_deltas(batch_id).await?;
    if !deltas.is_empty() {
        println!();
        println!("{}", "Net cash deltas (lamports):".cyan());
        for delta in &deltas {
            println!("  {}  {:+}", delta.owner_pubkey, delta.delta_lamports);
        }
    }

    Ok(())
}
