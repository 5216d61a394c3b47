//! Register a session key policy.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use netsettle_engine::config::EngineConfig;
use netsettle_engine::types::now_ts;
use netsettle_engine::{IntentType, SessionKeyPolicy, SessionPolicyRegistry, Store};
use solana_sdk::pubkey::Pubkey;

pub async fn run(
    config_path: Option<&Path>,
    owner: &str,
    session: &str,
    max_volume: u128,
    expires_in: u64,
    actions: &[String],
) -> Result<()> {
    let _: Pubkey = owner.parse().context("Invalid owner pubkey")?;
    let _: Pubkey = session.parse().context("Invalid session pubkey")?;

    let allowed_actions = actions
        .iter()
        .map(|a| a.parse::<IntentType>().map_err(|e| anyhow!(e)))
        .collect::<Result<Vec<_>>>()?;
    if allowed_actions.is_empty() {
        return Err(anyhow!("at least one allowed action is required"));
    }

    let config = EngineConfig::load(config_path)?;
    let store = Store::open(&config.store.path).await?;
    let registry = SessionPolicyRegistry::new();

    let now = now_ts();
    let policy = SessionKeyPolicy {
        owner_pubkey: owner.to_string(),
        session_pubkey: session.to_string(),
        max_volume_lamports: max_volume,
        expires_at: now + expires_in as i64,
        created_at: now,
        allowed_actions,
    };
    registry.register(&store, policy.clone()).await?;

    println!("{}", "Session key registered.".green().bold());
    println!();
    println!("Owner:      {}", policy.owner_pubkey);
    println!("Session:    {}", policy.session_pubkey);
    println!("Volume cap: {} lamports", policy.max_volume_lamports);
    println!("Expires:    {}", policy.expires_at);
    println!(
        "Actions:    {}",
        policy
            .allowed_actions
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(())
}
