//! netsettle - operator CLI for the off-chain netting and settlement
//! engine.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use colored::Colorize;
use netsettle_engine::SettlementError;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::*;

#[derive(Parser)]
#[command(name = "netsettle")]
#[command(version = "0.1.0")]
#[command(about = "Off-chain netting and settlement engine for an on-chain asset marketplace")]
#[command(long_about = r#"
netsettle accepts signed trade intents from delegated session keys, nets
them into batches, and settles each batch with exactly one on-chain
transaction carrying a 32-byte commitment hash.

Quick Start:
  1. netsettle register-session   Authorize a delegated session key
  2. netsettle run                Start the engine (Ctrl-C to stop)
  3. netsettle query <batch-id>   Inspect a netted batch
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the engine config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Solana RPC URL (overrides the config file)
    #[arg(long, global = true)]
    rpc_url: Option<String>,

    /// Path to the authority keypair file
    #[arg(long, global = true)]
    keypair: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine: admission, batch netting and on-chain settlement
    Run,

    /// Force-close the current batch window, netting whatever is pending
    CloseBatch,

    /// Lift a batch's quarantine and attempt settlement again
    Retry {
        /// Batch id to settle
        batch_id: String,
    },

    /// Show a batch: status, commitment hash, settled items, net deltas
    Query {
        /// Batch id to inspect
        batch_id: String,
    },

    /// Register a session key policy for an owner
    RegisterSession {
        /// Owner wallet (base58)
        #[arg(long)]
        owner: String,

        /// Delegated session key (base58)
        #[arg(long)]
        session: String,

        /// Cap on cumulative intent volume, in lamports
        #[arg(long)]
        max_volume: u128,

        /// Policy lifetime in seconds from now
        #[arg(long, default_value = "86400")]
        expires_in: u64,

        /// Allowed intent types (trade, bid, buy_now)
        #[arg(long, value_delimiter = ',', default_value = "trade")]
        actions: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run => {
            run::run(cli.config.as_deref(), cli.rpc_url.as_deref(), cli.keypair.as_deref()).await
        }
        Commands::CloseBatch => close_batch::run(cli.config.as_deref()).await,
        Commands::Retry { batch_id } => {
            retry::run(
                cli.config.as_deref(),
                cli.rpc_url.as_deref(),
                cli.keypair.as_deref(),
                &batch_id,
            )
            .await
        }
        Commands::Query { batch_id } => query::run(cli.config.as_deref(), &batch_id).await,
        Commands::RegisterSession { owner, session, max_volume, expires_in, actions } => {
            register_session::run(
                cli.config.as_deref(),
                &owner,
                &session,
                max_volume,
                expires_in,
                &actions,
            )
            .await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            let unrecoverable = e
                .downcast_ref::<SettlementError>()
                .map(SettlementError::is_permanent_chain)
                .unwrap_or(false);
            if unrecoverable {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}
