//! Engine configuration and authority key loading.
//!
//! Configuration is a JSON file under `~/.netsettle/` by default; every
//! section has defaults so a missing file yields a runnable devnet
//! configuration. The server authority is a standard Solana keypair file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use solana_sdk::signature::Keypair;

const NETSETTLE_DIR: &str = ".netsettle";
const CONFIG_FILE: &str = "config.json";
const DB_FILE: &str = "netsettle.db";

/// Settlement program id (update after deployment).
pub const DEFAULT_PROGRAM_ID: &str = "7Zt2s9XBN4mDgWnvgEfbqWCqqrUr5VTS5jL2cwQFWUJc";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub batch: BatchConfig,
    pub admission: AdmissionConfig,
    pub settlement: SettlementConfig,
    pub rpc: RpcConfig,
    pub program: ProgramConfig,
    pub authority: AuthorityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file.
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: netsettle_dir().join(DB_FILE),
        }
    }
}

/// Batch formation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Minimum pending intents before a scheduled tick forms a batch.
    pub min_intents: u32,
    /// Hard cap on intents per batch.
    pub max_intents: u32,
    /// Age of the oldest pending intent after which a batch forms even
    /// below `min_intents`. `None` never overrides the minimum.
    pub window_seconds: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            min_intents: 2,
            max_intents: 1_000,
            window_seconds: Some(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Production MUST keep this on; the switch exists for benchmarks.
    pub require_signature: bool,
    /// Bound on concurrently processed admission requests.
    pub max_parallel: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            require_signature: true,
            max_parallel: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub enabled: bool,
    /// Size threshold a batch must meet before the driver picks it up.
    pub min_intents: u64,
    pub max_retries: u32,
    pub backoff_initial_ms: u64,
    pub backoff_cap_ms: u64,
    pub poll_interval_secs: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_intents: 1,
            max_retries: 3,
            backoff_initial_ms: 1_000,
            backoff_cap_ms: 10_000,
            poll_interval_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub endpoint: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.devnet.solana.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    /// Base58 id of the on-chain settlement program.
    pub id: String,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_PROGRAM_ID.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorityConfig {
    /// Path to the server authority keypair; defaults to the standard
    /// Solana CLI location when unset.
    pub keypair_path: Option<PathBuf>,
}

/// Engine home directory.
pub fn netsettle_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(NETSETTLE_DIR)
}

/// Default config file path.
pub fn config_file() -> PathBuf {
    netsettle_dir().join(CONFIG_FILE)
}

impl EngineConfig {
    /// Load from `path` (or the default location). A missing file yields
    /// the default configuration; a present but unparseable file is an
    /// error rather than a silent fallback.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(config_file);
        if !path.exists() {
            return Ok(Self::default());
        }
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Write the config as pretty JSON, creating the directory if needed.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(config_file);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Load the server authority keypair from the configured path, an
    /// explicit override, or the default Solana CLI location.
    pub fn load_authority_keypair(&self, override_path: Option<&Path>) -> Result<Keypair> {
        let keypair_path = match override_path.or(self.authority.keypair_path.as_deref()) {
            Some(p) => p.to_path_buf(),
            None => dirs::home_dir()
                .context("Could not find home directory")?
                .join(".config")
                .join("solana")
                .join("id.json"),
        };

        if !keypair_path.exists() {
            bail!(
                "Authority keypair not found at {:?}. Generate one with 'solana-keygen new' \
                 or set authority.keypair_path",
                keypair_path
            );
        }

        let json = fs::read_to_string(&keypair_path)?;
        let bytes: Vec<u8> = serde_json::from_str(&json)?;
        let keypair = Keypair::from_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("Invalid authority keypair file: {e}"))?;
        Ok(keypair)
    }
}
