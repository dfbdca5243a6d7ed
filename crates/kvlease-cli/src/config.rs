//! Configuration management for the kvlease CLI
//!
//! Sources, lowest precedence first: built-in defaults, the YAML file given by
//! `--config`, `KVLEASE_*` environment variables (`__` separates sections), and
//! command-line flags.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use kvlease_common::StoreConfig;
use kvlease_lock::{LockOptions, LockSettings};

pub const DEFAULT_CONFIG_PATH: &str = "conf/kvlease.yml";
pub const ENV_PREFIX: &str = "KVLEASE";

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "kvlease", version, about = "Lease locks and tree deletion over a CAS key-value store")]
pub struct Cli {
    #[arg(short = 'c', long = "config", env = "KVLEASE_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
    #[arg(long = "table")]
    pub table: Option<String>,
    #[arg(long = "endpoint")]
    pub endpoint: Option<String>,
    #[arg(long = "ttl-ms")]
    pub ttl_ms: Option<u64>,
    #[arg(long = "holder")]
    pub holder: Option<String>,
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Race several lock handles for one key and check they never overlap
    Contend(ContendArgs),
    /// Seed keys under a prefix, then delete the whole tree
    DeleteTree(DeleteTreeArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ContendArgs {
    #[arg(long, default_value = "mylock")]
    pub key: String,
    #[arg(long, default_value_t = 4)]
    pub workers: usize,
    /// Acquisitions per worker
    #[arg(long, default_value_t = 3)]
    pub rounds: usize,
    /// How long each acquisition is held
    #[arg(long = "hold-ms", default_value_t = 200)]
    pub hold_ms: u64,
}

#[derive(Debug, Clone, Args)]
pub struct DeleteTreeArgs {
    #[arg(long)]
    pub prefix: String,
    /// Number of keys to seed under the prefix
    #[arg(long, default_value_t = 10)]
    pub keys: usize,
    /// Keys left unprocessed by each successive batch, e.g. `4,1`
    #[arg(long, value_delimiter = ',')]
    pub throttle: Vec<usize>,
    #[arg(long = "retry-ms", default_value_t = 1_000)]
    pub retry_ms: u64,
    #[arg(long = "deadline-ms", default_value_t = 30_000)]
    pub deadline_ms: u64,
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub console: bool,
    pub file: bool,
    /// Log directory; defaults to `~/kvlease/logs`
    pub dir: Option<String>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: false,
            dir: None,
        }
    }
}

/// Application settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub store: StoreConfig,
    pub lock: LockSettings,
    pub logging: LogSettings,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("store.table", "kvlease")?
            .add_source(File::from(cli.config.as_path()).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("store.endpoints")
                    .try_parsing(true),
            );

        if let Some(v) = &cli.table {
            builder = builder.set_override("store.table", v.as_str())?;
        }
        if let Some(v) = &cli.endpoint {
            builder = builder.set_override("store.endpoints", vec![v.clone()])?;
        }
        if let Some(v) = cli.ttl_ms {
            builder = builder.set_override("lock.ttl_ms", v)?;
        }
        if let Some(v) = &cli.holder {
            builder = builder.set_override("lock.holder", v.as_str())?;
        }
        if let Some(v) = &cli.log_level {
            builder = builder.set_override("logging.level", v.as_str())?;
        }

        builder.build()?.try_deserialize()
    }

    /// Holder value for this process; random when not configured
    pub fn holder(&self) -> String {
        if self.lock.holder.is_empty() {
            format!("kvlease-{}", uuid::Uuid::new_v4())
        } else {
            self.lock.holder.clone()
        }
    }

    pub fn lock_options(&self, holder: &str) -> LockOptions {
        LockOptions {
            value: holder.as_bytes().to_vec(),
            ..self.lock.to_options()
        }
    }
}
