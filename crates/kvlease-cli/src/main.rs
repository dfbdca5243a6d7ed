//! Entry point for the kvlease operator CLI.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use kvlease_cli::{
    command,
    config::{Cli, Command, Settings},
    startup::{self, LoggingConfig},
};
use kvlease_store::{CasStore, MemoryBackend};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;

    let _logging_guard = startup::init_logging(&LoggingConfig::from_settings(&settings.logging))?;
    kvlease_lock::metrics::init_metrics();

    let backend = Arc::new(
        MemoryBackend::from_config(&settings.store).context("invalid store configuration")?,
    );
    info!(
        table = backend.table(),
        endpoint = settings.store.endpoint().unwrap_or("in-process"),
        "store ready"
    );
    let store = CasStore::new(backend.clone()).with_change_feed(backend.clone());
    let shutdown = startup::shutdown_token();

    let result = match &cli.command {
        Command::Contend(args) => {
            command::contend::run(store.clone(), &settings, args, shutdown.clone())
                .await
                .map(|_| ())
        }
        Command::DeleteTree(args) => {
            match startup::run_until_cancelled(
                command::delete_tree::run(&store, &backend, args),
                &shutdown,
            )
            .await
            {
                Some(result) => result.map(|_| ()),
                None => Ok(()),
            }
        }
    };

    if let Err(e) = store.close().await {
        warn!(error = %e, "failed to close store");
    }
    result
}
