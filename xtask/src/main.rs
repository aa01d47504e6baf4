use anyhow::{ensure, Result};
use clap::{Parser, Subcommand};
use panelchat_core::{
    config::DEFAULT_GREETING, telemetry, ConversationClient, ConversationStore, FileStore,
    IdentityStore, MockRemote,
};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::Runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "xtask", version, about = "Automation helpers for Panelchat")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an end-to-end exchange against the scripted service and a temporary store.
    Smoke,
}

fn main() -> Result<()> {
    telemetry::init_tracing(EnvFilter::new("info"))?;
    let cli = Cli::parse();

    match cli.command {
        Commands::Smoke => smoke_test(),
    }
}

fn smoke_test() -> Result<()> {
    let runtime = Runtime::new()?;
    let temp_dir = TempDir::new()?;

    runtime.block_on(async {
        let storage = Arc::new(FileStore::open(temp_dir.path()).await?);
        let identity = IdentityStore::new(storage.clone());
        let (store, restored) = ConversationStore::load(storage.clone()).await?;
        if !restored {
            store.seed_greeting(DEFAULT_GREETING).await;
        }

        let remote = Arc::new(MockRemote::new());
        remote.push_reply("pong from the scripted service", "smoke-session");
        let client = ConversationClient::new(remote, identity.clone(), store);
        client.send("ping from xtask").await?;

        let first_identity = identity.get_or_create().await?;
        let (reloaded, restored) = ConversationStore::load(storage.clone()).await?;
        ensure!(restored, "conversation was not persisted");
        ensure!(reloaded.len() == 3, "expected 3 turns, found {}", reloaded.len());
        ensure!(
            reloaded.session_id().as_deref() == Some("smoke-session"),
            "session id was not persisted"
        );
        let second_identity = IdentityStore::new(storage).get_or_create().await?;
        ensure!(first_identity == second_identity, "identity changed between loads");

        info!(
            "turns" = reloaded.len(),
            "identity" = %first_identity,
            "smoke test conversation saved"
        );
        Ok(())
    })
}
