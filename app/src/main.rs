use anyhow::Context;
use clap::{Parser, Subcommand};
use panelchat::{auth_label, Panel, PrintOnlyBrowser, SystemBrowser};
use panelchat_core::{telemetry, BrowserContext, ClientSettings, HttpRemote, RemoteService};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "panelchat", version, about = "Chat with the assistant service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
    /// Read settings from this file instead of the default locations.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Override the service base URL.
    #[arg(long)]
    base_url: Option<Url>,
    /// Print the login URL instead of launching a browser.
    #[arg(long)]
    no_browser: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive chat (default).
    Chat,
    /// Show sign-in status and service health, then exit.
    Status,
    /// Print the stored transcript, then exit.
    History,
    /// Start a new conversation, then exit.
    Reset,
}

fn main() -> anyhow::Result<()> {
    telemetry::init_tracing(telemetry::filter_or("warn"))?;

    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => ClientSettings::load_from(path),
        None => ClientSettings::load(),
    }
    .map_err(|err| anyhow::anyhow!(err.user_message()))?;
    if let Some(base_url) = cli.base_url.clone() {
        settings.base_url = base_url;
    }

    let browser: Arc<dyn BrowserContext> = if cli.no_browser {
        Arc::new(PrintOnlyBrowser)
    } else {
        Arc::new(SystemBrowser)
    };

    let runtime = Runtime::new()?;
    runtime.block_on(async move {
        match cli.command.unwrap_or(Command::Chat) {
            Command::Chat => Panel::bootstrap(&settings, browser).await?.run().await,
            Command::Status => {
                let panel = Panel::bootstrap(&settings, browser).await?;
                panel.auth().check_status().await;
                println!("{}", auth_label(panel.auth().state()));
                let remote = HttpRemote::new(settings.base_url.clone(), settings.request_timeout)
                    .context("building HTTP client")?;
                match remote.health().await {
                    Ok(status) => println!("service at {}: {status}", settings.base_url),
                    Err(err) => println!("service at {} unreachable: {err}", settings.base_url),
                }
                Ok(())
            }
            Command::History => {
                let panel = Panel::bootstrap(&settings, browser).await?;
                panel.print_transcript();
                Ok(())
            }
            Command::Reset => {
                let panel = Panel::bootstrap(&settings, browser).await?;
                panel
                    .chat()
                    .reset_conversation(&settings.greeting)
                    .await
                    .context("resetting conversation")?;
                println!("Started a new conversation.");
                Ok(())
            }
        }
    })
}
