use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use panelchat_core::BrowserContext;
use tokio::process::Command;
use url::Url;

/// Opens the login page with the platform's default browser.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBrowser;

fn opener(url: &str) -> Command {
    if cfg!(target_os = "macos") {
        let mut command = Command::new("open");
        command.arg(url);
        command
    } else if cfg!(target_os = "windows") {
        let mut command = Command::new("cmd");
        command.args(["/C", "start", "", url]);
        command
    } else {
        let mut command = Command::new("xdg-open");
        command.arg(url);
        command
    }
}

#[async_trait]
impl BrowserContext for SystemBrowser {
    async fn open(&self, url: &Url) -> Result<()> {
        println!("Opening login page: {url}");
        let status = opener(url.as_str())
            .status()
            .await
            .context("launching the system browser")?;
        if !status.success() {
            bail!("browser launcher exited with {status}");
        }
        Ok(())
    }
}

/// Only prints the URL; for headless sessions.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintOnlyBrowser;

#[async_trait]
impl BrowserContext for PrintOnlyBrowser {
    async fn open(&self, url: &Url) -> Result<()> {
        println!("Open this page to sign in: {url}");
        Ok(())
    }
}
