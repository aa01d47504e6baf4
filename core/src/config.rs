use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_GREETING: &str = "Hi! I'm your AI assistant. How can I help?";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: Url,
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    pub greeting: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn user_message(&self) -> String {
        match self {
            Self::Invalid(detail) => {
                format!("Panelchat is misconfigured: {detail}. Update panelchat.yaml.")
            }
        }
    }
}

/// Values taken from the process environment, applied over the file.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    pub base_url: Option<String>,
    pub data_dir: Option<String>,
}

impl EnvOverrides {
    pub fn from_environment() -> Self {
        Self {
            base_url: non_empty_env("PANELCHAT_BASE_URL"),
            data_dir: non_empty_env("PANELCHAT_DATA_DIR"),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.trim().is_empty())
}

impl ClientSettings {
    /// Reads `.env`, the first `panelchat.yaml` found, then env overrides.
    /// A missing file means defaults.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let section = match locate_config_file() {
            Some(path) => read_client_section(&path)?,
            None => ClientSection::default(),
        };
        resolve(section, EnvOverrides::from_environment())
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let section = read_client_section(path)?;
        resolve(section, EnvOverrides::from_environment())
    }
}

fn read_client_section(path: &Path) -> Result<ClientSection, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|err| {
        ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
    })?;
    let config: PanelchatConfig = serde_yaml::from_str(&contents)
        .map_err(|err| ConfigError::Invalid(format!("invalid panelchat.yaml: {err}")))?;
    tracing::debug!(path = %path.display(), "loaded configuration file");
    Ok(config.client.unwrap_or_default())
}

fn resolve(section: ClientSection, env: EnvOverrides) -> Result<ClientSettings, ConfigError> {
    let raw_url = env
        .base_url
        .or(section.base_url)
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
    let base_url = Url::parse(raw_url.trim())
        .map_err(|err| ConfigError::Invalid(format!("base_url `{raw_url}`: {err}")))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(ConfigError::Invalid(format!(
            "base_url must be http or https, got `{}`",
            base_url.scheme()
        )));
    }

    let data_dir = env
        .data_dir
        .or(section.data_dir)
        .map(PathBuf::from)
        .unwrap_or_else(default_data_dir);

    let timeout_secs = section.request_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(ConfigError::Invalid(
            "request_timeout_secs must be positive".to_string(),
        ));
    }

    let greeting = section
        .greeting
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .unwrap_or_else(|| DEFAULT_GREETING.to_string());

    Ok(ClientSettings {
        base_url,
        data_dir,
        request_timeout: Duration::from_secs(timeout_secs),
        greeting,
    })
}

fn default_data_dir() -> PathBuf {
    match BaseDirs::new() {
        Some(base) => base.data_dir().join("panelchat"),
        None => PathBuf::from(".panelchat"),
    }
}

fn locate_config_file() -> Option<PathBuf> {
    config_candidates().into_iter().find(|path| path.exists())
}

fn config_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("panelchat");
        paths.push(config_dir.join("panelchat.yaml"));
        paths.push(config_dir.join("panelchat.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".panelchat").join("panelchat.yaml"));
        paths.push(home_dir.join(".panelchat").join("panelchat.yml"));
    }
    paths.push(PathBuf::from("panelchat.yaml"));
    paths
}

#[derive(Debug, Deserialize)]
struct PanelchatConfig {
    client: Option<ClientSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ClientSection {
    base_url: Option<String>,
    data_dir: Option<String>,
    request_timeout_secs: Option<u64>,
    greeting: Option<String>,
}
