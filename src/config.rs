use std::{
    env, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use dirs::config_dir;
use log::LevelFilter;
use serde::Deserialize;

use crate::registry::DuplicatePolicy;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub poll_interval: Duration,
    pub duplicate_policy: DuplicatePolicy,
    pub log_level: LevelFilter,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub user_agent: String,
    pub url: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 8080,
            timeout: Duration::from_secs(10),
            user_agent: "flash-tui".to_string(),
            url: None,
        }
    }
}

impl AgentConfig {
    /// Base URL without a trailing slash; endpoint paths are appended to it.
    pub fn base_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.trim_end_matches('/').to_string();
        }
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Terminal dashboard for a torrent download agent", long_about = None)]
pub struct Cli {
    /// Full agent base URL, overrides scheme/host/port
    #[arg(long)]
    pub url: Option<String>,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Per-request timeout in seconds
    #[arg(long)]
    pub timeout: Option<f64>,
    /// Seconds between progress polls
    #[arg(long)]
    pub poll_interval: Option<f64>,
    /// What to do when a torrent with the same name is added: reject or replace
    #[arg(long)]
    pub duplicates: Option<DuplicatePolicy>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    agent: Option<FileAgentConfig>,
    poll_interval: Option<f64>,
    duplicates: Option<DuplicatePolicy>,
    log_level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileAgentConfig {
    url: Option<String>,
    scheme: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    timeout: Option<f64>,
    user_agent: Option<String>,
}

pub fn build_config(cli: &Cli) -> Result<AppConfig> {
    let file_config = load_file_config(cli.config.as_deref())?;
    let agent_file = file_config.as_ref().and_then(|cfg| cfg.agent.as_ref());
    let defaults = AgentConfig::default();

    let url = cli
        .url
        .clone()
        .or_else(|| env::var("FLASH_URL").ok())
        .or_else(|| agent_file.and_then(|cfg| cfg.url.clone()));

    let host = cli
        .host
        .clone()
        .or_else(|| env::var("FLASH_HOST").ok())
        .or_else(|| agent_file.and_then(|cfg| cfg.host.clone()))
        .unwrap_or(defaults.host);

    let port = cli
        .port
        .or_else(|| env_var_parse("FLASH_PORT"))
        .or_else(|| agent_file.and_then(|cfg| cfg.port))
        .unwrap_or(defaults.port);

    let scheme = env::var("FLASH_SCHEME")
        .ok()
        .or_else(|| agent_file.and_then(|cfg| cfg.scheme.clone()))
        .unwrap_or(defaults.scheme);

    let timeout_secs = cli
        .timeout
        .or_else(|| env_float("FLASH_TIMEOUT"))
        .or_else(|| agent_file.and_then(|cfg| cfg.timeout))
        .unwrap_or(defaults.timeout.as_secs_f64());
    let timeout = positive_duration(timeout_secs, "timeout")?;

    let poll_secs = cli
        .poll_interval
        .or_else(|| env_float("FLASH_POLL_INTERVAL"))
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.poll_interval))
        .unwrap_or(2.0);
    let poll_interval = positive_duration(poll_secs, "poll interval")?;

    let duplicate_policy = cli
        .duplicates
        .or_else(|| env_var_parse("FLASH_DUPLICATES"))
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.duplicates))
        .unwrap_or_default();

    let user_agent = env::var("FLASH_USER_AGENT")
        .ok()
        .or_else(|| agent_file.and_then(|cfg| cfg.user_agent.clone()))
        .unwrap_or(defaults.user_agent);

    let log_level_str = cli
        .log_level
        .clone()
        .or_else(|| env::var("FLASH_LOG_LEVEL").ok())
        .or_else(|| file_config.as_ref().and_then(|cfg| cfg.log_level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let log_level = LevelFilter::from_str(&log_level_str).unwrap_or(LevelFilter::Info);

    Ok(AppConfig {
        agent: AgentConfig {
            scheme,
            host,
            port,
            timeout,
            user_agent,
            url,
        },
        poll_interval,
        duplicate_policy,
        log_level,
    })
}

fn positive_duration(secs: f64, what: &str) -> Result<Duration> {
    if secs.is_nan() || secs <= 0.0 {
        bail!("{what} must be positive");
    }
    Duration::try_from_secs_f64(secs)
        .with_context(|| format!("{what} of {secs} seconds is too large"))
}

fn load_file_config(path: Option<&Path>) -> Result<Option<FileConfig>> {
    if let Some(path) = path {
        return read_file_config(path);
    }

    if let Ok(env_path) = env::var("FLASH_TUI_CONFIG") {
        return read_file_config(Path::new(&env_path));
    }

    if let Some(dir) = config_dir() {
        return read_file_config(&dir.join("flash-tui").join("config.toml"));
    }

    Ok(None)
}

fn read_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let parsed: FileConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(Some(parsed))
}

fn env_var_parse<T>(name: &str) -> Option<T>
where
    T: FromStr,
{
    env::var(name).ok().and_then(|value| value.parse().ok())
}

fn env_float(name: &str) -> Option<f64> {
    env_var_parse(name)
}
