use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_FILE: &str = "avtool.yaml";
pub const DEFAULT_LEARN_PORT: u16 = 5000;
pub const DEFAULT_RELAY_LISTEN_PORT: u16 = 23001;

#[derive(Debug, Default, Deserialize, Clone)]
pub struct DiscoverConfig {
    pub subnet: Option<String>,
    pub from: Option<u8>,
    pub to: Option<u8>,
    pub ports: Option<String>,
    pub timeout_ms: Option<u64>,
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct LearnConfig {
    pub enabled: Option<bool>,
    pub port: Option<u16>,
}

impl LearnConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn port(&self) -> u16 {
        self.port.filter(|p| *p != 0).unwrap_or(DEFAULT_LEARN_PORT)
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct RelayConfig {
    pub listen_port: Option<u16>,
}

impl RelayConfig {
    pub fn listen_port(&self) -> u16 {
        self.listen_port.filter(|p| *p != 0).unwrap_or(DEFAULT_RELAY_LISTEN_PORT)
    }
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct LogConfig {
    pub level: Option<String>,
    /// `text` (default) or `json`.
    pub format: Option<String>,
}

#[derive(Debug, Default, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub discover: DiscoverConfig,
    #[serde(default)]
    pub learn: LearnConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub log: LogConfig,
}

pub fn parse_config(s: &str) -> Result<Config> {
    if s.trim().is_empty() {
        return Ok(Config::default());
    }
    Ok(serde_yaml::from_str(s)?)
}

/// Load `path`, or `./avtool.yaml` if it exists. An explicit path that cannot
/// be read or parsed is an error; a missing default file is not.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return Ok(Config::default()); }
        }
    };
    let s = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    parse_config(&s).with_context(|| format!("parsing {}", path.display()))
}
