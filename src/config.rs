use serde::Deserialize;
use std::fs;

use crate::error::{Error, Result};
use crate::profile::ProfileTestOptions;
use crate::profile::options::parse_links;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:8090";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Proxy,
    Test,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    #[serde(default)]
    pub mode: Mode,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub test: TestConfig,
}

#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub link: String,
    /// Seconds allowed for each upstream dial.
    #[serde(rename = "dial-timeout", default = "default_dial_timeout")]
    pub dial_timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen: default_listen(),
            link: String::new(),
            dial_timeout: default_dial_timeout(),
        }
    }
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_dial_timeout() -> u64 {
    10
}

#[derive(Debug, Default, Deserialize)]
pub struct TestConfig {
    #[serde(flatten)]
    pub options: ProfileTestOptions,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path, e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(content)
            .map_err(|e| Error::Config(format!("parse config: {}", e)))?;
        config.test.options.normalize(std::time::Duration::from_secs(1));
        if config.mode == Mode::Proxy && config.proxy.link.trim().is_empty() {
            return Err(Error::Config("proxy.link is required in proxy mode".into()));
        }
        Ok(config)
    }
}

impl TestConfig {
    /// Inline `links` first, then whatever `subscription` holds.
    pub fn links(&self) -> Vec<String> {
        let mut links = self.options.links.clone();
        links.extend(parse_links(&self.options.subscription));
        links
    }
}
