use std::path::{Path, PathBuf};

use clap::Parser;
use serde::Deserialize;

use crate::upstream::Upstream;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Multi-protocol forwarding proxy with upstream rotation",
    long_about = "microproxy accepts HTTP/1.1 (including CONNECT) and SOCKS5 clients and \
relays them through a round-robin pool of upstream HTTP proxies, injecting \
per-client-subnet Basic credentials.\n\nSend SIGHUP to reload the configuration file."
)]
pub struct Cli {
    /// Path to the configuration file (.json, .yaml or .yml)
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Positional alternative to --config
    #[arg(value_name = "CONFIG", conflicts_with = "config")]
    pub config_arg: Option<PathBuf>,
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref().or(self.config_arg.as_deref())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("unsupported config file format: .{0}")]
    UnsupportedFormat(String),

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Listener endpoints and reserved server-level settings.
///
/// `https_proto`, `cert_file`, `key_file`, `rate_limit` and `auth_type` are
/// accepted for compatibility and currently ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub socks5_proto: String,
    pub http_proto: String,
    pub https_proto: String,
    pub metrics_proto: String,
    pub cert_file: String,
    pub key_file: String,
    pub rate_limit: i64,
    pub auth_type: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            socks5_proto: String::new(),
            http_proto: "0.0.0.0:8080".to_string(),
            https_proto: String::new(),
            metrics_proto: String::new(),
            cert_file: String::new(),
            key_file: String::new(),
            rate_limit: 100,
            auth_type: String::new(),
        }
    }
}

/// One credential rule: clients in `ip_range` authenticate upstream with
/// `username`/`password`. The username may contain `${SESSION_ID}`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LoginRule {
    pub ip_range: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub proxies: Vec<String>,
    pub logins: Vec<LoginRule>,
}

/// Root configuration document. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub microproxy: ServerSection,
    pub upstream_proxy: UpstreamSection,
}

impl Config {
    /// Load and validate a configuration file, dispatching on its extension.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let display = path.display().to_string();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: display.clone(),
            source,
        })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let config: Config = match ext {
            "json" => serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
                path: display,
                message: e.to_string(),
            })?,
            "yaml" | "yml" => serde_yaml::from_str(&data).map_err(|e| ConfigError::Parse {
                path: display,
                message: e.to_string(),
            })?,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        config.validate()?;
        Ok(config)
    }

    /// Check the cross-field invariants the handlers rely on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.microproxy.http_proto.is_empty() && self.microproxy.socks5_proto.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one of http_proto or socks5_proto must be set".to_string(),
            ));
        }
        if self.upstream_proxy.proxies.is_empty() {
            return Err(ConfigError::Invalid(
                "upstream_proxy.proxies must not be empty".to_string(),
            ));
        }
        self.upstreams()?;
        Ok(())
    }

    /// Parse the configured upstream endpoints.
    pub fn upstreams(&self) -> Result<Vec<Upstream>, ConfigError> {
        self.upstream_proxy
            .proxies
            .iter()
            .map(|url| Upstream::parse(url).map_err(ConfigError::Invalid))
            .collect()
    }
}
