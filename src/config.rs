//! Configuration management for mentor
//!
//! Handles loading and saving configuration from ~/.config/mentor/config.toml
//! and turning it into [`DaemonSettings`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::daemon::{DaemonSettings, IdentitySettings, UpnpSettings};
use crate::listener::ListenerLimits;
use crate::share::ShareConfig;
use crate::transfer::TransferLimits;

/// Configuration file name
const CONFIG_FILE: &str = "config.toml";

/// Application name for config directory
const APP_NAME: &str = "mentor";

/// Default plain HTTP port
pub const DEFAULT_PORT: u16 = 8080;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Invalid value for {field}: {value:?}")]
    InvalidValue { field: &'static str, value: String },
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration
///
/// Every field is optional; unset fields fall back to built-in defaults when
/// converted with [`Config::into_settings`].
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Address to bind, e.g. "0.0.0.0" or "::"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Plain HTTP port (TLS is also sniffed on it)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Dedicated TLS port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_port: Option<u16>,

    /// PEM certificate chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<PathBuf>,

    /// PEM private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<PathBuf>,

    /// Generate a self-signed certificate if the files are missing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_cert: Option<bool>,

    /// Names to put in a generated certificate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hostnames: Vec<String>,

    /// Serve plain-text listings for directories
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_listing: Option<bool>,

    /// Loopback address for the status endpoint, e.g. "127.0.0.1:9090"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upnp: Option<UpnpConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsConfig>,

    #[serde(default, rename = "share", skip_serializing_if = "Vec::is_empty")]
    pub shares: Vec<ShareConfig>,
}

/// `[upnp]` table
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UpnpConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,

    /// Lease requested from the router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_secs: Option<u32>,
}

/// `[limits]` table
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LimitsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_secs: Option<u64>,
}

impl Config {
    /// Create a new empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the config file path
    ///
    /// Returns ~/.config/mentor/config.toml on Linux/macOS
    pub fn config_path() -> ConfigResult<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE))
    }

    /// Get the config directory path
    ///
    /// Returns ~/.config/mentor on Linux/macOS
    pub fn config_dir() -> ConfigResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME))
    }

    /// Load configuration from the default location
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> ConfigResult<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load configuration from `path`, or defaults if it doesn't exist
    pub fn load_from(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to the default location
    pub fn save(&self) -> ConfigResult<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> ConfigResult<()> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Check if any configuration is set
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Resolve defaults and produce the settings the daemon runs with.
    pub fn into_settings(self) -> ConfigResult<DaemonSettings> {
        let bind = match self.bind.as_deref() {
            Some(value) => value.parse::<IpAddr>().map_err(|_| ConfigError::InvalidValue {
                field: "bind",
                value: value.to_string(),
            })?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let status_addr = match self.status.as_deref() {
            Some(value) => Some(value.parse::<SocketAddr>().map_err(|_| {
                ConfigError::InvalidValue {
                    field: "status",
                    value: value.to_string(),
                }
            })?),
            None => None,
        };

        let generate = self.generate_cert.unwrap_or(false);
        let identity = match (self.cert, self.key) {
            (Some(cert_path), Some(key_path)) => Some(IdentitySettings {
                cert_path,
                key_path,
                generate,
                hostnames: self.hostnames.clone(),
            }),
            (None, None) if generate => {
                let dir = Self::config_dir()?.join("tls");
                Some(IdentitySettings {
                    cert_path: dir.join("cert.pem"),
                    key_path: dir.join("key.pem"),
                    generate,
                    hostnames: self.hostnames.clone(),
                })
            }
            (None, None) => None,
            (Some(cert), None) => {
                return Err(ConfigError::InvalidValue {
                    field: "key",
                    value: format!("missing (cert is {})", cert.display()),
                })
            }
            (None, Some(key)) => {
                return Err(ConfigError::InvalidValue {
                    field: "cert",
                    value: format!("missing (key is {})", key.display()),
                })
            }
        };

        let limits = self.limits.unwrap_or_default();
        let mut transfer = TransferLimits::default();
        if let Some(chunk_size) = limits.chunk_size {
            if chunk_size == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "limits.chunk_size",
                    value: "0".to_string(),
                });
            }
            transfer.chunk_size = chunk_size;
        }
        if let Some(secs) = limits.header_timeout_secs {
            transfer.header_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = limits.write_timeout_secs {
            transfer.write_timeout = Duration::from_secs(secs);
        }
        if let Some(allow) = self.allow_listing {
            transfer.allow_listing = allow;
        }

        let mut listener = ListenerLimits::default();
        if let Some(max) = limits.max_connections {
            listener.max_connections = max;
        }
        if let Some(secs) = limits.handshake_timeout_secs {
            listener.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = limits.drain_timeout_secs {
            listener.drain_timeout = Duration::from_secs(secs);
        }

        let upnp_config = self.upnp.unwrap_or_default();
        let mut upnp = UpnpSettings {
            enabled: upnp_config.enabled.unwrap_or(true),
            ..Default::default()
        };
        if let Some(lease) = upnp_config.lease_secs {
            upnp.mapper.lease_seconds = lease;
        }

        Ok(DaemonSettings {
            bind,
            port: self.port.unwrap_or(DEFAULT_PORT),
            tls_port: self.tls_port,
            identity,
            shares: self.shares,
            transfer,
            listener,
            upnp,
            status_addr,
        })
    }
}

/// Format the configuration for display
pub fn format_config(config: &Config) -> String {
    fn or_unset<T: std::fmt::Display>(value: Option<T>, default: &str) -> String {
        match value {
            Some(v) => v.to_string(),
            None => format!("(not set, using {})", default),
        }
    }

    let mut lines = Vec::new();

    lines.push("Current configuration:".to_string());
    lines.push(String::new());

    lines.push(format!("  bind = {}", or_unset(config.bind.as_deref(), "0.0.0.0")));
    lines.push(format!(
        "  port = {}",
        or_unset(config.port, &DEFAULT_PORT.to_string())
    ));
    lines.push(format!("  tls_port = {}", or_unset(config.tls_port, "none")));
    lines.push(format!(
        "  cert = {}",
        or_unset(config.cert.as_ref().map(|p| p.display()), "none")
    ));
    // Only the path; key material is never printed
    lines.push(format!(
        "  key = {}",
        or_unset(config.key.as_ref().map(|p| p.display()), "none")
    ));
    lines.push(format!(
        "  generate_cert = {}",
        or_unset(config.generate_cert, "false")
    ));
    lines.push(format!(
        "  allow_listing = {}",
        or_unset(config.allow_listing, "true")
    ));
    lines.push(format!("  status = {}", or_unset(config.status.as_deref(), "off")));

    let upnp = config.upnp.clone().unwrap_or_default();
    lines.push(format!("  upnp.enabled = {}", or_unset(upnp.enabled, "true")));
    lines.push(format!(
        "  upnp.lease_secs = {}",
        or_unset(upnp.lease_secs, "3600")
    ));

    if config.shares.is_empty() {
        lines.push("  shares = (none)".to_string());
    } else {
        lines.push("  shares:".to_string());
        for share in &config.shares {
            let allow = if share.allow.is_empty() {
                String::new()
            } else {
                format!(" (allow: {})", share.allow.join(", "))
            };
            lines.push(format!(
                "    {} -> {}{}",
                share.public_path,
                share.local_path.display(),
                allow
            ));
        }
    }

    lines.join("\n")
}
