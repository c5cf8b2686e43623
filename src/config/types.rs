//! Configuration types.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::abac::RuleConfig;

/// Top-level configuration, loaded from the YAML file passed on the
/// command line.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Listener bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listener port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Accept SSH sessions without public-key authentication
    #[serde(default)]
    pub no_client_auth: bool,

    /// SSH host private key (OpenSSH PEM)
    pub host_key_path: PathBuf,

    /// User CA public key in authorized-keys format; required unless
    /// `no_client_auth` is set
    #[serde(default)]
    pub user_ca_path: Option<PathBuf>,

    /// MITM certificate material
    pub mitm: MitmConfig,

    /// Event sink and drain endpoint
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// ABAC rule set, by rule name
    #[serde(default)]
    pub abac_rules: HashMap<String, RuleConfig>,

    /// Periodic re-read of the rule set from this same file
    #[serde(default)]
    pub hot_reload: HotReloadConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Paths for the MITM's two TLS identities: the CA pool the upstream
/// database is verified against, and the CA used to sign short-lived
/// client certificates.
#[derive(Debug, Clone, Deserialize)]
pub struct MitmConfig {
    pub database_ca_path: PathBuf,
    pub client_ca_path: PathBuf,
    pub client_private_key_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_notifier_port")]
    pub port: u16,

    /// Bounded event queue size; overflow drops events
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default)]
    pub tls: NotifierTlsConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        NotifierConfig {
            enabled: false,
            host: default_host(),
            port: default_notifier_port(),
            capacity: default_capacity(),
            tls: NotifierTlsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifierTlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// Client certificates are required and verified against this CA
    pub client_ca_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HotReloadConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_reload_period")]
    pub period_secs: u64,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        HotReloadConfig {
            enabled: false,
            period_secs: default_reload_period(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Cross-field validation that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if !self.no_client_auth && self.user_ca_path.is_none() {
            return Err("user_ca_path is required unless no_client_auth is set".into());
        }
        if self.notifier.enabled && self.notifier.tls.enabled {
            let tls = &self.notifier.tls;
            if tls.cert_path.is_none() || tls.key_path.is_none() || tls.client_ca_path.is_none() {
                return Err(
                    "notifier tls requires cert_path, key_path and client_ca_path".into(),
                );
            }
        }
        if self.hot_reload.enabled && self.hot_reload.period_secs == 0 {
            return Err("hot_reload period_secs must be positive".into());
        }
        Ok(())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2222
}

fn default_notifier_port() -> u16 {
    8443
}

fn default_capacity() -> usize {
    1024
}

fn default_reload_period() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}
