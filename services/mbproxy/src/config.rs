//! Proxy configuration
//!
//! Sources, lowest to highest priority:
//! 1. Built-in defaults
//! 2. Optional YAML file (`--config`)
//! 3. `MBPROXY_` environment variables, nested keys split by `__`
//!    (e.g. `MBPROXY_UPSTREAM__CONNECT_TIMEOUT_MS=2000`)
//! 4. Command-line arguments, applied by `bootstrap`

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};

/// Default listen port
pub const DEFAULT_PORT: u16 = 2502;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MBPROXY_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub upstream: UpstreamConfig,
    pub transactions: TransactionConfig,
    pub queue: QueueConfig,
    pub logging: LoggingConfig,
}

/// Client-facing listener
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    /// Bind address; empty means all interfaces
    pub interface: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            interface: String::new(),
            port: DEFAULT_PORT,
        }
    }
}

/// The single upstream Modbus server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// `host:port` of the real server
    pub address: String,
    pub connect_timeout_ms: u64,
    pub no_delay: bool,
    pub reconnect: ReconnectConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            connect_timeout_ms: 5000,
            no_delay: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 1000,
            backoff_multiplier: 1.0,
            jitter: false,
        }
    }
}

/// Translation table eviction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Unanswered requests older than this are dropped
    pub staleness_secs: u64,
    /// How often the eviction sweep runs
    pub sweep_interval_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            staleness_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity of the shared client-to-upstream request queue
    pub request_capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            request_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Directory for daily rolling log files
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from defaults, an optional YAML file and the environment
    pub fn load(path: Option<&Path>) -> ProxyResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(ProxyConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ProxyError::config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }

        figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ProxyError::config(e.to_string()))
    }

    /// Check the values that would otherwise fail deep inside the runtime
    pub fn validate(&self) -> ProxyResult<()> {
        if self.upstream.address.trim().is_empty() {
            return Err(ProxyError::config("upstream address is required"));
        }
        if !self.upstream.address.contains(':') {
            return Err(ProxyError::config(format!(
                "upstream address '{}' must be host:port",
                self.upstream.address
            )));
        }
        if self.upstream.connect_timeout_ms == 0 {
            return Err(ProxyError::config("upstream.connect_timeout_ms must be > 0"));
        }
        let multiplier = self.upstream.reconnect.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ProxyError::config(
                "upstream.reconnect.backoff_multiplier must be a finite value >= 1.0",
            ));
        }
        if self.transactions.staleness_secs == 0 {
            return Err(ProxyError::config("transactions.staleness_secs must be > 0"));
        }
        if self.transactions.sweep_interval_secs == 0 {
            return Err(ProxyError::config(
                "transactions.sweep_interval_secs must be > 0",
            ));
        }
        if self.queue.request_capacity == 0 {
            return Err(ProxyError::config("queue.request_capacity must be > 0"));
        }
        Ok(())
    }

    /// Address string for the listening socket
    ///
    /// An empty interface means every interface: the IPv6 wildcard, which the
    /// OS normally opens dual-stack so IPv4 clients are accepted too.
    pub fn listen_address(&self) -> String {
        let interface = self.listen.interface.trim();
        if interface.is_empty() {
            format!("[::]:{}", self.listen.port)
        } else if interface.contains(':') && !interface.starts_with('[') {
            format!("[{}]:{}", interface, self.listen.port)
        } else {
            format!("{}:{}", interface, self.listen.port)
        }
    }

    /// Addresses to try in order when binding the listener
    ///
    /// For every interface the IPv4 wildcard is the fallback on hosts without
    /// IPv6.
    pub fn listen_addresses(&self) -> Vec<String> {
        let primary = self.listen_address();
        if self.listen.interface.trim().is_empty() {
            vec![primary, format!("0.0.0.0:{}", self.listen.port)]
        } else {
            vec![primary]
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.connect_timeout_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.transactions.staleness_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.transactions.sweep_interval_secs)
    }
}
