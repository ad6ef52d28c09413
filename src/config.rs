//! Pool configuration.

use crate::dist::DistType;
use crate::error::Error;
use crate::hashkit::HashType;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

/// Top-level configuration: the pool records plus ambient settings.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pools: Vec<PoolConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, Error> {
        let config: Config = toml::from_str(content)
            .map_err(|e| Error::ConfigInvalid(e.to_string()))?;
        config.ensure_valid()?;
        Ok(config)
    }

    fn ensure_valid(&self) -> Result<(), Error> {
        if self.pools.is_empty() {
            return Err(Error::ConfigInvalid(
                "configuration must declare at least one pool".into(),
            ));
        }
        let mut names = HashSet::new();
        for pool in &self.pools {
            pool.ensure_valid()?;
            if !names.insert(pool.name.as_str()) {
                return Err(Error::ConfigInvalid(format!(
                    "duplicate pool name: {}",
                    pool.name
                )));
            }
        }
        Ok(())
    }
}

/// One pool record: a listening endpoint and its backend fleet.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub name: String,

    /// `host:port` or a unix socket path.
    pub listen: String,

    /// Unix socket permission bits.
    #[serde(default)]
    pub perm: Option<u32>,

    #[serde(default = "PoolConfig::default_hash")]
    pub hash: HashType,

    /// Exactly two distinct delimiter bytes, e.g. `"{}"`.
    #[serde(default)]
    pub hash_tag: Option<String>,

    #[serde(default = "PoolConfig::default_distribution")]
    pub distribution: DistType,

    /// Per-request timeout in milliseconds.
    #[serde(default = "PoolConfig::default_timeout")]
    pub timeout: u64,

    #[serde(default = "PoolConfig::default_backlog")]
    pub backlog: u32,

    /// Maximum client connections; 0 means unlimited.
    #[serde(default = "PoolConfig::default_client_connections")]
    pub client_connections: u32,

    /// Connections opened to each backend server.
    #[serde(default = "PoolConfig::default_server_connections")]
    pub server_connections: u32,

    /// How long an ejected server stays out, in milliseconds.
    #[serde(default = "PoolConfig::default_server_retry_timeout")]
    pub server_retry_timeout: u64,

    /// Consecutive failures before ejection.
    #[serde(default = "PoolConfig::default_server_failure_limit")]
    pub server_failure_limit: u32,

    #[serde(default)]
    pub auto_eject_hosts: bool,

    #[serde(default)]
    pub preconnect: bool,

    #[serde(default)]
    pub redis: bool,

    #[serde(default)]
    pub redis_auth: Option<String>,

    #[serde(default)]
    pub redis_db: Option<u32>,

    /// Backend records, `"host:port:weight name?"`.
    pub servers: Vec<String>,
}

impl PoolConfig {
    fn default_hash() -> HashType {
        HashType::Fnv1a64
    }

    fn default_distribution() -> DistType {
        DistType::Ketama
    }

    fn default_timeout() -> u64 {
        400
    }

    fn default_backlog() -> u32 {
        512
    }

    fn default_client_connections() -> u32 {
        1024
    }

    fn default_server_connections() -> u32 {
        1
    }

    fn default_server_retry_timeout() -> u64 {
        30_000
    }

    fn default_server_failure_limit() -> u32 {
        2
    }

    fn ensure_valid(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::ConfigInvalid("pool name cannot be empty".into()));
        }
        if self.listen.trim().is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "pool {}: listen cannot be empty",
                self.name
            )));
        }
        if self.servers.is_empty() {
            return Err(Error::ConfigInvalid(format!(
                "pool {}: must provide at least one server",
                self.name
            )));
        }
        if self.server_connections == 0 {
            return Err(Error::ConfigInvalid(format!(
                "pool {}: server_connections must be at least 1",
                self.name
            )));
        }
        self.hash_tag_bytes()?;
        for record in &self.servers {
            let server = ServerConfig::parse(record)?;
            if server.weight == 0 && self.distribution != DistType::Ketama {
                return Err(Error::ConfigInvalid(format!(
                    "pool {}: server {} has weight 0 under {:?} distribution",
                    self.name, record, self.distribution
                )));
            }
        }
        if !self.redis && (self.redis_auth.is_some() || self.redis_db.is_some()) {
            return Err(Error::ConfigInvalid(format!(
                "pool {}: redis_auth/redis_db require redis = true",
                self.name
            )));
        }
        Ok(())
    }

    /// The hash-tag delimiter pair, if configured.
    pub fn hash_tag_bytes(&self) -> Result<Option<(u8, u8)>, Error> {
        match self.hash_tag.as_deref() {
            None | Some("") => Ok(None),
            Some(tag) => {
                let bytes = tag.as_bytes();
                if bytes.len() != 2 || bytes[0] == bytes[1] {
                    return Err(Error::ConfigInvalid(format!(
                        "pool {}: hash_tag must be two distinct bytes",
                        self.name
                    )));
                }
                Ok(Some((bytes[0], bytes[1])))
            }
        }
    }
}

/// A parsed backend server record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    /// Optional alias used for ketama point derivation.
    pub name: Option<String>,
}

impl ServerConfig {
    /// Parse a `"host:port:weight name?"` record.
    pub fn parse(record: &str) -> Result<Self, Error> {
        let invalid = || {
            Error::ConfigInvalid(format!(
                "server record {record:?} is not host:port:weight name?"
            ))
        };

        let mut fields = record.split_whitespace();
        let addr = fields.next().ok_or_else(invalid)?;
        let name = fields.next().map(str::to_owned);
        if fields.next().is_some() {
            return Err(invalid());
        }

        let (rest, weight) = addr.rsplit_once(':').ok_or_else(invalid)?;
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        if host.is_empty() {
            return Err(invalid());
        }
        let port: u16 = port.parse().map_err(|_| invalid())?;
        let weight: u32 = weight.parse().map_err(|_| invalid())?;

        Ok(ServerConfig {
            host: host.to_owned(),
            port,
            weight,
            name,
        })
    }

    /// Display name, `host:port:weight`.
    pub fn pname(&self) -> String {
        format!("{}:{}:{}", self.host, self.port, self.weight)
    }

    /// Identity used for continuum point derivation: the alias if one
    /// was configured, otherwise `host:port`.
    pub fn identity(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Log output shape. An unrecognized value is a config error rather
/// than a fallback, so a typo cannot silently change the log stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Logging configuration for the embedding proxy.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `"info"` or `"shardmux=debug"`.
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}
