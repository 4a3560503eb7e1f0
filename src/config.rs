//! Agent configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! TOML file, then `NODE_IPAM_*` environment variables (`__` separates
//! nested keys). Command-line flags are applied on top by the binary.

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::{Error, Result};
use crate::ipam::DEFAULT_POOL;
use crate::routing::{DEFAULT_PROTOCOL_ID, DEFAULT_TABLE_ID};
use crate::store::PoolSpec;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "NODE_IPAM";

/// Default API listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9383";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Name of the node this agent serves
    pub node_name: String,
    /// HTTP API bind address
    pub listen_addr: SocketAddr,
    /// Routing table receiving block routes
    pub table_id: u32,
    /// Protocol number of block routes
    pub protocol_id: u8,
    /// Skip route installation
    pub dry_run: bool,
    /// Upper bound for a single API request (seconds)
    pub request_timeout_secs: u64,
    /// Pools served by the in-process store
    #[serde(default)]
    pub pools: Vec<PoolSpec>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9383)),
            table_id: DEFAULT_TABLE_ID,
            protocol_id: DEFAULT_PROTOCOL_ID,
            dry_run: false,
            request_timeout_secs: 30,
            pools: Vec::new(),
        }
    }
}

impl AgentConfig {
    /// Load from defaults, `path` (if any) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Like [`load`](Self::load), reading variables from `env` instead of the
    /// process environment when given.
    pub fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("node_name", "")
            .and_then(|b| b.set_default("listen_addr", DEFAULT_LISTEN_ADDR))
            .and_then(|b| b.set_default("table_id", i64::from(DEFAULT_TABLE_ID)))
            .and_then(|b| b.set_default("protocol_id", i64::from(DEFAULT_PROTOCOL_ID)))
            .and_then(|b| b.set_default("dry_run", false))
            .and_then(|b| b.set_default("request_timeout_secs", 30_i64))
            .map_err(|e| Error::Config(e.to_string()))?;

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: AgentConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(Error::Config("node_name is required".to_string()));
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::Config("request_timeout_secs must be positive".to_string()));
        }
        if self.pools.is_empty() {
            return Err(Error::Config("at least one pool must be configured".to_string()));
        }
        for pool in &self.pools {
            pool.validate().map_err(Error::Config)?;
        }
        if !self.pools.iter().any(|p| p.name == DEFAULT_POOL) {
            warn!("No '{}' pool configured, namespaces without a pool cannot allocate", DEFAULT_POOL);
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
