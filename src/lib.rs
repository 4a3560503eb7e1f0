// node-ipam - node-local IP address management for container networks
// Hands out pod addresses from per-node CIDR blocks of shared pools

#![warn(rust_2018_idioms)]

pub mod client;
pub mod config;
pub mod ipam;
pub mod metrics;
pub mod routing;
pub mod server;
pub mod store;

// Re-exports for convenience
pub use config::AgentConfig;
pub use ipam::IpamEngine;
pub use store::{AddressStore, MemoryStore, PoolSpec};

/// Agent error types
pub mod error {
    use std::net::IpAddr;

    use ipnet::IpNet;
    use thiserror::Error;

    use crate::store::StoreError;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Bad request: {0}")]
        BadRequest(String),

        #[error("Container {0} already has an address")]
        AlreadyAssigned(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("No more blocks in pool {pool}")]
        OutOfBlocks { pool: String },

        #[error("Address pool is not found: {pool}")]
        PoolNotFound { pool: String },

        #[error("Orphaned IP address: {0}")]
        OrphanedAddress(IpAddr),

        #[error("Failed to add block {block} to routing table: {reason}")]
        RouteInstall { block: IpNet, reason: String },

        #[error("Store error: {0}")]
        Store(#[from] StoreError),

        #[error("Operation timed out")]
        Timeout,

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Internal error: {0}")]
        Internal(String),
    }

    /// How a failure is reported across the request boundary
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ErrorKind {
        BadRequest,
        Conflict,
        NotFound,
        CapacityUnavailable,
        Internal,
    }

    impl Error {
        pub fn kind(&self) -> ErrorKind {
            match self {
                Error::BadRequest(_) => ErrorKind::BadRequest,
                Error::AlreadyAssigned(_) => ErrorKind::Conflict,
                Error::NotFound(_) => ErrorKind::NotFound,
                Error::OutOfBlocks { .. } => ErrorKind::CapacityUnavailable,
                _ => ErrorKind::Internal,
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
