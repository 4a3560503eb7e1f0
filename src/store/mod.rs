//! Backing store contract
//!
//! The agent never owns address-pool state. Pools, blocks and address
//! assignments live in a distributed store; this module describes the
//! small set of operations the engine consumes from it.
//!
//! ## Consistency
//!
//! - `allocate_ip` is the linearization point for address uniqueness: it
//!   must claim the first free slot of a block atomically.
//! - `acquire_block` must hand an unused block to exactly one node.
//! - `free_ip` is a conditional write keyed on the [`Revision`] read by
//!   `get_address_info`; a stale revision yields [`StoreError::ModRevDiffers`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

pub use memory::{MemoryStore, PoolSpec};

/// Errors reported by a backing store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("block is full")]
    BlockIsFull,

    #[error("no more blocks in pool")]
    OutOfBlocks,

    #[error("modification revision differs")]
    ModRevDiffers,

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A named address pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
}

/// Binding of one allocated address to a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAssignment {
    pub container_id: String,
    pub namespace: String,
    pub pod_name: String,
    pub created_at: DateTime<Utc>,
}

impl AddressAssignment {
    pub fn new(container_id: &str, namespace: &str, pod_name: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Optimistic-concurrency stamp of a stored assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An assignment together with the revision it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub assignment: AddressAssignment,
    pub revision: Revision,
}

/// Operations the engine needs from the distributed address-pool store
#[async_trait]
pub trait AddressStore: Send + Sync {
    /// Pool registered under exactly `namespace`.
    async fn get_pool(&self, namespace: &str) -> StoreResult<Pool>;

    /// Blocks owned by `node`, keyed by pool name.
    async fn get_my_blocks(&self, node: &str) -> StoreResult<HashMap<String, Vec<IpNet>>>;

    /// Atomically claim one free address in `block`.
    async fn allocate_ip(&self, block: &IpNet, assignment: &AddressAssignment) -> StoreResult<IpAddr>;

    /// Atomically claim an unused block of `pool` for `node`.
    async fn acquire_block(&self, node: &str, pool: &str) -> StoreResult<IpNet>;

    /// Conditionally release `address` if it is still at `revision`.
    async fn free_ip(&self, block: &IpNet, address: IpAddr, revision: Revision) -> StoreResult<()>;

    async fn get_address_info(&self, address: IpAddr) -> StoreResult<AddressInfo>;

    /// All live assignments inside `block`; used to rebuild local state on startup.
    async fn list_assignments(&self, block: &IpNet) -> StoreResult<Vec<(IpAddr, AddressAssignment)>>;
}
