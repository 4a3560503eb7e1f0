//! Address management engine
//!
//! # Architecture
//!
//! ```text
//! allocate ──→ PoolResolver ──→ NodeBlockRegistry ──→ store.allocate_ip
//!                                      ↑                    │ all blocks full
//!                                      └── BlockAcquirer ←──┘ (escalation)
//!
//! release  ──→ NodeBlockRegistry (address → block) ──→ store.free_ip
//! ```
//!
//! There is no engine-wide lock. Address uniqueness is enforced by the
//! store's per-block claim, release by a conditional free keyed on the
//! assignment's revision. The only local mutual exclusion is the per-pool
//! escalation lock guarding block acquisition.

pub mod acquirer;
pub mod allocate;
pub mod index;
pub mod pool;
pub mod registry;
pub mod release;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::routing::RouteInstaller;
use crate::store::{AddressInfo, AddressStore, StoreError};

pub use acquirer::BlockAcquirer;
pub use index::{legacy_key, ContainerIndex};
pub use pool::{PoolResolver, DEFAULT_POOL};
pub use registry::{BlockSet, NodeBlockRegistry};

/// Node view reported by the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node: String,
    pub pools: BTreeMap<String, Vec<IpNet>>,
    pub containers: usize,
}

/// What the local index says about a key, checked against the store
#[derive(Debug)]
pub(crate) enum Cached {
    Absent,
    Live(IpAddr, AddressInfo),
    Stale(IpAddr),
}

/// The allocation / release engine of one node
pub struct IpamEngine {
    store: Arc<dyn AddressStore>,
    pools: PoolResolver,
    registry: NodeBlockRegistry,
    acquirer: BlockAcquirer,
    index: ContainerIndex,
}

impl std::fmt::Debug for IpamEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpamEngine")
            .field("registry", &self.registry)
            .field("containers", &self.index.len())
            .finish()
    }
}

impl IpamEngine {
    pub fn new(
        node: &str,
        store: Arc<dyn AddressStore>,
        routes: Arc<dyn RouteInstaller>,
        dry_run: bool,
    ) -> Self {
        Self {
            pools: PoolResolver::new(store.clone()),
            registry: NodeBlockRegistry::new(node),
            acquirer: BlockAcquirer::new(node, store.clone(), routes, dry_run),
            index: ContainerIndex::new(),
            store,
        }
    }

    pub fn node_name(&self) -> &str {
        self.registry.node()
    }

    pub fn registry(&self) -> &NodeBlockRegistry {
        &self.registry
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node: self.registry.node().to_string(),
            pools: self.registry.pools(),
            containers: self.index.len(),
        }
    }

    /// Rebuild local state from the store: owned blocks and the container index.
    #[instrument(skip(self), fields(node = %self.registry.node()))]
    pub async fn recover(&self) -> Result<usize> {
        self.registry.refresh(self.store.as_ref()).await?;

        let mut recovered = 0;
        for block in self.registry.snapshot_all() {
            for (address, assignment) in self.store.list_assignments(&block).await? {
                if self.index.insert_if_absent(&assignment.container_id, address) {
                    recovered += 1;
                } else {
                    warn!(
                        container_id = %assignment.container_id,
                        ip = %address,
                        "Container holds more than one address"
                    );
                }
            }
        }

        info!(containers = recovered, "Recovered address assignments");
        Ok(recovered)
    }

    /// Resolve `key` through the index and confirm it with the store.
    pub(crate) async fn cached(&self, key: &str) -> Result<Cached> {
        let Some(address) = self.index.get(key) else {
            return Ok(Cached::Absent);
        };
        match self.store.get_address_info(address).await {
            Ok(info) if info.assignment.container_id == key => Ok(Cached::Live(address, info)),
            Ok(_) | Err(StoreError::NotFound) => Ok(Cached::Stale(address)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Run `fut`, giving up with [`Error::Timeout`] once `limit` elapses.
///
/// Nothing is undone when the deadline fires; a block claimed before that
/// point stays claimed.
pub async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout)?
}
