//! Block acquisition
//!
//! Claims a fresh block for this node from the store and makes it reachable
//! by installing its route. A claimed block whose route cannot be installed
//! stays claimed: there is no way to hand it back.

use ipnet::IpNet;
use std::sync::Arc;
use tracing::{error, info, instrument};

use crate::error::{Error, Result};
use crate::metrics::BLOCKS_ACQUIRED_TOTAL;
use crate::routing::RouteInstaller;
use crate::store::{AddressStore, StoreError};

pub struct BlockAcquirer {
    node: String,
    store: Arc<dyn AddressStore>,
    routes: Arc<dyn RouteInstaller>,
    dry_run: bool,
}

impl BlockAcquirer {
    pub fn new(
        node: &str,
        store: Arc<dyn AddressStore>,
        routes: Arc<dyn RouteInstaller>,
        dry_run: bool,
    ) -> Self {
        Self {
            node: node.to_string(),
            store,
            routes,
            dry_run,
        }
    }

    #[instrument(skip(self), fields(node = %self.node))]
    pub async fn acquire(&self, pool: &str) -> Result<IpNet> {
        let block = match self.store.acquire_block(&self.node, pool).await {
            Ok(block) => block,
            Err(StoreError::OutOfBlocks) => {
                error!(pool = %pool, "No more blocks in pool");
                return Err(Error::OutOfBlocks {
                    pool: pool.to_string(),
                });
            }
            Err(StoreError::NotFound) => {
                error!(pool = %pool, "Address pool is not found");
                return Err(Error::PoolNotFound {
                    pool: pool.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        info!(pool = %pool, block = %block, "Acquired new block");
        BLOCKS_ACQUIRED_TOTAL.with_label_values(&[pool]).inc();

        if self.dry_run {
            info!(block = %block, "Dry run, skipping block route");
            return Ok(block);
        }

        if let Err(e) = self.routes.install_route(&block).await {
            error!(
                severity = "critical",
                pool = %pool,
                block = %block,
                error = %e,
                "Failed to add a block to routing table"
            );
            return Err(Error::RouteInstall {
                block,
                reason: e.to_string(),
            });
        }
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{NoopRouteInstaller, RouteError};
    use crate::store::{MemoryStore, PoolSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingRoutes(AtomicUsize);

    #[async_trait]
    impl RouteInstaller for FailingRoutes {
        async fn install_route(&self, _block: &IpNet) -> std::result::Result<(), RouteError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(RouteError("RTNETLINK answers: Operation not permitted".to_string()))
        }
    }

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::with_pools([PoolSpec::new(
            "default",
            vec!["10.0.0.0/27".parse().unwrap()],
            5,
        )]))
    }

    #[tokio::test]
    async fn test_acquire_then_out_of_blocks() {
        let store = store();
        let acquirer = BlockAcquirer::new("node1", store.clone(), Arc::new(NoopRouteInstaller), false);

        let block = acquirer.acquire("default").await.unwrap();
        assert_eq!(store.owner_of(&block).as_deref(), Some("node1"));
        assert!(matches!(
            acquirer.acquire("default").await,
            Err(Error::OutOfBlocks { .. })
        ));
        assert!(matches!(
            acquirer.acquire("missing").await,
            Err(Error::PoolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_route_failure_keeps_block_claimed() {
        let store = store();
        let routes = Arc::new(FailingRoutes(AtomicUsize::new(0)));
        let acquirer = BlockAcquirer::new("node1", store.clone(), routes.clone(), false);

        match acquirer.acquire("default").await {
            Err(Error::RouteInstall { block, .. }) => {
                assert_eq!(store.owner_of(&block).as_deref(), Some("node1"));
            }
            other => panic!("expected route install error, got {other:?}"),
        }
        assert_eq!(routes.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dry_run_skips_routes() {
        let store = store();
        let routes = Arc::new(FailingRoutes(AtomicUsize::new(0)));
        let acquirer = BlockAcquirer::new("node1", store, routes.clone(), true);

        assert!(acquirer.acquire("default").await.is_ok());
        assert_eq!(routes.0.load(Ordering::SeqCst), 0);
    }
}
