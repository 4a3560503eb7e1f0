//! Address allocation
//!
//! Scan the pool's blocks newest first and claim the first free address.
//! When every block is full, acquire one more block for the node, put it
//! at the front, and scan again. The loop ends on success or on a terminal
//! error from acquisition (pool exhausted, pool missing, route failure).

use ipnet::IpNet;
use std::net::IpAddr;
use tracing::{debug, error, info, instrument, warn};

use super::{BlockSet, Cached, IpamEngine};
use crate::error::{Error, Result};
use crate::metrics::ALLOCATIONS_TOTAL;
use crate::store::{AddressAssignment, StoreError};

impl IpamEngine {
    /// Allocate an address for a container.
    ///
    /// Fails with [`Error::AlreadyAssigned`] if the container already holds
    /// one; the caller is expected to release it first.
    #[instrument(skip(self), fields(node = %self.registry.node(), pool = tracing::field::Empty))]
    pub async fn allocate(&self, container_id: &str, namespace: &str, pod_name: &str) -> Result<IpAddr> {
        let pool = self.pools.resolve(namespace).await?;
        tracing::Span::current().record("pool", pool.as_str());

        match self.cached(container_id).await? {
            Cached::Live(address, info) => {
                warn!(
                    container_id = %container_id,
                    ip = %address,
                    revision = %info.revision,
                    "Container already has an address"
                );
                ALLOCATIONS_TOTAL.with_label_values(&[pool.as_str(), "conflict"]).inc();
                return Err(Error::AlreadyAssigned(container_id.to_string()));
            }
            Cached::Stale(address) => {
                debug!(container_id = %container_id, ip = %address, "Dropping stale index entry");
                self.index.remove_if(container_id, address);
            }
            Cached::Absent => {}
        }

        self.registry.refresh(self.store.as_ref()).await?;
        let assignment = AddressAssignment::new(container_id, namespace, pod_name);

        let mut set = self.registry.snapshot(&pool);
        loop {
            if let Some((block, address)) = self.claim_from(&set, &assignment).await? {
                return self.commit(&pool, block, address, &assignment).await;
            }
            set = match self.escalate(&pool, set.generation).await {
                Ok(set) => set,
                Err(e) => {
                    ALLOCATIONS_TOTAL.with_label_values(&[pool.as_str(), "failed"]).inc();
                    return Err(e);
                }
            };
        }
    }

    /// Try each block in order; `None` when all of them are full.
    async fn claim_from(
        &self,
        set: &BlockSet,
        assignment: &AddressAssignment,
    ) -> Result<Option<(IpNet, IpAddr)>> {
        for block in &set.blocks {
            match self.store.allocate_ip(block, assignment).await {
                Ok(address) => return Ok(Some((*block, address))),
                Err(StoreError::BlockIsFull) => {
                    debug!(block = %block, "Block is full");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    /// Extend `pool` by one block, unless someone else already changed it
    /// since generation `seen`.
    async fn escalate(&self, pool: &str, seen: u64) -> Result<BlockSet> {
        let lock = self.registry.escalation_lock(pool);
        let _guard = lock.lock().await;

        if self.registry.generation(pool) != seen {
            debug!(pool = %pool, "Block set changed while waiting, rescanning");
            return Ok(self.registry.snapshot(pool));
        }

        let block = self.acquirer.acquire(pool).await?;
        Ok(self.registry.prepend(pool, block))
    }

    async fn commit(
        &self,
        pool: &str,
        block: IpNet,
        address: IpAddr,
        assignment: &AddressAssignment,
    ) -> Result<IpAddr> {
        if !self.index.insert_if_absent(&assignment.container_id, address) {
            warn!(
                container_id = %assignment.container_id,
                ip = %address,
                "Concurrent allocation for the same container, giving the address back"
            );
            if let Err(e) = self.give_back(block, address, &assignment.container_id).await {
                ALLOCATIONS_TOTAL.with_label_values(&[pool, "failed"]).inc();
                return Err(e.into());
            }
            ALLOCATIONS_TOTAL.with_label_values(&[pool, "conflict"]).inc();
            return Err(Error::AlreadyAssigned(assignment.container_id.clone()));
        }

        ALLOCATIONS_TOTAL.with_label_values(&[pool, "ok"]).inc();
        info!(
            namespace = %assignment.namespace,
            pod = %assignment.pod_name,
            container_id = %assignment.container_id,
            pool = %pool,
            block = %block,
            ip = %address,
            "Allocated an address"
        );
        Ok(address)
    }

    /// Free an address this request claimed but lost to a duplicate request.
    ///
    /// A store failure here leaves the container with two live addresses.
    async fn give_back(
        &self,
        block: IpNet,
        address: IpAddr,
        container_id: &str,
    ) -> std::result::Result<(), StoreError> {
        let result = match self.store.get_address_info(address).await {
            Ok(info) if info.assignment.container_id == container_id => {
                self.store.free_ip(&block, address, info.revision).await
            }
            Ok(_) | Err(StoreError::NotFound) => Ok(()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) | Err(StoreError::ModRevDiffers) => Ok(()),
            Err(e) => {
                error!(
                    severity = "critical",
                    container_id = %container_id,
                    block = %block,
                    ip = %address,
                    error = %e,
                    "Failed to free duplicate claim, container holds two addresses"
                );
                Err(e)
            }
        }
    }
}
