//! Address release and lookup

use std::net::IpAddr;
use tracing::{debug, error, info, instrument};

use super::{legacy_key, Cached, IpamEngine};
use crate::error::{Error, Result};
use crate::metrics::RELEASES_TOTAL;
use crate::store::StoreError;

impl IpamEngine {
    /// Release the address held by `container_id`.
    ///
    /// Idempotent: `Ok(None)` when the container holds nothing, when its
    /// address was reassigned, or when a concurrent writer got there first.
    pub async fn release(&self, container_id: &str) -> Result<Option<IpAddr>> {
        self.release_key(container_id, None).await
    }

    /// Like [`release`](Self::release), also trying the `namespace/pod` key
    /// older agents recorded addresses under.
    pub async fn release_pod(
        &self,
        namespace: &str,
        pod_name: &str,
        container_id: &str,
    ) -> Result<Option<IpAddr>> {
        let legacy = legacy_key(namespace, pod_name);
        self.release_key(container_id, Some(&legacy)).await
    }

    #[instrument(skip(self), fields(node = %self.registry.node()))]
    async fn release_key(&self, container_id: &str, legacy: Option<&str>) -> Result<Option<IpAddr>> {
        // Take the block view before looking the address up.
        self.registry.refresh(self.store.as_ref()).await?;
        let owned = self.registry.snapshot_all();

        let Some((key, address)) = self.find_entry(container_id, legacy) else {
            debug!(container_id = %container_id, "No address recorded for container");
            RELEASES_TOTAL.with_label_values(&["absent"]).inc();
            return Ok(None);
        };

        let info = match self.store.get_address_info(address).await {
            Ok(info) => info,
            Err(StoreError::NotFound) => {
                debug!(container_id = %key, ip = %address, "Address is no longer assigned");
                self.index.remove_if(&key, address);
                RELEASES_TOTAL.with_label_values(&["absent"]).inc();
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(block) = owned.iter().find(|block| block.contains(&address)).copied() else {
            error!(
                severity = "critical",
                container_id = %key,
                ip = %address,
                "Orphaned IP address"
            );
            RELEASES_TOTAL.with_label_values(&["orphaned"]).inc();
            return Err(Error::OrphanedAddress(address));
        };

        if info.assignment.container_id != key {
            info!(
                container_id = %key,
                owner = %info.assignment.container_id,
                ip = %address,
                "Address was reassigned, nothing to release"
            );
            self.index.remove_if(&key, address);
            RELEASES_TOTAL.with_label_values(&["absent"]).inc();
            return Ok(None);
        }

        match self.store.free_ip(&block, address, info.revision).await {
            Ok(()) => {}
            Err(StoreError::ModRevDiffers) => {
                debug!(
                    container_id = %key,
                    ip = %address,
                    revision = %info.revision,
                    "Address changed concurrently, already released"
                );
                self.index.remove_if(&key, address);
                RELEASES_TOTAL.with_label_values(&["raced"]).inc();
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        self.index.remove_if(&key, address);
        RELEASES_TOTAL.with_label_values(&["ok"]).inc();
        info!(
            namespace = %info.assignment.namespace,
            pod = %info.assignment.pod_name,
            container_id = %key,
            block = %block,
            ip = %address,
            "Freed an address"
        );
        Ok(Some(address))
    }

    fn find_entry(&self, container_id: &str, legacy: Option<&str>) -> Option<(String, IpAddr)> {
        if let Some(address) = self.index.get(container_id) {
            return Some((container_id.to_string(), address));
        }
        let key = legacy?;
        self.index.get(key).map(|address| (key.to_string(), address))
    }

    /// Address currently held by `container_id`.
    pub async fn lookup(&self, container_id: &str) -> Result<IpAddr> {
        match self.cached(container_id).await? {
            Cached::Live(address, _) => Ok(address),
            Cached::Stale(address) => {
                debug!(container_id = %container_id, ip = %address, "Dropping stale index entry");
                self.index.remove_if(container_id, address);
                Err(Error::NotFound(format!("no address for container {}", container_id)))
            }
            Cached::Absent => {
                Err(Error::NotFound(format!("no address for container {}", container_id)))
            }
        }
    }
}
