//! In-process address store
//!
//! A complete implementation of [`AddressStore`] kept in memory. Every
//! operation takes a single lock, so each call is atomic the same way a
//! conditional write against the distributed store is. Used by the agent in
//! standalone / dry-run mode and by the tests.

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

use super::{
    AddressAssignment, AddressInfo, AddressStore, Pool, Revision, StoreError, StoreResult,
};

/// Default block size: 2^5 = 32 addresses per block.
pub const DEFAULT_BLOCK_SIZE_BITS: u8 = 5;

fn default_block_size_bits() -> u8 {
    DEFAULT_BLOCK_SIZE_BITS
}

/// Address pool definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSpec {
    pub name: String,
    pub subnets: Vec<IpNet>,
    /// Each block holds `2^block_size_bits` addresses.
    #[serde(default = "default_block_size_bits")]
    pub block_size_bits: u8,
}

impl PoolSpec {
    pub fn new(name: &str, subnets: Vec<IpNet>, block_size_bits: u8) -> Self {
        Self {
            name: name.to_string(),
            subnets,
            block_size_bits,
        }
    }

    /// Check that blocks of the configured size can be carved from every subnet.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("pool name is empty".to_string());
        }
        if self.subnets.is_empty() {
            return Err(format!("pool {} has no subnets", self.name));
        }
        for subnet in &self.subnets {
            let host_bits = subnet.max_prefix_len() - subnet.prefix_len();
            if self.block_size_bits > host_bits || self.block_size_bits >= 64 {
                return Err(format!(
                    "pool {}: block size 2^{} does not fit in {}",
                    self.name, self.block_size_bits, subnet
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug)]
struct BlockState {
    pool: String,
    node: String,
    seq: u64,
    used: BTreeSet<u64>,
}

#[derive(Debug, Clone)]
struct StoredAddress {
    assignment: AddressAssignment,
    revision: Revision,
}

#[derive(Debug, Default)]
struct Inner {
    pools: HashMap<String, PoolSpec>,
    blocks: HashMap<IpNet, BlockState>,
    addresses: HashMap<IpAddr, StoredAddress>,
    revision: u64,
    acquired: u64,
    unavailable: Option<String>,
}

impl Inner {
    fn check_available(&self) -> StoreResult<()> {
        match &self.unavailable {
            Some(reason) => Err(StoreError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn next_revision(&mut self) -> Revision {
        self.revision += 1;
        Revision(self.revision)
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with the given pools.
    pub fn with_pools(pools: impl IntoIterator<Item = PoolSpec>) -> Self {
        let store = Self::new();
        for pool in pools {
            store.add_pool(pool);
        }
        store
    }

    pub fn add_pool(&self, pool: PoolSpec) {
        self.inner.lock().pools.insert(pool.name.clone(), pool);
    }

    /// Node currently owning `block`, if any.
    pub fn owner_of(&self, block: &IpNet) -> Option<String> {
        self.inner.lock().blocks.get(block).map(|b| b.node.clone())
    }

    /// Number of live assignments.
    pub fn assignment_count(&self) -> usize {
        self.inner.lock().addresses.len()
    }

    /// Take `block` away from its node, leaving any live addresses behind.
    ///
    /// This is what a controller does when it reclaims a block; addresses
    /// still recorded inside it become orphans.
    pub fn reclaim_block(&self, block: &IpNet) -> bool {
        self.inner.lock().blocks.remove(block).is_some()
    }

    /// Rewrite the record of `address`, bumping its revision.
    pub fn touch(&self, address: IpAddr) -> Option<Revision> {
        let mut inner = self.inner.lock();
        let revision = inner.next_revision();
        let stored = inner.addresses.get_mut(&address)?;
        stored.revision = revision;
        Some(revision)
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.inner.lock().unavailable = reason.map(str::to_string);
    }
}

/// Number of addresses in `block`.
fn block_len(block: &IpNet) -> u64 {
    let host_bits = u32::from(block.max_prefix_len() - block.prefix_len());
    1u64.checked_shl(host_bits).unwrap_or(u64::MAX)
}

fn nth_address(block: &IpNet, n: u64) -> IpAddr {
    match block {
        IpNet::V4(net) => IpAddr::V4(Ipv4Addr::from(
            u32::from(net.network()).wrapping_add(n as u32),
        )),
        IpNet::V6(net) => IpAddr::V6(Ipv6Addr::from(
            u128::from(net.network()).wrapping_add(u128::from(n)),
        )),
    }
}

fn offset_of(block: &IpNet, address: IpAddr) -> Option<u64> {
    if !block.contains(&address) {
        return None;
    }
    match (block, address) {
        (IpNet::V4(net), IpAddr::V4(addr)) => Some(u64::from(u32::from(addr) - u32::from(net.network()))),
        (IpNet::V6(net), IpAddr::V6(addr)) => {
            u64::try_from(u128::from(addr) - u128::from(net.network())).ok()
        }
        _ => None,
    }
}

#[async_trait]
impl AddressStore for MemoryStore {
    async fn get_pool(&self, namespace: &str) -> StoreResult<Pool> {
        let inner = self.inner.lock();
        inner.check_available()?;
        inner
            .pools
            .get(namespace)
            .map(|p| Pool { name: p.name.clone() })
            .ok_or(StoreError::NotFound)
    }

    async fn get_my_blocks(&self, node: &str) -> StoreResult<HashMap<String, Vec<IpNet>>> {
        let inner = self.inner.lock();
        inner.check_available()?;

        let mut owned: Vec<(&IpNet, &BlockState)> =
            inner.blocks.iter().filter(|(_, b)| b.node == node).collect();
        // Most recently acquired first.
        owned.sort_by(|a, b| b.1.seq.cmp(&a.1.seq));

        let mut result: HashMap<String, Vec<IpNet>> = HashMap::new();
        for (net, state) in owned {
            result.entry(state.pool.clone()).or_default().push(*net);
        }
        Ok(result)
    }

    async fn allocate_ip(&self, block: &IpNet, assignment: &AddressAssignment) -> StoreResult<IpAddr> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        let len = block_len(block);
        let state = inner
            .blocks
            .get_mut(block)
            .ok_or_else(|| StoreError::InvalidBlock(block.to_string()))?;

        let offset = (0..len)
            .find(|n| !state.used.contains(n))
            .ok_or(StoreError::BlockIsFull)?;
        state.used.insert(offset);

        let address = nth_address(block, offset);
        let revision = inner.next_revision();
        inner.addresses.insert(
            address,
            StoredAddress {
                assignment: assignment.clone(),
                revision,
            },
        );
        debug!(block = %block, ip = %address, revision = %revision, "Claimed address");
        Ok(address)
    }

    async fn acquire_block(&self, node: &str, pool: &str) -> StoreResult<IpNet> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        let spec = inner.pools.get(pool).cloned().ok_or(StoreError::NotFound)?;
        for subnet in &spec.subnets {
            let prefix = subnet
                .max_prefix_len()
                .checked_sub(spec.block_size_bits)
                .ok_or_else(|| StoreError::InvalidBlock(subnet.to_string()))?;
            let candidates = subnet
                .subnets(prefix)
                .map_err(|e| StoreError::InvalidBlock(e.to_string()))?;
            for candidate in candidates {
                if inner.blocks.contains_key(&candidate) {
                    continue;
                }
                // Records left behind by a reclaimed block keep their slots.
                let used: BTreeSet<u64> = inner
                    .addresses
                    .keys()
                    .filter_map(|addr| offset_of(&candidate, *addr))
                    .collect();
                if !used.is_empty() {
                    debug!(block = %candidate, live = used.len(), "Reusing block with live addresses");
                }
                inner.acquired += 1;
                let seq = inner.acquired;
                inner.blocks.insert(
                    candidate,
                    BlockState {
                        pool: spec.name.clone(),
                        node: node.to_string(),
                        seq,
                        used,
                    },
                );
                return Ok(candidate);
            }
        }
        Err(StoreError::OutOfBlocks)
    }

    async fn free_ip(&self, block: &IpNet, address: IpAddr, revision: Revision) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.check_available()?;

        let offset = offset_of(block, address)
            .ok_or_else(|| StoreError::InvalidBlock(format!("{} is not in {}", address, block)))?;

        match inner.addresses.get(&address) {
            Some(stored) if stored.revision == revision => {}
            _ => return Err(StoreError::ModRevDiffers),
        }
        inner.addresses.remove(&address);
        if let Some(state) = inner.blocks.get_mut(block) {
            state.used.remove(&offset);
        }
        inner.next_revision();
        Ok(())
    }

    async fn get_address_info(&self, address: IpAddr) -> StoreResult<AddressInfo> {
        let inner = self.inner.lock();
        inner.check_available()?;
        inner
            .addresses
            .get(&address)
            .map(|stored| AddressInfo {
                assignment: stored.assignment.clone(),
                revision: stored.revision,
            })
            .ok_or(StoreError::NotFound)
    }

    async fn list_assignments(&self, block: &IpNet) -> StoreResult<Vec<(IpAddr, AddressAssignment)>> {
        let inner = self.inner.lock();
        inner.check_available()?;
        let mut found: Vec<(IpAddr, AddressAssignment)> = inner
            .addresses
            .iter()
            .filter(|(addr, _)| block.contains(*addr))
            .map(|(addr, stored)| (*addr, stored.assignment.clone()))
            .collect();
        found.sort_by_key(|(addr, _)| *addr);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    fn store() -> MemoryStore {
        MemoryStore::with_pools([PoolSpec::new("default", vec![net("10.0.0.0/30")], 1)])
    }

    #[test]
    fn test_pool_spec_validate() {
        assert!(PoolSpec::new("default", vec![net("10.0.0.0/24")], 5).validate().is_ok());
        assert!(PoolSpec::new("default", vec![], 5).validate().is_err());
        assert!(PoolSpec::new("default", vec![net("10.0.0.0/28")], 5).validate().is_err());
    }

    #[tokio::test]
    async fn test_acquire_until_out_of_blocks() {
        let store = store();
        let first = store.acquire_block("node1", "default").await.unwrap();
        let second = store.acquire_block("node2", "default").await.unwrap();
        assert_eq!(first, net("10.0.0.0/31"));
        assert_eq!(second, net("10.0.0.2/31"));
        assert_eq!(
            store.acquire_block("node1", "default").await,
            Err(StoreError::OutOfBlocks)
        );
        assert_eq!(
            store.acquire_block("node1", "missing").await,
            Err(StoreError::NotFound)
        );
        assert_eq!(store.owner_of(&second).as_deref(), Some("node2"));
    }

    #[tokio::test]
    async fn test_my_blocks_newest_first() {
        let store = MemoryStore::with_pools([PoolSpec::new("default", vec![net("10.0.0.0/29")], 1)]);
        let a = store.acquire_block("node1", "default").await.unwrap();
        let _ = store.acquire_block("node2", "default").await.unwrap();
        let b = store.acquire_block("node1", "default").await.unwrap();

        let mine = store.get_my_blocks("node1").await.unwrap();
        assert_eq!(mine.get("default"), Some(&vec![b, a]));
    }

    #[tokio::test]
    async fn test_allocate_fills_block() {
        let store = store();
        let block = store.acquire_block("node1", "default").await.unwrap();
        let a = AddressAssignment::new("c1", "ns", "pod1");
        let b = AddressAssignment::new("c2", "ns", "pod2");
        let c = AddressAssignment::new("c3", "ns", "pod3");

        assert_eq!(store.allocate_ip(&block, &a).await.unwrap().to_string(), "10.0.0.0");
        assert_eq!(store.allocate_ip(&block, &b).await.unwrap().to_string(), "10.0.0.1");
        assert_eq!(store.allocate_ip(&block, &c).await, Err(StoreError::BlockIsFull));
    }

    #[tokio::test]
    async fn test_free_requires_current_revision() {
        let store = store();
        let block = store.acquire_block("node1", "default").await.unwrap();
        let ip = store
            .allocate_ip(&block, &AddressAssignment::new("c1", "ns", "pod1"))
            .await
            .unwrap();

        let info = store.get_address_info(ip).await.unwrap();
        assert_eq!(info.assignment.container_id, "c1");

        store.touch(ip);
        assert_eq!(
            store.free_ip(&block, ip, info.revision).await,
            Err(StoreError::ModRevDiffers)
        );

        let info = store.get_address_info(ip).await.unwrap();
        store.free_ip(&block, ip, info.revision).await.unwrap();
        assert_eq!(store.get_address_info(ip).await, Err(StoreError::NotFound));
        assert_eq!(
            store.free_ip(&block, ip, info.revision).await,
            Err(StoreError::ModRevDiffers)
        );

        // The slot is reusable once freed.
        let again = store
            .allocate_ip(&block, &AddressAssignment::new("c2", "ns", "pod2"))
            .await
            .unwrap();
        assert_eq!(again, ip);
    }

    #[tokio::test]
    async fn test_unavailable_store() {
        let store = store();
        store.set_unavailable(Some("connection refused"));
        assert!(matches!(
            store.get_pool("default").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_unavailable(None);
        assert!(store.get_pool("default").await.is_ok());
    }

    #[tokio::test]
    async fn test_list_assignments() {
        let store = store();
        let block = store.acquire_block("node1", "default").await.unwrap();
        store
            .allocate_ip(&block, &AddressAssignment::new("c1", "ns", "pod1"))
            .await
            .unwrap();
        let listed = store.list_assignments(&block).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.container_id, "c1");
    }

    #[tokio::test]
    async fn test_reacquired_block_keeps_live_records() {
        let store = store();
        let block = store.acquire_block("node1", "default").await.unwrap();
        let orphan = store
            .allocate_ip(&block, &AddressAssignment::new("c1", "ns", "pod1"))
            .await
            .unwrap();
        assert!(store.reclaim_block(&block));

        let again = store.acquire_block("node2", "default").await.unwrap();
        assert_eq!(again, block);
        let ip = store
            .allocate_ip(&again, &AddressAssignment::new("c2", "ns", "pod2"))
            .await
            .unwrap();
        assert_ne!(ip, orphan);
        assert_eq!(
            store.get_address_info(orphan).await.unwrap().assignment.container_id,
            "c1"
        );
        assert_eq!(
            store
                .allocate_ip(&again, &AddressAssignment::new("c3", "ns", "pod3"))
                .await,
            Err(StoreError::BlockIsFull)
        );
    }
}
