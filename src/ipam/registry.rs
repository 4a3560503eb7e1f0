//! Node block registry
//!
//! The ordered set of blocks this node owns, per pool. The registry is
//! refreshed from the store at the start of every request; between
//! refreshes, blocks acquired by this process are prepended so the newest
//! (and therefore non-full) block is probed first.
//!
//! Each pool carries a generation number that changes whenever its block
//! list changes. Escalating requests use it to notice that another request
//! already extended the pool while they were waiting for the pool's
//! escalation lock.

use dashmap::DashMap;
use ipnet::IpNet;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::Result;
use crate::metrics::OWNED_BLOCKS;
use crate::store::AddressStore;

/// Point-in-time view of one pool's blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSet {
    pub pool: String,
    pub blocks: Vec<IpNet>,
    pub generation: u64,
}

#[derive(Debug, Default)]
struct PoolBlocks {
    blocks: Vec<IpNet>,
    generation: u64,
}

impl PoolBlocks {
    fn replace(&mut self, blocks: Vec<IpNet>) -> bool {
        if self.blocks == blocks {
            return false;
        }
        self.blocks = blocks;
        self.generation += 1;
        true
    }
}

#[derive(Debug, Default)]
struct State {
    pools: HashMap<String, PoolBlocks>,
    /// Bumped on every local prepend.
    epoch: u64,
}

/// Blocks owned by this node, keyed by pool
pub struct NodeBlockRegistry {
    node: String,
    state: RwLock<State>,
    escalations: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for NodeBlockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBlockRegistry")
            .field("node", &self.node)
            .finish()
    }
}

/// Keep the local order of blocks the store still lists, then append blocks
/// only the store knows about. With `keep_local`, nothing local is dropped.
fn reconcile(local: &[IpNet], listed: &[IpNet], keep_local: bool) -> Vec<IpNet> {
    let mut merged: Vec<IpNet> = local
        .iter()
        .filter(|block| keep_local || listed.contains(block))
        .copied()
        .collect();
    for block in listed {
        if !merged.contains(block) {
            merged.push(*block);
        }
    }
    merged
}

impl NodeBlockRegistry {
    pub fn new(node: &str) -> Self {
        Self {
            node: node.to_string(),
            state: RwLock::new(State::default()),
            escalations: DashMap::new(),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Re-read the blocks this node owns.
    ///
    /// Blocks the store no longer lists for this node (reclaimed by the
    /// controller) are dropped. If a block was prepended locally while the
    /// store read was in flight, the read may predate it, so local blocks are
    /// kept as they are for this round.
    pub async fn refresh(&self, store: &dyn AddressStore) -> Result<()> {
        let epoch = self.state.read().epoch;
        let owned = store.get_my_blocks(&self.node).await?;

        let mut state = self.state.write();
        let keep_local = state.epoch != epoch;

        let known: Vec<String> = state.pools.keys().cloned().collect();
        for pool in known {
            if owned.contains_key(&pool) {
                continue;
            }
            let entry = state.pools.entry(pool.clone()).or_default();
            if !keep_local && entry.replace(Vec::new()) {
                info!(node = %self.node, pool = %pool, "Node no longer owns any block in pool");
                OWNED_BLOCKS.with_label_values(&[pool.as_str()]).set(0);
            }
        }

        for (pool, listed) in owned {
            let entry = state.pools.entry(pool.clone()).or_default();
            let merged = reconcile(&entry.blocks, &listed, keep_local);
            if entry.replace(merged) {
                debug!(node = %self.node, pool = %pool, blocks = entry.blocks.len(), "Block set changed");
                OWNED_BLOCKS
                    .with_label_values(&[pool.as_str()])
                    .set(entry.blocks.len() as i64);
            }
        }
        Ok(())
    }

    /// Current blocks of `pool`, newest first.
    pub fn snapshot(&self, pool: &str) -> BlockSet {
        let state = self.state.read();
        match state.pools.get(pool) {
            Some(entry) => BlockSet {
                pool: pool.to_string(),
                blocks: entry.blocks.clone(),
                generation: entry.generation,
            },
            None => BlockSet {
                pool: pool.to_string(),
                blocks: Vec::new(),
                generation: 0,
            },
        }
    }

    /// Every owned block across all pools.
    pub fn snapshot_all(&self) -> Vec<IpNet> {
        let state = self.state.read();
        state
            .pools
            .values()
            .flat_map(|entry| entry.blocks.iter().copied())
            .collect()
    }

    /// Owned blocks grouped by pool, for status reporting.
    pub fn pools(&self) -> BTreeMap<String, Vec<IpNet>> {
        let state = self.state.read();
        state
            .pools
            .iter()
            .filter(|(_, entry)| !entry.blocks.is_empty())
            .map(|(pool, entry)| (pool.clone(), entry.blocks.clone()))
            .collect()
    }

    pub fn generation(&self, pool: &str) -> u64 {
        self.state
            .read()
            .pools
            .get(pool)
            .map(|entry| entry.generation)
            .unwrap_or(0)
    }

    /// Put a newly acquired block at the front of `pool`.
    pub fn prepend(&self, pool: &str, block: IpNet) -> BlockSet {
        let mut state = self.state.write();
        state.epoch += 1;

        let entry = state.pools.entry(pool.to_string()).or_default();
        let mut blocks = Vec::with_capacity(entry.blocks.len() + 1);
        blocks.push(block);
        blocks.extend(entry.blocks.iter().copied().filter(|b| *b != block));
        entry.replace(blocks);
        OWNED_BLOCKS
            .with_label_values(&[pool])
            .set(entry.blocks.len() as i64);

        BlockSet {
            pool: pool.to_string(),
            blocks: entry.blocks.clone(),
            generation: entry.generation,
        }
    }

    /// Lock serializing block acquisition for `pool`.
    pub fn escalation_lock(&self, pool: &str) -> Arc<Mutex<()>> {
        self.escalations
            .entry(pool.to_string())
            .or_default()
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, PoolSpec};

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn test_prepend_order() {
        let registry = NodeBlockRegistry::new("node1");
        let first = registry.prepend("default", net("10.0.0.0/27"));
        let second = registry.prepend("default", net("10.0.0.32/27"));

        assert_eq!(first.blocks, vec![net("10.0.0.0/27")]);
        assert_eq!(second.blocks, vec![net("10.0.0.32/27"), net("10.0.0.0/27")]);
        assert!(second.generation > first.generation);
        assert_eq!(registry.generation("default"), second.generation);
        assert_eq!(registry.snapshot("other").blocks, Vec::<IpNet>::new());
    }

    #[test]
    fn test_reconcile() {
        let a = net("10.0.0.0/27");
        let b = net("10.0.0.32/27");
        let c = net("10.0.0.64/27");

        assert_eq!(reconcile(&[b, a], &[a, b, c], false), vec![b, a, c]);
        assert_eq!(reconcile(&[b, a], &[a], false), vec![a]);
        assert_eq!(reconcile(&[b, a], &[a], true), vec![b, a]);
    }

    #[tokio::test]
    async fn test_refresh_tracks_store() {
        let store = MemoryStore::with_pools([PoolSpec::new("default", vec![net("10.0.0.0/26")], 5)]);
        let registry = NodeBlockRegistry::new("node1");

        let a = store.acquire_block("node1", "default").await.unwrap();
        let b = store.acquire_block("node1", "default").await.unwrap();
        registry.refresh(&store).await.unwrap();
        assert_eq!(registry.snapshot("default").blocks, vec![b, a]);

        let generation = registry.generation("default");
        registry.refresh(&store).await.unwrap();
        assert_eq!(registry.generation("default"), generation);

        store.reclaim_block(&b);
        registry.refresh(&store).await.unwrap();
        assert_eq!(registry.snapshot("default").blocks, vec![a]);
        assert_eq!(registry.snapshot_all(), vec![a]);

        store.reclaim_block(&a);
        registry.refresh(&store).await.unwrap();
        assert!(registry.snapshot("default").blocks.is_empty());
        assert!(registry.pools().is_empty());
    }

    #[tokio::test]
    async fn test_escalation_lock_is_per_pool() {
        let registry = NodeBlockRegistry::new("node1");
        let a = registry.escalation_lock("default");
        let b = registry.escalation_lock("default");
        let c = registry.escalation_lock("team-a");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));

        let _guard = a.lock().await;
        assert!(b.try_lock().is_err());
        assert!(c.try_lock().is_ok());
    }
}
