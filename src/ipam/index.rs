//! Container → address index
//!
//! A node-local cache of which address each container holds. The store is
//! authoritative; entries here are confirmed against it before use and can
//! be rebuilt from it at startup.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::IpAddr;

/// Key used by records written before container IDs were tracked.
pub fn legacy_key(namespace: &str, pod_name: &str) -> String {
    format!("{}/{}", namespace, pod_name)
}

#[derive(Debug, Default)]
pub struct ContainerIndex {
    entries: DashMap<String, IpAddr>,
}

impl ContainerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<IpAddr> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    /// Record `address` for `key` unless `key` already has one.
    pub fn insert_if_absent(&self, key: &str, address: IpAddr) -> bool {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(address);
                true
            }
        }
    }

    /// Remove `key` only while it still maps to `address`.
    pub fn remove_if(&self, key: &str, address: IpAddr) -> bool {
        self.entries
            .remove_if(key, |_, current| *current == address)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_if_absent() {
        let index = ContainerIndex::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(index.insert_if_absent("c1", a));
        assert!(!index.insert_if_absent("c1", b));
        assert_eq!(index.get("c1"), Some(a));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_if_matches_address() {
        let index = ContainerIndex::new();
        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.0.2".parse().unwrap();
        index.insert_if_absent("c1", a);

        assert!(!index.remove_if("c1", b));
        assert!(index.remove_if("c1", a));
        assert!(index.is_empty());
    }

    #[test]
    fn test_legacy_key() {
        assert_eq!(legacy_key("default", "nginx"), "default/nginx");
    }
}
