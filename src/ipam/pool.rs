//! Namespace to pool resolution

use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::store::{AddressStore, StoreError};

/// Pool used by namespaces that have no pool of their own.
pub const DEFAULT_POOL: &str = "default";

/// Maps a pod namespace to the address pool it allocates from
#[derive(Clone)]
pub struct PoolResolver {
    store: Arc<dyn AddressStore>,
}

impl PoolResolver {
    pub fn new(store: Arc<dyn AddressStore>) -> Self {
        Self { store }
    }

    /// Pool registered under exactly `namespace`, otherwise [`DEFAULT_POOL`].
    ///
    /// Only a definite "no such pool" falls back; a store failure is returned.
    pub async fn resolve(&self, namespace: &str) -> Result<String> {
        match self.store.get_pool(namespace).await {
            Ok(pool) => Ok(pool.name),
            Err(StoreError::NotFound) => {
                debug!(namespace = %namespace, "No pool for namespace, using default");
                Ok(DEFAULT_POOL.to_string())
            }
            Err(e) => Err(e.into()),
        }
    }
}
