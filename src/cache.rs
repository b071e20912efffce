use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::address::{PeerAddress, PeerAddressMap};

/// Location of an attribute: endpoint / cluster / attribute ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributePath {
    pub endpoint: u16,
    pub cluster: u32,
    pub attribute: u32,
}

/// Location of a cluster instance: endpoint / cluster ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterPath {
    pub endpoint: u16,
    pub cluster: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedAttribute {
    pub path: AttributePath,
    pub name: Option<String>,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDataVersion {
    pub path: ClusterPath,
    pub data_version: u32,
}

/// Per-peer cache of attribute values, cluster data versions and the highest
/// seen event number. Survives reconnects; wiped when a CASE session comes up
/// without resumption (the device likely rebooted or upgraded, so any cached
/// state may be stale).
///
/// Uses `std::sync` locks so reads stay available from synchronous contexts
/// (same reasoning as a pinset shared with verifier callbacks).
#[derive(Debug, Default)]
pub struct NodeCache {
    attributes: RwLock<HashMap<AttributePath, CachedAttribute>>,
    cluster_versions: RwLock<HashMap<ClusterPath, ClusterDataVersion>>,
    max_event_number: RwLock<Option<u64>>,
}

impl NodeCache {
    pub fn attribute(&self, path: &AttributePath) -> Option<CachedAttribute> {
        self.attributes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub fn set_attribute(&self, attribute: CachedAttribute) {
        self.attributes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(attribute.path, attribute);
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn cluster_data_version(&self, path: &ClusterPath) -> Option<ClusterDataVersion> {
        self.cluster_versions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .copied()
    }

    pub fn set_cluster_data_version(&self, version: ClusterDataVersion) {
        self.cluster_versions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(version.path, version);
    }

    pub fn max_event_number(&self) -> Option<u64> {
        *self
            .max_event_number
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Records an observed event number; keeps the maximum.
    pub fn note_event_number(&self, number: u64) {
        let mut max = self
            .max_event_number
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match *max {
            Some(current) if current >= number => {}
            _ => *max = Some(number),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attribute_count() == 0
            && self
                .cluster_versions
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty()
            && self.max_event_number().is_none()
    }

    fn clear(&self) {
        self.attributes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.cluster_versions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self
            .max_event_number
            .write()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Registry of per-peer caches, keyed by canonical address.
#[derive(Debug, Default)]
pub struct NodeCacheRegistry {
    caches: Mutex<PeerAddressMap<Arc<NodeCache>>>,
}

impl NodeCacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cache for `address`, creating it on first use. The
    /// returned handle stays valid across `drop_cache`; dropping clears the
    /// shared contents in place, so every holder observes the wipe.
    pub fn cache_for(&self, address: &PeerAddress) -> Arc<NodeCache> {
        self.caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry_or_insert_with(address, || Arc::new(NodeCache::default()))
            .clone()
    }

    /// Wipes the cached state for `address`. Called before any read can see
    /// post-reconnect data when a CASE session was established without
    /// resumption.
    pub fn drop_cache(&self, address: &PeerAddress) {
        let existing = self
            .caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(address)
            .cloned();
        if let Some(cache) = existing {
            debug!(peer = %address, "dropping cached node state");
            cache.clear();
        }
    }

    pub fn remove(&self, address: &PeerAddress) {
        self.caches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
