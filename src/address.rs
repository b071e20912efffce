use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};

/// Index of a fabric (trust domain) within the local fabric table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FabricIndex(pub u8);

impl fmt::Display for FabricIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 64-bit node identifier within a fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Small ids (group/test ranges) read better in decimal; real
        // operational node ids are 64-bit and print in hex.
        if self.0 > 0xFFFF {
            write!(f, "{:#x}", self.0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Debug, PartialEq, Eq, Hash)]
struct AddressParts {
    fabric: FabricIndex,
    node: NodeId,
}

/// Interned logical address of an operational peer.
///
/// `PeerAddress::new` canonicalizes through a process-wide table keyed by
/// fabric then node id, so structurally equal addresses share one allocation
/// and `is_same_instance` holds for them. Equality and hashing are
/// value-based, which keeps non-canonical values (e.g. freshly deserialized
/// ones) correct as map keys too.
#[derive(Clone)]
pub struct PeerAddress {
    inner: Arc<AddressParts>,
}

type InternTable = Mutex<HashMap<FabricIndex, HashMap<NodeId, PeerAddress>>>;

fn intern_table() -> &'static InternTable {
    static TABLE: OnceLock<InternTable> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

impl PeerAddress {
    /// Returns the canonical address for `(fabric, node)`.
    pub fn new(fabric: FabricIndex, node: NodeId) -> Self {
        let mut table = intern_table().lock().unwrap_or_else(|e| e.into_inner());
        table
            .entry(fabric)
            .or_default()
            .entry(node)
            .or_insert_with(|| Self {
                inner: Arc::new(AddressParts { fabric, node }),
            })
            .clone()
    }

    /// Canonicalizes `self`. Short-circuits when the value already is the
    /// canonical representative.
    pub fn canonical(&self) -> Self {
        {
            let table = intern_table().lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = table
                .get(&self.inner.fabric)
                .and_then(|nodes| nodes.get(&self.inner.node))
            {
                if Arc::ptr_eq(&existing.inner, &self.inner) {
                    return self.clone();
                }
            }
        }
        Self::new(self.inner.fabric, self.inner.node)
    }

    pub fn fabric_index(&self) -> FabricIndex {
        self.inner.fabric
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node
    }

    /// Physical-identity comparison between canonical instances.
    pub fn is_same_instance(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for PeerAddress {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || *self.inner == *other.inner
    }
}

impl Eq for PeerAddress {}

impl std::hash::Hash for PeerAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.hash(state);
    }
}

impl PartialOrd for PeerAddress {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerAddress {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.inner.fabric, self.inner.node).cmp(&(other.inner.fabric, other.inner.node))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer@{}:{}", self.inner.fabric, self.inner.node)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({self})")
    }
}

#[derive(Serialize, Deserialize)]
struct PeerAddressRepr {
    fabric_index: u8,
    node_id: u64,
}

impl Serialize for PeerAddress {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        PeerAddressRepr {
            fabric_index: self.inner.fabric.0,
            node_id: self.inner.node.0,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PeerAddress {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let repr = PeerAddressRepr::deserialize(deserializer)?;
        Ok(Self::new(FabricIndex(repr.fabric_index), NodeId(repr.node_id)))
    }
}

/// Map keyed by `PeerAddress` that canonicalizes keys on every operation, so
/// callers may pass any structurally equal address.
#[derive(Debug, Clone)]
pub struct PeerAddressMap<T> {
    inner: HashMap<PeerAddress, T>,
}

impl<T> Default for PeerAddressMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PeerAddressMap<T> {
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn insert(&mut self, address: &PeerAddress, value: T) -> Option<T> {
        self.inner.insert(address.canonical(), value)
    }

    pub fn get(&self, address: &PeerAddress) -> Option<&T> {
        self.inner.get(&address.canonical())
    }

    pub fn get_mut(&mut self, address: &PeerAddress) -> Option<&mut T> {
        self.inner.get_mut(&address.canonical())
    }

    pub fn remove(&mut self, address: &PeerAddress) -> Option<T> {
        self.inner.remove(&address.canonical())
    }

    pub fn contains_key(&self, address: &PeerAddress) -> bool {
        self.inner.contains_key(&address.canonical())
    }

    pub fn entry_or_insert_with(
        &mut self,
        address: &PeerAddress,
        default: impl FnOnce() -> T,
    ) -> &mut T {
        self.inner.entry(address.canonical()).or_insert_with(default)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PeerAddress, &T)> {
        self.inner.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PeerAddress> {
        self.inner.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.inner.values()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (PeerAddress, T)> + '_ {
        self.inner.drain()
    }
}

#[cfg(test)]
#[path = "address_tests.rs"]
mod tests;
