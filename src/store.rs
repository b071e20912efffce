use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::address::{PeerAddress, PeerAddressMap};
use crate::error::{PeerError, Result};
use crate::peers::OperationalPeer;

/// Durable persistence of known peers and their last operational transport
/// addresses.
///
/// The peer set treats store failures as non-fatal for already-running
/// connections (logged, the connection stays up) and propagates them for
/// explicit mutations such as `delete`.
#[async_trait]
pub trait PeerStore: Send + Sync {
    async fn load_peers(&self) -> Result<Vec<OperationalPeer>>;
    async fn update_peer(&self, peer: &OperationalPeer) -> Result<()>;
    async fn delete_peer(&self, address: &PeerAddress) -> Result<()>;
}

/// JSON-file-backed peer store. One array of peer records; a missing file
/// loads as an empty peer set. Mutations rewrite the whole file through a
/// temporary sibling and rename, so readers never see a torn write.
#[derive(Debug)]
pub struct FilePeerStore {
    path: PathBuf,
    // Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FilePeerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_records(&self) -> Result<Vec<OperationalPeer>> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(PeerError::store(format!(
                    "failed to read {}: {err}",
                    self.path.display()
                )))
            }
        };
        serde_json::from_slice(&raw).map_err(|err| {
            PeerError::store(format!("corrupt peer file {}: {err}", self.path.display()))
        })
    }

    async fn write_records(&self, peers: &[OperationalPeer]) -> Result<()> {
        let json = serde_json::to_vec_pretty(peers)
            .map_err(|err| PeerError::store(format!("failed to serialize peers: {err}")))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json).await.map_err(|err| {
            PeerError::store(format!("failed to write {}: {err}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|err| {
            PeerError::store(format!(
                "failed to replace {}: {err}",
                self.path.display()
            ))
        })
    }
}

#[async_trait]
impl PeerStore for FilePeerStore {
    async fn load_peers(&self) -> Result<Vec<OperationalPeer>> {
        let peers = self.read_records().await?;
        debug!(count = peers.len(), path = %self.path.display(), "loaded peers");
        Ok(peers)
    }

    async fn update_peer(&self, peer: &OperationalPeer) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut peers = self.read_records().await?;
        match peers.iter_mut().find(|p| p.address == peer.address) {
            Some(existing) => *existing = peer.clone(),
            None => peers.push(peer.clone()),
        }
        self.write_records(&peers).await
    }

    async fn delete_peer(&self, address: &PeerAddress) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut peers = self.read_records().await?;
        let before = peers.len();
        peers.retain(|p| p.address != *address);
        if peers.len() == before {
            return Ok(());
        }
        self.write_records(&peers).await
    }
}

/// In-memory store for tests and ephemeral controllers.
#[derive(Debug, Default)]
pub struct MemoryPeerStore {
    peers: Mutex<PeerAddressMap<OperationalPeer>>,
}

impl MemoryPeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds a record, e.g. to simulate state left by an earlier run.
    pub async fn seed(&self, peer: OperationalPeer) {
        let mut peers = self.peers.lock().await;
        peers.insert(&peer.address.clone(), peer);
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn load_peers(&self) -> Result<Vec<OperationalPeer>> {
        Ok(self.peers.lock().await.values().cloned().collect())
    }

    async fn update_peer(&self, peer: &OperationalPeer) -> Result<()> {
        let mut peers = self.peers.lock().await;
        peers.insert(&peer.address.clone(), peer.clone());
        Ok(())
    }

    async fn delete_peer(&self, address: &PeerAddress) -> Result<()> {
        let mut peers = self.peers.lock().await;
        if peers.remove(address).is_none() {
            warn!(peer = %address, "delete for unknown peer record");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
