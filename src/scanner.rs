use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::{FabricIndex, NodeId, PeerAddress, PeerAddressMap};
use crate::error::{PeerError, Result};
use crate::transport::ServerAddressIp;

/// DNS-SD service type of operational Matter nodes.
pub const SERVICE_TYPE: &str = "_matter._tcp.local.";

/// Session hints a node publishes in its operational DNS-SD TXT record, all
/// milliseconds: idle interval, active interval, active threshold.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryData {
    #[serde(rename = "SII", default, skip_serializing_if = "Option::is_none")]
    pub sii: Option<u64>,
    #[serde(rename = "SAI", default, skip_serializing_if = "Option::is_none")]
    pub sai: Option<u64>,
    #[serde(rename = "SAT", default, skip_serializing_if = "Option::is_none")]
    pub sat: Option<u64>,
}

impl DiscoveryData {
    pub fn is_empty(&self) -> bool {
        self.sii.is_none() && self.sai.is_none() && self.sat.is_none()
    }
}

/// A resolved operational node: its reachable endpoints plus TXT hints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub addresses: Vec<ServerAddressIp>,
    pub discovery_data: Option<DiscoveryData>,
}

/// Operational mDNS discovery, consumed at its interface.
#[async_trait]
pub trait OperationalScanner: Send + Sync {
    /// Waits until the node is resolved, up to `timeout` (`None` waits
    /// indefinitely). `ignore_cache` forces a fresh network answer.
    async fn find_operational_device(
        &self,
        address: &PeerAddress,
        timeout: Option<Duration>,
        ignore_cache: bool,
    ) -> Result<Option<DiscoveredDevice>>;

    /// Cache-only lookup; never touches the network.
    async fn get_discovered_operational_device(
        &self,
        address: &PeerAddress,
    ) -> Option<DiscoveredDevice>;

    /// Stops an in-flight find for the node. With `resolve_waiters` the
    /// waiters settle with "nothing found"; without it they keep running
    /// into their own timeout or cancellation, so nobody observes a
    /// spurious result.
    async fn cancel_operational_device_discovery(
        &self,
        address: &PeerAddress,
        resolve_waiters: bool,
    );
}

// ---------------------------------------------------------------------------
// mDNS scanner implementation
// ---------------------------------------------------------------------------

struct ScannerShared {
    /// Compressed fabric id (as published in instance names) to local index.
    fabrics: StdMutex<HashMap<u64, FabricIndex>>,
    resolved: Mutex<PeerAddressMap<DiscoveredDevice>>,
    waiters: Mutex<PeerAddressMap<broadcast::Sender<Option<DiscoveredDevice>>>>,
}

/// `OperationalScanner` over an mDNS browse of `_matter._tcp`.
///
/// Operational instances are named `<compressed-fabric-hex>-<node-hex>`;
/// the controller registers each fabric's compressed id so instances can be
/// mapped back to logical addresses.
pub struct MdnsScanner {
    daemon: ServiceDaemon,
    shared: Arc<ScannerShared>,
    cancel: CancellationToken,
}

impl MdnsScanner {
    pub fn new() -> Result<Self> {
        let daemon = ServiceDaemon::new()
            .map_err(|err| PeerError::Scanner(format!("failed to start mDNS daemon: {err}")))?;
        let receiver = daemon
            .browse(SERVICE_TYPE)
            .map_err(|err| PeerError::Scanner(format!("failed to start mDNS browse: {err}")))?;

        let shared = Arc::new(ScannerShared {
            fabrics: StdMutex::new(HashMap::new()),
            resolved: Mutex::new(PeerAddressMap::new()),
            waiters: Mutex::new(PeerAddressMap::new()),
        });
        let cancel = CancellationToken::new();

        {
            let shared = shared.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = receiver.recv_async() => {
                            let event = match event {
                                Ok(event) => event,
                                Err(err) => {
                                    warn!(error = %err, "mDNS browse channel closed");
                                    break;
                                }
                            };
                            if let ServiceEvent::ServiceResolved(info) = event {
                                handle_resolved(&shared, &info).await;
                            }
                        }
                    }
                }
            });
        }

        Ok(Self {
            daemon,
            shared,
            cancel,
        })
    }

    /// Registers a fabric's published compressed id so its instances resolve
    /// to logical addresses.
    pub fn register_fabric(&self, index: FabricIndex, compressed_fabric_id: u64) {
        self.shared
            .fabrics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(compressed_fabric_id, index);
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.daemon.shutdown();
    }
}

async fn handle_resolved(shared: &ScannerShared, info: &ServiceInfo) {
    let Some((compressed, node)) = parse_instance_label(instance_label(info.get_fullname()))
    else {
        debug!(fullname = info.get_fullname(), "ignoring non-operational instance");
        return;
    };
    let address = {
        let fabrics = shared.fabrics.lock().unwrap_or_else(|e| e.into_inner());
        match fabrics.get(&compressed) {
            Some(index) => PeerAddress::new(*index, NodeId(node)),
            None => {
                debug!(
                    fullname = info.get_fullname(),
                    "resolved instance for unknown fabric"
                );
                return;
            }
        }
    };

    let device = DiscoveredDevice {
        addresses: sorted_addresses(info),
        discovery_data: discovery_data_from_txt(
            info.get_property_val_str("SII"),
            info.get_property_val_str("SAI"),
            info.get_property_val_str("SAT"),
        ),
    };
    debug!(peer = %address, endpoints = device.addresses.len(), "operational device resolved");

    shared.resolved.lock().await.insert(&address, device.clone());
    let waiter = shared.waiters.lock().await.remove(&address);
    if let Some(tx) = waiter {
        let _ = tx.send(Some(device));
    }
}

fn instance_label(fullname: &str) -> &str {
    fullname.split('.').next().unwrap_or(fullname)
}

/// Parses `<compressed-fabric-hex>-<node-hex>` into its two 64-bit halves.
fn parse_instance_label(label: &str) -> Option<(u64, u64)> {
    let (fabric, node) = label.split_once('-')?;
    if fabric.len() != 16 || node.len() != 16 {
        return None;
    }
    Some((
        u64::from_str_radix(fabric, 16).ok()?,
        u64::from_str_radix(node, 16).ok()?,
    ))
}

fn discovery_data_from_txt(
    sii: Option<&str>,
    sai: Option<&str>,
    sat: Option<&str>,
) -> Option<DiscoveryData> {
    let data = DiscoveryData {
        sii: sii.and_then(|v| v.parse().ok()),
        sai: sai.and_then(|v| v.parse().ok()),
        sat: sat.and_then(|v| v.parse().ok()),
    };
    (!data.is_empty()).then_some(data)
}

/// IPv6 endpoints first; operational traffic prefers v6 when both families
/// are published.
fn sorted_addresses(info: &ServiceInfo) -> Vec<ServerAddressIp> {
    let port = info.get_port();
    let mut addresses: Vec<ServerAddressIp> = info
        .get_addresses()
        .iter()
        .map(|ip| ServerAddressIp::new(*ip, port))
        .collect();
    addresses.sort_by_key(|a| !a.ip.is_ipv6());
    addresses
}

#[async_trait]
impl OperationalScanner for MdnsScanner {
    async fn find_operational_device(
        &self,
        address: &PeerAddress,
        timeout: Option<Duration>,
        ignore_cache: bool,
    ) -> Result<Option<DiscoveredDevice>> {
        if !ignore_cache {
            if let Some(device) = self.shared.resolved.lock().await.get(address) {
                return Ok(Some(device.clone()));
            }
        }

        let mut rx = {
            let mut waiters = self.shared.waiters.lock().await;
            waiters
                .entry_or_insert_with(address, || broadcast::channel(1).0)
                .subscribe()
        };

        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(outcome) => return outcome,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    // Cancelled without resolving waiters: hold out for our
                    // own timeout (or scanner shutdown) instead of reporting
                    // a spurious miss.
                    Err(broadcast::error::RecvError::Closed) => {
                        std::future::pending::<()>().await;
                    }
                }
            }
        };

        let found = tokio::select! {
            _ = self.cancel.cancelled() => None,
            outcome = async {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, wait).await.unwrap_or(None),
                    None => wait.await,
                }
            } => outcome,
        };
        Ok(found)
    }

    async fn get_discovered_operational_device(
        &self,
        address: &PeerAddress,
    ) -> Option<DiscoveredDevice> {
        self.shared.resolved.lock().await.get(address).cloned()
    }

    async fn cancel_operational_device_discovery(
        &self,
        address: &PeerAddress,
        resolve_waiters: bool,
    ) {
        let waiter = self.shared.waiters.lock().await.remove(address);
        if let Some(tx) = waiter {
            debug!(peer = %address, resolve_waiters, "cancelling operational discovery");
            if resolve_waiters {
                let _ = tx.send(None);
            }
        }
    }
}

#[cfg(test)]
#[path = "scanner_tests.rs"]
mod tests;
