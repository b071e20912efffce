use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::error::{PeerError, Result};

/// Secure Channel protocol id (session establishment, MRP acks).
pub const SECURE_CHANNEL_PROTOCOL_ID: u32 = 0x0000;

/// Interaction Model protocol id.
pub const INTERACTION_PROTOCOL_ID: u32 = 0x0001;

/// Matter service UUID advertised for BLE discovery. Opaque here; passed
/// through to BLE-capable interfaces.
pub const MATTER_BLE_SERVICE_UUID: u16 = 0xFFF6;

/// Default operational port of a Matter node.
pub const DEFAULT_MATTER_PORT: u16 = 5540;

/// Bind address for IPv6 interfaces.
pub const BIND_ALL_IPV6: &str = "::";

/// Bind address for IPv4 interfaces.
pub const BIND_ALL_IPV4: &str = "0.0.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Udp,
    Ble,
}

/// IP endpoint of an operational peer. The address family selects which
/// local interface a connection is opened from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAddressIp {
    pub ip: IpAddr,
    pub port: u16,
}

impl ServerAddressIp {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// The bind interface matching this endpoint's family.
    pub fn bind_interface(&self) -> &'static str {
        if self.ip.is_ipv6() {
            BIND_ALL_IPV6
        } else {
            BIND_ALL_IPV4
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for ServerAddressIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Open transport endpoint bound to one peer address.
#[async_trait]
pub trait TransportChannel: Send + Sync + fmt::Debug {
    async fn send(&self, payload: &[u8]) -> Result<()>;
    fn peer(&self) -> ServerAddressIp;
}

/// A network interface able to open channels to peers of its family.
#[async_trait]
pub trait NetInterface: Send + Sync {
    async fn open_channel(&self, address: ServerAddressIp) -> Result<Arc<dyn TransportChannel>>;
}

/// The pre-opened interfaces of a fabric context, looked up by channel type
/// and bind address (`::` or `0.0.0.0` for UDP).
#[derive(Default)]
pub struct NetInterfaceSet {
    interfaces: HashMap<(ChannelType, String), Arc<dyn NetInterface>>,
}

impl NetInterfaceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_interface(
        &mut self,
        channel_type: ChannelType,
        bind: impl Into<String>,
        interface: Arc<dyn NetInterface>,
    ) {
        self.interfaces
            .insert((channel_type, bind.into()), interface);
    }

    pub fn interface_for(
        &self,
        channel_type: ChannelType,
        bind: &str,
    ) -> Option<Arc<dyn NetInterface>> {
        self.interfaces
            .get(&(channel_type, bind.to_string()))
            .cloned()
    }
}

impl fmt::Debug for NetInterfaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetInterfaceSet")
            .field("interfaces", &self.interfaces.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// UDP interface over one unconnected socket; channels share the socket and
/// address datagrams per peer.
#[derive(Debug)]
pub struct UdpInterface {
    socket: Arc<UdpSocket>,
}

impl UdpInterface {
    /// Binds an ephemeral local port on `bind` (`::` or `0.0.0.0`).
    pub async fn bind(bind: &str) -> Result<Self> {
        let socket = UdpSocket::bind((bind, 0)).await.map_err(|err| {
            PeerError::implementation(format!("failed to bind UDP interface on {bind}: {err}"))
        })?;
        debug!(bind, local = ?socket.local_addr().ok(), "UDP interface bound");
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket
            .local_addr()
            .map_err(|err| PeerError::implementation(format!("no local address: {err}")))
    }
}

#[async_trait]
impl NetInterface for UdpInterface {
    async fn open_channel(&self, address: ServerAddressIp) -> Result<Arc<dyn TransportChannel>> {
        Ok(Arc::new(UdpChannel {
            socket: self.socket.clone(),
            peer: address,
        }))
    }
}

#[derive(Debug)]
struct UdpChannel {
    socket: Arc<UdpSocket>,
    peer: ServerAddressIp,
}

#[async_trait]
impl TransportChannel for UdpChannel {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        self.socket
            .send_to(payload, self.peer.socket_addr())
            .await
            .map_err(|err| {
                PeerError::NoResponseTimeout(format!("udp send to {}: {err}", self.peer))
            })?;
        Ok(())
    }

    fn peer(&self) -> ServerAddressIp {
        self.peer
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
