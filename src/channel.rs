use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::address::{PeerAddress, PeerAddressMap};
use crate::error::{PeerError, Result};
use crate::session::{Session, SessionLayer};
use crate::transport::TransportChannel;

/// A transport endpoint bound to a session: the unit higher layers talk
/// over. Unsecure while CASE runs, secure for everything else.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    pub transport: Arc<dyn TransportChannel>,
    pub session: Arc<dyn Session>,
}

impl MessageChannel {
    pub fn new(transport: Arc<dyn TransportChannel>, session: Arc<dyn Session>) -> Self {
        Self { transport, session }
    }

    pub fn is_secure(&self) -> bool {
        self.session.is_secure()
    }
}

/// Per-fabric-context registry of operational channels, keyed by canonical
/// peer address.
#[derive(Debug, Default)]
pub struct ChannelManager {
    channels: RwLock<PeerAddressMap<Arc<MessageChannel>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Errs with `NoChannel` on a miss; callers that treat a miss as normal
    /// use `has_channel` first or catch the variant.
    pub async fn get_channel(&self, address: &PeerAddress) -> Result<Arc<MessageChannel>> {
        self.channels
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| PeerError::NoChannel(address.clone()))
    }

    pub async fn has_channel(&self, address: &PeerAddress) -> bool {
        self.channels.read().await.contains_key(address)
    }

    pub async fn set_channel(&self, address: &PeerAddress, channel: Arc<MessageChannel>) {
        debug!(peer = %address, "registering operational channel");
        self.channels.write().await.insert(address, channel);
    }

    pub async fn remove_all_node_channels(&self, address: &PeerAddress) {
        if self.channels.write().await.remove(address).is_some() {
            debug!(peer = %address, "removed operational channels");
        }
    }
}

/// One logical conversation over a channel, scoped to a protocol id.
#[async_trait]
pub trait Exchange: Send + Sync + fmt::Debug {
    fn protocol_id(&self) -> u32;
    async fn close(&self) -> Result<()>;
}

/// The exchange manager of the fabric context, consumed at its interface.
pub trait ExchangeManager: Send + Sync {
    fn initiate_exchange_with_channel(
        &self,
        channel: &Arc<MessageChannel>,
        protocol_id: u32,
    ) -> Result<Box<dyn Exchange>>;
}

/// Closure that re-pairs via the peer's last known operational address.
/// Yields `None` when no address is on file or the peer did not answer
/// there, an error for anything unexpected.
pub type ReconnectFn = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = Result<Option<Arc<MessageChannel>>>> + Send>>
        + Send
        + Sync,
>;

/// Supplies exchanges for one peer and owns its reconnection path.
#[derive(Clone)]
pub struct ExchangeProvider {
    address: PeerAddress,
    channels: Arc<ChannelManager>,
    exchanges: Arc<dyn ExchangeManager>,
    sessions: Arc<dyn SessionLayer>,
    reconnect: ReconnectFn,
}

impl ExchangeProvider {
    pub fn new(
        address: PeerAddress,
        channels: Arc<ChannelManager>,
        exchanges: Arc<dyn ExchangeManager>,
        sessions: Arc<dyn SessionLayer>,
        reconnect: ReconnectFn,
    ) -> Self {
        Self {
            address: address.canonical(),
            channels,
            exchanges,
            sessions,
            reconnect,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    /// Opens an exchange over the currently registered channel.
    pub async fn initiate_exchange(&self, protocol_id: u32) -> Result<Box<dyn Exchange>> {
        let channel = self.channels.get_channel(&self.address).await?;
        self.exchanges
            .initiate_exchange_with_channel(&channel, protocol_id)
    }

    /// Replaces a dead channel.
    ///
    /// Without any channel on record this fails fast, as there is nothing to
    /// resume. Otherwise the stale channels are wiped and one reconnect via
    /// the last known operational address is attempted. When that produces
    /// nothing, every session for the peer is removed (informing upper
    /// layers) before the failure surfaces.
    pub async fn reconnect_channel(&self) -> Result<Arc<MessageChannel>> {
        if !self.channels.has_channel(&self.address).await {
            return Err(PeerError::RetransmissionLimitReached(format!(
                "no channel known for {}",
                self.address
            )));
        }
        self.channels.remove_all_node_channels(&self.address).await;

        match (self.reconnect)().await {
            Ok(Some(channel)) => Ok(channel),
            Ok(None) => {
                self.sessions
                    .remove_all_sessions_for_node(&self.address, true)
                    .await?;
                Err(PeerError::RetransmissionLimitReached(format!(
                    "{} not reachable via last known operational address",
                    self.address
                )))
            }
            Err(err) if err.is_unreachable() => {
                // Resume failure: drop the peer's sessions, inform upper
                // layers, then surface the original error.
                if let Err(cleanup) = self
                    .sessions
                    .remove_all_sessions_for_node(&self.address, true)
                    .await
                {
                    warn!(peer = %self.address, error = %cleanup, "session cleanup after failed resume");
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}

impl fmt::Debug for ExchangeProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeProvider")
            .field("address", &self.address)
            .finish()
    }
}

#[cfg(test)]
#[path = "channel_tests.rs"]
mod tests;
