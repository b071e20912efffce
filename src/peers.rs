use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::address::{PeerAddress, PeerAddressMap};
use crate::cache::{NodeCache, NodeCacheRegistry};
use crate::channel::{
    ChannelManager, Exchange, ExchangeManager, ExchangeProvider, ReconnectFn,
};
use crate::discovery::{DiscoveryOptions, DiscoveryOrchestrator};
use crate::error::{PeerError, Result};
use crate::lifecycle::AsyncConstruction;
use crate::pairing::CasePairer;
use crate::queue::{InteractionPermit, InteractionQueue};
use crate::reactor::ResubmissionReactor;
use crate::scanner::{DiscoveryData, OperationalScanner};
use crate::session::{CaseInitiator, SessionLayer};
use crate::store::PeerStore;
use crate::transport::{NetInterfaceSet, ServerAddressIp, INTERACTION_PROTOCOL_ID};

/// Processing-time hint passed to CASE when reconnecting a dead channel via
/// the last known operational address.
const RECONNECT_PROCESSING_TIME_HINT: Duration = Duration::from_millis(2000);

/// A commissioned peer as tracked (and persisted) by the peer set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationalPeer {
    pub address: PeerAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operational_address: Option<ServerAddressIp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_data: Option<DiscoveryData>,
}

impl OperationalPeer {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address: address.canonical(),
            operational_address: None,
            discovery_data: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PeerSetEvent {
    Added(OperationalPeer),
    Deleted(OperationalPeer),
}

/// Stable references to the fabric-context singletons the peer set talks
/// to. Injected at construction; none of these components own each other.
#[derive(Clone)]
pub struct ControllerContext {
    pub sessions: Arc<dyn SessionLayer>,
    pub channels: Arc<ChannelManager>,
    pub exchanges: Arc<dyn ExchangeManager>,
    pub case: Arc<dyn CaseInitiator>,
    pub scanner: Arc<dyn OperationalScanner>,
    pub interfaces: Arc<NetInterfaceSet>,
    pub store: Arc<dyn PeerStore>,
}

/// Shared peer index: the `peers-by-address` map, its change events and the
/// persistence behind it. The peer set owns the public surface; the
/// discovery orchestrator records operational addresses through it.
pub(crate) struct PeerIndex {
    peers: RwLock<PeerAddressMap<OperationalPeer>>,
    events: broadcast::Sender<PeerSetEvent>,
    store: Arc<dyn PeerStore>,
}

impl PeerIndex {
    fn new(store: Arc<dyn PeerStore>) -> Self {
        Self {
            peers: RwLock::new(PeerAddressMap::new()),
            events: broadcast::channel(64).0,
            store,
        }
    }

    async fn load_from_store(&self) -> Result<()> {
        let loaded = self.store.load_peers().await?;
        let mut peers = self.peers.write().await;
        for peer in loaded {
            peers.insert(&peer.address.clone(), peer);
        }
        debug!(count = peers.len(), "peer index loaded");
        Ok(())
    }

    pub(crate) async fn get(&self, address: &PeerAddress) -> Option<OperationalPeer> {
        self.peers.read().await.get(address).cloned()
    }

    /// Updates a peer's operational address after a successful pairing and
    /// persists the record. Store trouble is logged, not surfaced; the
    /// established connection stays usable.
    pub(crate) async fn record_operational(
        &self,
        address: &PeerAddress,
        endpoint: ServerAddressIp,
        discovery_data: Option<DiscoveryData>,
    ) {
        let (peer, added) = {
            let mut peers = self.peers.write().await;
            match peers.get_mut(address) {
                Some(existing) => {
                    existing.operational_address = Some(endpoint);
                    if discovery_data.is_some() {
                        existing.discovery_data = discovery_data;
                    }
                    (existing.clone(), false)
                }
                None => {
                    let peer = OperationalPeer {
                        address: address.canonical(),
                        operational_address: Some(endpoint),
                        discovery_data,
                    };
                    peers.insert(address, peer.clone());
                    (peer, true)
                }
            }
        };
        // Events fire after the index update.
        if added {
            let _ = self.events.send(PeerSetEvent::Added(peer.clone()));
        }
        if let Err(err) = self.store.update_peer(&peer).await {
            warn!(peer = %address, error = %err, "failed to persist peer record");
        }
    }

    async fn remove(&self, address: &PeerAddress) -> Option<OperationalPeer> {
        let removed = self.peers.write().await.remove(address);
        if let Some(peer) = &removed {
            let _ = self.events.send(PeerSetEvent::Deleted(peer.clone()));
        }
        removed
    }

    async fn snapshot(&self) -> Vec<OperationalPeer> {
        let peers = self.peers.read().await;
        let mut all: Vec<OperationalPeer> = peers.values().cloned().collect();
        all.sort_by(|a, b| a.address.cmp(&b.address));
        all
    }

    fn subscribe(&self) -> broadcast::Receiver<PeerSetEvent> {
        self.events.subscribe()
    }
}

/// The set of commissioned peers and their connection machinery.
///
/// Owns the channel registry, node caches, interaction queue, discovery
/// orchestrator and resubmission reactor; everything else is reached through
/// the injected context.
pub struct PeerSet {
    construction: AsyncConstruction,
    index: Arc<PeerIndex>,
    store: Arc<dyn PeerStore>,
    sessions: Arc<dyn SessionLayer>,
    exchanges: Arc<dyn ExchangeManager>,
    channels: Arc<ChannelManager>,
    caches: Arc<NodeCacheRegistry>,
    queue: Arc<InteractionQueue>,
    orchestrator: Arc<DiscoveryOrchestrator>,
    reactor: ResubmissionReactor,
}

impl PeerSet {
    /// Builds the peer set and starts loading known peers from the store.
    /// Await `construction()` (or any operation) to observe readiness.
    pub fn new(context: ControllerContext) -> Arc<Self> {
        let channels = context.channels.clone();
        let caches = Arc::new(NodeCacheRegistry::new());
        let pairer = Arc::new(CasePairer::new(
            context.interfaces.clone(),
            context.sessions.clone(),
            context.case.clone(),
            context.exchanges.clone(),
            channels.clone(),
            caches.clone(),
        ));
        let index = Arc::new(PeerIndex::new(context.store.clone()));
        let orchestrator = Arc::new(DiscoveryOrchestrator::new(
            context.scanner.clone(),
            pairer,
            index.clone(),
        ));
        let reactor =
            ResubmissionReactor::spawn(context.sessions.clone(), orchestrator.clone());
        let queue = Arc::new(InteractionQueue::new());

        let construction = AsyncConstruction::new("peer set");
        construction.set_cancel_hook({
            let queue = queue.clone();
            let reactor = reactor.cancel_handle();
            move || {
                reactor.cancel();
                queue.close();
            }
        });
        construction
            .start({
                let index = index.clone();
                async move { index.load_from_store().await }
            })
            .expect("fresh construction accepts its first start");

        Arc::new(Self {
            construction,
            index,
            store: context.store,
            sessions: context.sessions,
            exchanges: context.exchanges,
            channels,
            caches,
            queue,
            orchestrator,
            reactor,
        })
    }

    pub fn construction(&self) -> &AsyncConstruction {
        &self.construction
    }

    /// Change feed; `Added`/`Deleted` fire after the index update, and
    /// observers may mutate the peer set re-entrantly.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerSetEvent> {
        self.index.subscribe()
    }

    /// Produces an interaction client bound to a live channel for the peer,
    /// establishing one per `options` when none is registered. Parallel
    /// calls for the same address share one in-flight discovery.
    pub async fn connect(
        &self,
        address: &PeerAddress,
        options: DiscoveryOptions,
    ) -> Result<InteractionClient> {
        self.construction.wait().await?;
        let address = address.canonical();

        if !self.channels.has_channel(&address).await {
            self.orchestrator.acquire_channel(&address, options).await?;
        }
        Ok(self.interaction_client(address))
    }

    pub async fn get(&self, address: &PeerAddress) -> Result<Option<OperationalPeer>> {
        self.construction.assert()?;
        Ok(self.index.get(address).await)
    }

    pub async fn contains(&self, address: &PeerAddress) -> Result<bool> {
        Ok(self.get(address).await?.is_some())
    }

    pub async fn len(&self) -> Result<usize> {
        self.construction.assert()?;
        Ok(self.index.peers.read().await.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Call-instant snapshot, ordered by address; composes with the standard
    /// iterator adapters for filtering and mapping.
    pub async fn peers(&self) -> Result<Vec<OperationalPeer>> {
        self.construction.assert()?;
        Ok(self.index.snapshot().await)
    }

    pub async fn find(
        &self,
        predicate: impl Fn(&OperationalPeer) -> bool,
    ) -> Result<Option<OperationalPeer>> {
        Ok(self.peers().await?.into_iter().find(|peer| predicate(peer)))
    }

    /// Drops all sessions and channels for the peer. The peer record stays.
    pub async fn disconnect(&self, address: &PeerAddress) -> Result<()> {
        self.construction.assert()?;
        self.disconnect_inner(&address.canonical()).await
    }

    async fn disconnect_inner(&self, address: &PeerAddress) -> Result<()> {
        self.sessions
            .remove_all_sessions_for_node(address, false)
            .await?;
        self.channels.remove_all_node_channels(address).await;
        Ok(())
    }

    /// Forgets the peer entirely: record, persisted entry, sessions,
    /// channels, resumption record and cached node state. Unknown peers are
    /// a silent no-op; failures at any step propagate.
    pub async fn delete(&self, address: &PeerAddress) -> Result<()> {
        self.construction.assert()?;
        let address = address.canonical();

        if self.index.remove(&address).await.is_none() {
            debug!(peer = %address, "delete for unknown peer ignored");
            return Ok(());
        }
        self.store.delete_peer(&address).await?;
        self.disconnect_inner(&address).await?;
        self.sessions.delete_resumption_record(&address).await?;
        self.caches.remove(&address);
        Ok(())
    }

    /// Shuts the connection machinery down: every running discovery is
    /// cancelled (timers stopped, scanner told not to resolve its waiters),
    /// the reactor stops and the interaction queue closes.
    pub async fn close(&self) {
        self.orchestrator.cancel_all().await;
        self.reactor.stop();
        self.queue.close();
    }

    fn interaction_client(&self, address: PeerAddress) -> InteractionClient {
        let reconnect: ReconnectFn = {
            let orchestrator = self.orchestrator.clone();
            let address = address.clone();
            Arc::new(move || {
                let orchestrator = orchestrator.clone();
                let address = address.clone();
                Box::pin(async move {
                    orchestrator
                        .reconnect_last_known_address(
                            &address,
                            Some(RECONNECT_PROCESSING_TIME_HINT),
                        )
                        .await
                })
            })
        };
        let provider = ExchangeProvider::new(
            address.clone(),
            self.channels.clone(),
            self.exchanges.clone(),
            self.sessions.clone(),
            reconnect,
        );
        InteractionClient {
            cache: self.caches.cache_for(&address),
            queue: self.queue.clone(),
            provider,
        }
    }
}

/// Client handle for interacting with one peer: queue-admitted exchanges
/// over the registered channel, reconnecting through the peer set's
/// discovery machinery when the channel died.
pub struct InteractionClient {
    provider: ExchangeProvider,
    queue: Arc<InteractionQueue>,
    cache: Arc<NodeCache>,
}

impl std::fmt::Debug for InteractionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionClient")
            .field("address", self.address())
            .finish()
    }
}

impl InteractionClient {
    pub fn address(&self) -> &PeerAddress {
        self.provider.address()
    }

    /// Cached attribute/cluster-version state for this peer.
    pub fn cache(&self) -> &Arc<NodeCache> {
        &self.cache
    }

    /// Admits through the interaction queue and opens an exchange on the
    /// Interaction protocol. A dead or missing channel is reconnected once
    /// via the last known operational address before giving up.
    pub async fn interaction(&self) -> Result<Interaction> {
        let permit = self.queue.admit().await?;
        let exchange = match self.provider.initiate_exchange(INTERACTION_PROTOCOL_ID).await {
            Ok(exchange) => exchange,
            Err(PeerError::NoChannel(_)) | Err(PeerError::NoResponseTimeout(_)) => {
                self.provider.reconnect_channel().await?;
                self.provider.initiate_exchange(INTERACTION_PROTOCOL_ID).await?
            }
            Err(err) => return Err(err),
        };
        Ok(Interaction {
            exchange,
            _permit: permit,
        })
    }
}

/// One queue slot plus the exchange it admitted; dropping it frees the slot.
#[derive(Debug)]
pub struct Interaction {
    exchange: Box<dyn Exchange>,
    _permit: InteractionPermit,
}

impl Interaction {
    pub fn exchange(&self) -> &dyn Exchange {
        self.exchange.as_ref()
    }

    pub async fn close(self) -> Result<()> {
        self.exchange.close().await
    }
}
