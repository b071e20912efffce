use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::address::{PeerAddress, PeerAddressMap};
use crate::channel::MessageChannel;
use crate::error::{PeerError, Result};
use crate::pairing::CasePairer;
use crate::peers::PeerIndex;
use crate::scanner::{DiscoveredDevice, DiscoveryData, OperationalScanner};
use crate::transport::ServerAddressIp;

/// Cadence at which a full discovery retries the cached address in parallel
/// with the mDNS query.
pub const FULL_DISCOVERY_POLL_INTERVAL: Duration = Duration::from_secs(600);

/// Bound of the cache-bypassing scan fired by the resubmission reactor.
pub const RETRANSMISSION_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Discovery modes, ordered by aggressiveness. A request with a strictly
/// higher mode supersedes a running discovery; lower or equal joins it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiscoveryKind {
    /// Try only cached addresses.
    None,
    /// Short broadcast triggered by the resubmission reactor; skips caches.
    Retransmission,
    /// Bounded by a caller-provided timeout; uses cached addresses.
    Timed,
    /// Unbounded until found; cached addresses polled in parallel.
    Full,
}

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryOptions {
    pub kind: DiscoveryKind,
    pub timeout: Option<Duration>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            kind: DiscoveryKind::Full,
            timeout: None,
        }
    }
}

impl DiscoveryOptions {
    pub fn timed(timeout: Duration) -> Self {
        Self {
            kind: DiscoveryKind::Timed,
            timeout: Some(timeout),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.kind == DiscoveryKind::Retransmission {
            return Err(PeerError::implementation(
                "retransmission discovery is reserved for the resubmission reactor",
            ));
        }
        if self.timeout.is_some() && self.kind != DiscoveryKind::Timed {
            return Err(PeerError::implementation(
                "a discovery timeout requires timed discovery",
            ));
        }
        Ok(())
    }
}

type DiscoveryOutcome = Result<Arc<MessageChannel>>;

struct RunningDiscovery {
    kind: DiscoveryKind,
    generation: u64,
    outcome_tx: broadcast::Sender<DiscoveryOutcome>,
    cancel: CancellationToken,
}

/// Chooses among the discovery modes, supersedes in-flight strategies and
/// multiplexes waiters onto one attempt per peer.
pub struct DiscoveryOrchestrator {
    scanner: Arc<dyn OperationalScanner>,
    pairer: Arc<CasePairer>,
    peers: Arc<PeerIndex>,
    running: Mutex<PeerAddressMap<RunningDiscovery>>,
    generations: AtomicU64,
}

impl DiscoveryOrchestrator {
    pub fn new(
        scanner: Arc<dyn OperationalScanner>,
        pairer: Arc<CasePairer>,
        peers: Arc<PeerIndex>,
    ) -> Self {
        Self {
            scanner,
            pairer,
            peers,
            running: Mutex::new(PeerAddressMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    /// Produces a live channel for `address` according to `options`.
    ///
    /// Parallel calls for the same address share one in-flight discovery:
    /// the first completing producer settles every waiter.
    pub async fn acquire_channel(
        self: &Arc<Self>,
        address: &PeerAddress,
        options: DiscoveryOptions,
    ) -> Result<Arc<MessageChannel>> {
        options.validate()?;
        let address = address.canonical();

        // "Cached addresses only" never joins or starts a discovery.
        if options.kind == DiscoveryKind::None {
            return self.connect_cached_only(&address).await;
        }

        // Join or supersede an in-flight discovery.
        if let Some(rx) = self.join_or_supersede(&address, options).await {
            return await_outcome(&address, rx).await;
        }

        // No discovery running: a cached operational address is tried
        // directly before the network is asked.
        if let Some((endpoint, data)) = self.known_operational_address(&address).await {
            match self
                .pairer
                .pair(&address, endpoint, data.as_ref(), None)
                .await
            {
                Ok(channel) => {
                    self.peers
                        .record_operational(&address, endpoint, data)
                        .await;
                    return Ok(channel);
                }
                Err(err) => {
                    debug!(peer = %address, endpoint = %endpoint, error = %err, "direct reconnect failed");
                }
            }
        }

        // A discovery may have appeared while we were pairing directly;
        // re-apply the join/supersede rules before starting our own.
        let rx = loop {
            if let Some(rx) = self.join_or_supersede(&address, options).await {
                break rx;
            }
            if let Some(rx) = self.start_discovery(&address, options).await {
                break rx;
            }
        };
        await_outcome(&address, rx).await
    }

    async fn connect_cached_only(
        self: &Arc<Self>,
        address: &PeerAddress,
    ) -> Result<Arc<MessageChannel>> {
        let Some((endpoint, data)) = self.known_operational_address(address).await else {
            return Err(PeerError::discovery(format!(
                "no operational address known for {address}"
            )));
        };
        match self.pairer.pair(address, endpoint, data.as_ref(), None).await {
            Ok(channel) => {
                self.peers.record_operational(address, endpoint, data).await;
                Ok(channel)
            }
            Err(err) => Err(PeerError::discovery(format!(
                "{address} unreachable at {endpoint}: {err}"
            ))),
        }
    }

    /// Registry decision for Timed/Full requests while a discovery runs.
    /// Returns a receiver to wait on, or `None` when no discovery is
    /// running.
    async fn join_or_supersede(
        self: &Arc<Self>,
        address: &PeerAddress,
        options: DiscoveryOptions,
    ) -> Option<broadcast::Receiver<DiscoveryOutcome>> {
        let mut running = self.running.lock().await;
        let existing = running.get(address)?;

        if options.kind <= existing.kind {
            debug!(peer = %address, kind = ?existing.kind, "joining in-flight discovery");
            return Some(existing.outcome_tx.subscribe());
        }

        // Strictly higher mode: the current discovery is cancelled and
        // replaced. The replacement inherits the waiter channel, so earlier
        // callers settle with the new discovery's outcome.
        let prior = running.remove(address)?;
        prior.cancel.cancel();
        info!(peer = %address, from = ?prior.kind, to = ?options.kind, "superseding discovery");

        let entry = self.new_entry(options.kind, prior.outcome_tx);
        let rx = entry.outcome_tx.subscribe();
        let generation = entry.generation;
        let cancel = entry.cancel.clone();
        running.insert(address, entry);
        drop(running);

        self.scanner
            .cancel_operational_device_discovery(address, false)
            .await;
        self.spawn_producers(address.clone(), options, generation, cancel);
        Some(rx)
    }

    /// Starts a fresh discovery unless one appeared since the caller's last
    /// registry look; `None` sends the caller back to the join/supersede
    /// rules.
    async fn start_discovery(
        self: &Arc<Self>,
        address: &PeerAddress,
        options: DiscoveryOptions,
    ) -> Option<broadcast::Receiver<DiscoveryOutcome>> {
        let mut running = self.running.lock().await;
        if running.contains_key(address) {
            return None;
        }

        let entry = self.new_entry(options.kind, broadcast::channel(1).0);
        let rx = entry.outcome_tx.subscribe();
        let generation = entry.generation;
        let cancel = entry.cancel.clone();
        running.insert(address, entry);
        debug!(peer = %address, kind = ?options.kind, "starting discovery");

        self.spawn_producers(address.clone(), options, generation, cancel);
        Some(rx)
    }

    fn new_entry(
        &self,
        kind: DiscoveryKind,
        outcome_tx: broadcast::Sender<DiscoveryOutcome>,
    ) -> RunningDiscovery {
        RunningDiscovery {
            kind,
            generation: self.generations.fetch_add(1, Ordering::SeqCst),
            outcome_tx,
            cancel: CancellationToken::new(),
        }
    }

    fn spawn_producers(
        self: &Arc<Self>,
        address: PeerAddress,
        options: DiscoveryOptions,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let scan_timeout = match options.kind {
            DiscoveryKind::Timed => options.timeout,
            _ => None,
        };

        // mDNS producer.
        {
            let this = self.clone();
            let address = address.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => return,
                    outcome = this.scan_and_pair(&address, scan_timeout) => outcome,
                };
                this.settle(&address, generation, outcome).await;
            });
        }

        // Cached-address polling producer (full discovery only).
        if options.kind == DiscoveryKind::Full {
            let this = self.clone();
            tokio::spawn(async move {
                this.poll_cached_address(address, generation, cancel).await;
            });
        }
    }

    async fn scan_and_pair(
        self: &Arc<Self>,
        address: &PeerAddress,
        timeout: Option<Duration>,
    ) -> DiscoveryOutcome {
        let device = self
            .scanner
            .find_operational_device(address, timeout, false)
            .await?;
        let Some(device) = device else {
            return Err(PeerError::discovery(format!(
                "operational discovery for {address} produced no device"
            )));
        };
        self.pair_discovered(address, &device).await
    }

    /// Tries the resolved endpoints in order; first CASE success wins.
    async fn pair_discovered(
        self: &Arc<Self>,
        address: &PeerAddress,
        device: &DiscoveredDevice,
    ) -> DiscoveryOutcome {
        let mut last_error = None;
        for endpoint in &device.addresses {
            match self
                .pairer
                .pair(address, *endpoint, device.discovery_data.as_ref(), None)
                .await
            {
                Ok(channel) => {
                    self.peers
                        .record_operational(address, *endpoint, device.discovery_data)
                        .await;
                    return Ok(channel);
                }
                Err(err) => {
                    debug!(peer = %address, endpoint = %endpoint, error = %err, "pairing attempt failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            PeerError::discovery(format!("{address} resolved without usable addresses"))
        }))
    }

    async fn poll_cached_address(
        self: Arc<Self>,
        address: PeerAddress,
        generation: u64,
        cancel: CancellationToken,
    ) {
        let mut interval = tokio::time::interval(FULL_DISCOVERY_POLL_INTERVAL);
        interval.tick().await; // the first poll is one full period out

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = interval.tick() => {}
            }
            let Some((endpoint, data)) = self.known_operational_address(&address).await else {
                continue;
            };
            match self.pairer.pair(&address, endpoint, data.as_ref(), None).await {
                Ok(channel) => {
                    self.peers
                        .record_operational(&address, endpoint, data)
                        .await;
                    self.settle(&address, generation, Ok(channel)).await;
                    // Stop the mDNS side as well.
                    self.scanner
                        .cancel_operational_device_discovery(&address, false)
                        .await;
                    return;
                }
                Err(err) if err.is_unreachable() => {
                    debug!(peer = %address, endpoint = %endpoint, error = %err, "cached address poll failed");
                }
                Err(err) => {
                    // Unexpected failure rejects the whole discovery.
                    warn!(peer = %address, error = %err, "cached address poll hit unexpected error");
                    self.settle(&address, generation, Err(err)).await;
                    self.scanner
                        .cancel_operational_device_discovery(&address, false)
                        .await;
                    return;
                }
            }
        }
    }

    /// First-completer resolution: removes the registry entry, stops the
    /// sibling producers and broadcasts the outcome. Late results of a
    /// superseded generation are discarded.
    async fn settle(&self, address: &PeerAddress, generation: u64, outcome: DiscoveryOutcome) {
        let entry = {
            let mut running = self.running.lock().await;
            match running.get(address) {
                Some(existing) if existing.generation == generation => running.remove(address),
                _ => None,
            }
        };
        match entry {
            Some(entry) => {
                entry.cancel.cancel();
                let _ = entry.outcome_tx.send(outcome);
            }
            None => debug!(peer = %address, "discarding result of superseded discovery"),
        }
    }

    /// Cache-bypassing short scan on behalf of the resubmission reactor.
    /// Holds the per-peer discovery slot while it runs; never pairs and
    /// never surfaces errors.
    pub(crate) async fn retransmission_discovery(self: &Arc<Self>, address: &PeerAddress) {
        let address = address.canonical();
        let (generation, cancel) = {
            let mut running = self.running.lock().await;
            if running.contains_key(&address) {
                return;
            }
            let entry = self.new_entry(DiscoveryKind::Retransmission, broadcast::channel(1).0);
            let ids = (entry.generation, entry.cancel.clone());
            running.insert(&address, entry);
            ids
        };
        debug!(peer = %address, "starting retransmission-triggered rediscovery");

        let scan = self.scanner.find_operational_device(
            &address,
            Some(RETRANSMISSION_DISCOVERY_TIMEOUT),
            true,
        );
        tokio::select! {
            // Superseded or closed: the canceller owns the registry entry.
            _ = cancel.cancelled() => return,
            result = scan => {
                if let Err(err) = result {
                    warn!(peer = %address, error = %err, "retransmission rediscovery failed");
                }
            }
        }

        // Placeholder self-removes regardless of the scan outcome.
        let mut running = self.running.lock().await;
        if let Some(existing) = running.get(&address) {
            if existing.generation == generation {
                running.remove(&address);
            }
        }
    }

    /// One reconnect attempt via the last known operational address
    /// (scanner cache first, then the stored record). `Ok(None)` means no
    /// address on file or the peer did not answer there.
    pub async fn reconnect_last_known_address(
        self: &Arc<Self>,
        address: &PeerAddress,
        expected_processing_time: Option<Duration>,
    ) -> Result<Option<Arc<MessageChannel>>> {
        let address = address.canonical();
        let Some((endpoint, data)) = self.known_operational_address(&address).await else {
            return Ok(None);
        };
        match self
            .pairer
            .pair(&address, endpoint, data.as_ref(), expected_processing_time)
            .await
        {
            Ok(channel) => {
                self.peers
                    .record_operational(&address, endpoint, data)
                    .await;
                Ok(Some(channel))
            }
            Err(err) if err.is_unreachable() => {
                debug!(peer = %address, endpoint = %endpoint, error = %err, "reconnect via last known address failed");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn known_operational_address(
        &self,
        address: &PeerAddress,
    ) -> Option<(ServerAddressIp, Option<DiscoveryData>)> {
        if let Some(device) = self.scanner.get_discovered_operational_device(address).await {
            if let Some(endpoint) = device.addresses.first() {
                return Some((*endpoint, device.discovery_data));
            }
        }
        let peer = self.peers.get(address).await?;
        peer.operational_address
            .map(|endpoint| (endpoint, peer.discovery_data))
    }

    pub(crate) async fn has_running_discovery(&self, address: &PeerAddress) -> bool {
        self.running.lock().await.contains_key(address)
    }

    /// Stops every running discovery: producer tasks and timers end, the
    /// scanner is told to cancel per peer without resolving its waiters.
    pub async fn cancel_all(&self) {
        let drained: Vec<(PeerAddress, RunningDiscovery)> =
            self.running.lock().await.drain().collect();
        for (address, entry) in &drained {
            info!(peer = %address, kind = ?entry.kind, "cancelling discovery");
            entry.cancel.cancel();
        }
        for (address, _) in &drained {
            self.scanner
                .cancel_operational_device_discovery(address, false)
                .await;
        }
    }
}

async fn await_outcome(
    address: &PeerAddress,
    mut rx: broadcast::Receiver<DiscoveryOutcome>,
) -> Result<Arc<MessageChannel>> {
    loop {
        match rx.recv().await {
            Ok(outcome) => return outcome,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            // Every producer went away without settling: the discovery was
            // cancelled underneath us.
            Err(broadcast::error::RecvError::Closed) => {
                return Err(PeerError::discovery(format!(
                    "discovery for {address} was cancelled"
                )));
            }
        }
    }
}

#[cfg(test)]
#[path = "discovery_tests.rs"]
mod tests;
