use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::address::PeerAddress;
use crate::error::Result;
use crate::scanner::DiscoveryData;

/// MRP session parameters negotiated with (or assumed for) a peer, all in
/// milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParameters {
    pub idle_interval_ms: u32,
    pub active_interval_ms: u32,
    pub active_threshold_ms: u16,
}

impl Default for SessionParameters {
    fn default() -> Self {
        Self {
            idle_interval_ms: 500,
            active_interval_ms: 300,
            active_threshold_ms: 4000,
        }
    }
}

impl SessionParameters {
    /// Sources the parameters for a new unsecure session: discovery record
    /// hints win, then a resumption record on file, then the defaults.
    pub fn sourced(
        hints: Option<&DiscoveryData>,
        resumption: Option<&ResumptionRecord>,
    ) -> Self {
        let base = resumption
            .and_then(|record| record.session_parameters)
            .unwrap_or_default();
        let Some(hints) = hints else {
            return base;
        };
        Self {
            idle_interval_ms: hints.sii.map(|v| v as u32).unwrap_or(base.idle_interval_ms),
            active_interval_ms: hints
                .sai
                .map(|v| v as u32)
                .unwrap_or(base.active_interval_ms),
            active_threshold_ms: hints
                .sat
                .map(|v| v as u16)
                .unwrap_or(base.active_threshold_ms),
        }
    }
}

/// Stored CASE resumption state for a peer.
#[derive(Debug, Clone)]
pub struct ResumptionRecord {
    pub address: PeerAddress,
    pub session_parameters: Option<SessionParameters>,
}

/// A session held by the session manager: unsecure while CASE runs, secure
/// afterwards.
pub trait Session: Send + Sync + fmt::Debug {
    fn id(&self) -> u32;
    fn is_secure(&self) -> bool;
    fn peer_address(&self) -> Option<PeerAddress>;
    fn parameters(&self) -> SessionParameters;
}

/// First-retry notification from the reliable-messaging layer.
#[derive(Debug, Clone)]
pub struct ResubmissionEvent {
    pub secure: bool,
    pub peer: Option<PeerAddress>,
}

/// The session manager of the fabric context, consumed at its interface.
#[async_trait]
pub trait SessionLayer: Send + Sync {
    /// Creates an unsecure initiator session seeded with `parameters`.
    async fn create_insecure_session(
        &self,
        address: &PeerAddress,
        parameters: SessionParameters,
    ) -> Result<Arc<dyn Session>>;

    /// Destroys a session (scoped release of the unsecure session once CASE
    /// finished either way).
    async fn destroy_session(&self, session: Arc<dyn Session>) -> Result<()>;

    async fn resumption_record_for(&self, address: &PeerAddress) -> Option<ResumptionRecord>;

    /// Removes every session for the node. `inform_upper_layers` makes the
    /// removal visible to subscription/interaction owners above this core.
    async fn remove_all_sessions_for_node(
        &self,
        address: &PeerAddress,
        inform_upper_layers: bool,
    ) -> Result<()>;

    async fn delete_resumption_record(&self, address: &PeerAddress) -> Result<()>;

    /// Stream of `resubmission_started` events.
    fn resubmission_events(&self) -> broadcast::Receiver<ResubmissionEvent>;
}

/// Result of a completed CASE exchange.
#[derive(Debug, Clone)]
pub struct CaseResult {
    pub session: Arc<dyn Session>,
    /// Whether the session resumed from a resumption record. A fresh
    /// (non-resumed) session implies the peer may have rebooted, so cached
    /// node state must be considered stale.
    pub resumed: bool,
}

/// CASE itself, consumed at its interface: runs the key agreement over an
/// already-open exchange and reports the secure session.
#[async_trait]
pub trait CaseInitiator: Send + Sync {
    async fn establish(
        &self,
        exchange: &dyn crate::channel::Exchange,
        address: &PeerAddress,
        expected_processing_time: Option<Duration>,
    ) -> Result<CaseResult>;
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
