use std::sync::Arc;

use thiserror::Error;

use crate::address::PeerAddress;
use crate::lifecycle::LifecycleStatus;

pub type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Error taxonomy of the peer connection core.
///
/// The enum is `Clone` on purpose: a discovery outcome is broadcast to every
/// caller coalesced onto the same in-flight attempt, so the error has to be
/// shareable. Payloads are strings or `Arc`s; underlying causes are rendered
/// into the message at the conversion point.
#[derive(Debug, Clone, Error)]
pub enum PeerError {
    /// Programming error on the caller side (invalid options, misuse of a
    /// closed or half-built component). Propagates unchanged.
    #[error("implementation error: {0}")]
    Implementation(String),

    /// Channel lookup miss. Expected during reconnect handling and caught
    /// internally; callers normally see `RetransmissionLimitReached` instead.
    #[error("no channel known for {0}")]
    NoChannel(PeerAddress),

    /// The transport gave up waiting for a response.
    #[error("no response received: {0}")]
    NoResponseTimeout(String),

    /// CASE or its transport exhausted retransmissions while pairing.
    #[error("pair retransmission limit reached: {0}")]
    PairRetransmissionLimitReached(String),

    /// Higher-level exhaustion surfaced to the caller of an interaction.
    #[error("retransmission limit reached: {0}")]
    RetransmissionLimitReached(String),

    /// Discovery produced nothing usable for the peer.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// A dependency was used before its construction completed, or after it
    /// was cancelled.
    #[error("{subject} is not usable (status {status:?})")]
    UninitializedDependency {
        subject: String,
        status: LifecycleStatus,
    },

    /// A dependency failed to construct; carries the original failure.
    #[error("{subject} is incapacitated: {cause}")]
    IncapacitatedDependency {
        subject: String,
        cause: Arc<PeerError>,
    },

    /// Peer store failure.
    #[error("peer store failure: {0}")]
    Store(String),

    /// Scanner failure (mDNS daemon or browse channel trouble).
    #[error("scanner failure: {0}")]
    Scanner(String),
}

impl PeerError {
    pub fn implementation(message: impl Into<String>) -> Self {
        Self::Implementation(message.into())
    }

    pub fn discovery(message: impl Into<String>) -> Self {
        Self::Discovery(message.into())
    }

    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Pairing contract: transport timeouts surface to the caller as
    /// `PairRetransmissionLimitReached`, preserving the message.
    pub fn into_pair_retransmission(self) -> Self {
        match self {
            Self::NoResponseTimeout(message) => Self::PairRetransmissionLimitReached(message),
            other => other,
        }
    }

    /// Errors that mean "the peer did not answer on the path we tried", as
    /// opposed to a broken precondition. Used by reconnect handling to decide
    /// between retrying elsewhere and propagating.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::NoResponseTimeout(_)
                | Self::PairRetransmissionLimitReached(_)
                | Self::Discovery(_)
        )
    }
}
