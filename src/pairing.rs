use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::address::PeerAddress;
use crate::cache::NodeCacheRegistry;
use crate::channel::{ChannelManager, ExchangeManager, MessageChannel};
use crate::error::{PeerError, Result};
use crate::scanner::DiscoveryData;
use crate::session::{CaseInitiator, SessionLayer, SessionParameters};
use crate::transport::{ChannelType, NetInterfaceSet, ServerAddressIp, SECURE_CHANNEL_PROTOCOL_ID};

/// Runs CASE against a resolved operational address and registers the
/// resulting secure channel.
pub struct CasePairer {
    interfaces: Arc<NetInterfaceSet>,
    sessions: Arc<dyn SessionLayer>,
    case: Arc<dyn CaseInitiator>,
    exchanges: Arc<dyn ExchangeManager>,
    channels: Arc<ChannelManager>,
    caches: Arc<NodeCacheRegistry>,
}

impl CasePairer {
    pub fn new(
        interfaces: Arc<NetInterfaceSet>,
        sessions: Arc<dyn SessionLayer>,
        case: Arc<dyn CaseInitiator>,
        exchanges: Arc<dyn ExchangeManager>,
        channels: Arc<ChannelManager>,
        caches: Arc<NodeCacheRegistry>,
    ) -> Self {
        Self {
            interfaces,
            sessions,
            case,
            exchanges,
            channels,
            caches,
        }
    }

    /// Establishes a secure session with the peer at `operational_address`.
    ///
    /// Transport timeouts surface as `PairRetransmissionLimitReached`,
    /// preserving the underlying message.
    pub async fn pair(
        &self,
        address: &PeerAddress,
        operational_address: ServerAddressIp,
        discovery_data: Option<&DiscoveryData>,
        expected_processing_time: Option<Duration>,
    ) -> Result<Arc<MessageChannel>> {
        self.pair_inner(
            address,
            operational_address,
            discovery_data,
            expected_processing_time,
        )
        .await
        .map_err(PeerError::into_pair_retransmission)
    }

    async fn pair_inner(
        &self,
        address: &PeerAddress,
        operational_address: ServerAddressIp,
        discovery_data: Option<&DiscoveryData>,
        expected_processing_time: Option<Duration>,
    ) -> Result<Arc<MessageChannel>> {
        let bind = operational_address.bind_interface();
        let interface = self
            .interfaces
            .interface_for(ChannelType::Udp, bind)
            .ok_or_else(|| {
                PeerError::PairRetransmissionLimitReached(format!(
                    "no UDP interface available for {bind}"
                ))
            })?;

        let transport = interface.open_channel(operational_address).await?;

        // Session parameters: discovery record hints beat the resumption
        // record on file, which beats the defaults.
        let resumption = self.sessions.resumption_record_for(address).await;
        let parameters = SessionParameters::sourced(discovery_data, resumption.as_ref());
        let unsecure = self
            .sessions
            .create_insecure_session(address, parameters)
            .await?;

        let unsecure_channel = Arc::new(MessageChannel::new(transport.clone(), unsecure.clone()));
        let exchange = match self
            .exchanges
            .initiate_exchange_with_channel(&unsecure_channel, SECURE_CHANNEL_PROTOCOL_ID)
        {
            Ok(exchange) => exchange,
            Err(err) => {
                self.release_unsecure(unsecure).await;
                return Err(err);
            }
        };

        let case_result = match self
            .case
            .establish(exchange.as_ref(), address, expected_processing_time)
            .await
        {
            Ok(result) => result,
            Err(err) => {
                // The exchange is closed before the error propagates.
                if let Err(close_err) = exchange.close().await {
                    warn!(peer = %address, error = %close_err, "failed to close CASE exchange");
                }
                self.release_unsecure(unsecure).await;
                return Err(err);
            }
        };

        if !case_result.resumed {
            // Fresh session: the device likely rebooted or upgraded, so any
            // cached node state must go before a read can return it.
            self.caches.drop_cache(address);
        }

        // The unsecure bootstrap session is destroyed before the secure
        // channel becomes visible.
        self.sessions.destroy_session(unsecure).await?;

        let channel = Arc::new(MessageChannel::new(transport, case_result.session));
        self.channels.set_channel(address, channel.clone()).await;
        info!(
            peer = %address,
            endpoint = %operational_address,
            resumed = case_result.resumed,
            "operational channel established"
        );
        Ok(channel)
    }

    async fn release_unsecure(&self, session: Arc<dyn crate::session::Session>) {
        if let Err(err) = self.sessions.destroy_session(session).await {
            warn!(error = %err, "failed to destroy unsecure session");
        }
    }
}

#[cfg(test)]
#[path = "pairing_tests.rs"]
mod tests;
