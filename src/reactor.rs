use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::discovery::DiscoveryOrchestrator;
use crate::session::SessionLayer;

/// Reacts to first-retry events from the reliable-messaging layer by firing
/// a short cache-bypassing rediscovery, on the theory that the peer moved
/// addresses. Best effort: nothing here ever reaches a caller.
pub struct ResubmissionReactor {
    cancel: CancellationToken,
}

impl ResubmissionReactor {
    pub fn spawn(
        sessions: Arc<dyn SessionLayer>,
        orchestrator: Arc<DiscoveryOrchestrator>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let mut events = sessions.resubmission_events();

        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("resubmission reactor shutting down");
                            break;
                        }
                        event = events.recv() => event,
                    };
                    let event = match event {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "resubmission events lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };

                    // Insecure sessions and sessions without a peer identity
                    // have nothing to rediscover.
                    if !event.secure {
                        continue;
                    }
                    let Some(address) = event.peer else {
                        continue;
                    };
                    if orchestrator.has_running_discovery(&address).await {
                        continue;
                    }

                    debug!(peer = %address, "resubmission started; refreshing operational address");
                    let orchestrator = orchestrator.clone();
                    tokio::spawn(async move {
                        // Errors are logged inside; the reactor never fails.
                        orchestrator.retransmission_discovery(&address).await;
                    });
                }
            });
        }

        Self { cancel }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for ResubmissionReactor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
