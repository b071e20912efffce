//! Peer lifecycle: delete laws, close semantics, change events and
//! construction failure surfacing.

use std::time::Duration;

use async_trait::async_trait;
use matlink::discovery::DiscoveryOptions;
use matlink::error::{PeerError, Result};
use matlink::peers::{OperationalPeer, PeerSetEvent};
use matlink::store::PeerStore;

use crate::*;

#[tokio::test(start_paused = true)]
async fn delete_forgets_record_store_channels_and_resumption() {
    let peer = addr(1, 0x5001);
    let h = harness_with_store(vec![OperationalPeer {
        address: peer.clone(),
        operational_address: Some(endpoint("fe80::1", 5540)),
        discovery_data: None,
    }])
    .await;

    h.peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("connect");
    assert!(h.channels.has_channel(&peer).await);

    h.peers.delete(&peer).await.expect("delete");

    assert_eq!(h.peers.get(&peer).await.expect("get"), None);
    assert!(h.store.load_peers().await.expect("load").is_empty());
    assert!(!h.channels.has_channel(&peer).await);
    assert_eq!(
        h.sessions.deleted_resumption.lock().unwrap().as_slice(),
        &[peer.clone()]
    );
    assert!(h
        .sessions
        .removed
        .lock()
        .unwrap()
        .contains(&(peer.clone(), false)));
}

#[tokio::test(start_paused = true)]
async fn delete_of_unknown_peer_is_a_silent_no_op() {
    let h = harness().await;
    let mut events = h.peers.subscribe();

    h.peers.delete(&addr(1, 0x5002)).await.expect("no-op");

    assert!(events.try_recv().is_err());
    assert!(h.sessions.removed.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn disconnect_keeps_the_peer_record() {
    let peer = addr(1, 0x5003);
    let h = harness_with_store(vec![OperationalPeer {
        address: peer.clone(),
        operational_address: Some(endpoint("fe80::1", 5540)),
        discovery_data: None,
    }])
    .await;
    h.peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("connect");

    h.peers.disconnect(&peer).await.expect("disconnect");

    assert!(!h.channels.has_channel(&peer).await);
    assert!(h
        .sessions
        .removed
        .lock()
        .unwrap()
        .contains(&(peer.clone(), false)));
    assert!(h.peers.get(&peer).await.expect("get").is_some());
}

#[tokio::test(start_paused = true)]
async fn events_fire_after_the_index_update() {
    let h = harness().await;
    let peer = addr(1, 0x5004);
    let mut events = h.peers.subscribe();
    h.scanner
        .script_find(&peer, FindScript::Found(device(&["fd00::9"])));

    h.peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("connect");

    match events.recv().await.expect("added event") {
        PeerSetEvent::Added(added) => {
            assert!(added.address.is_same_instance(&peer));
            // By the time the event is observable the index answers.
            assert!(h.peers.get(&peer).await.expect("get").is_some());
        }
        other => panic!("unexpected event: {other:?}"),
    }

    h.peers.delete(&peer).await.expect("delete");
    match events.recv().await.expect("deleted event") {
        PeerSetEvent::Deleted(deleted) => {
            assert!(deleted.address.is_same_instance(&peer));
            assert_eq!(h.peers.get(&peer).await.expect("get"), None);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn close_cancels_discoveries_without_resolving_their_waiters() {
    let peer = addr(1, 0x5005);
    let h = harness_with_store(vec![OperationalPeer {
        address: peer.clone(),
        operational_address: Some(endpoint("fe80::1", 5540)),
        discovery_data: None,
    }])
    .await;
    h.interface
        .script_open_error(PeerError::NoResponseTimeout("offline".into()));
    h.scanner.script_find(&peer, FindScript::Hang);

    let pending = {
        let peers = h.peers.clone();
        let peer = peer.clone();
        tokio::spawn(
            async move { peers.connect(&peer, DiscoveryOptions::default()).await },
        )
    };
    wait_until("discovery reaches the scanner", || {
        h.scanner.find_call_count() == 1
    })
    .await;

    h.peers.close().await;

    // The scanner is told to stop without resolving waiters; the caller
    // observes an abort, not a spurious success.
    assert!(h
        .scanner
        .cancels
        .lock()
        .unwrap()
        .contains(&(peer.clone(), false)));
    let err = pending
        .await
        .expect("task")
        .expect_err("waiter aborted by close");
    assert!(matches!(err, PeerError::Discovery(_)));

    // The full-discovery poll timer is stopped: no further reconnect
    // attempts even well past the polling interval.
    let opened_before = h.interface.opened_endpoints().len();
    tokio::time::sleep(Duration::from_secs(1800)).await;
    assert_eq!(h.interface.opened_endpoints().len(), opened_before);
}

#[tokio::test(start_paused = true)]
async fn close_shuts_the_interaction_queue() {
    let h = harness().await;
    let peer = addr(1, 0x5006);
    h.channels.set_channel(&peer, seeded_channel(&peer)).await;
    let client = h
        .peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("connect");

    h.peers.close().await;

    let err = client.interaction().await.expect_err("queue closed");
    assert!(matches!(err, PeerError::Implementation(_)));
}

#[tokio::test(start_paused = true)]
async fn interaction_runs_on_the_interaction_protocol() {
    let h = harness().await;
    let peer = addr(1, 0x5007);
    h.channels.set_channel(&peer, seeded_channel(&peer)).await;

    let client = h
        .peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("connect");
    let interaction = client.interaction().await.expect("interaction");
    assert_eq!(interaction.exchange().protocol_id(), 0x0001);
    interaction.close().await.expect("close exchange");
}

struct FailingStore;

#[async_trait]
impl PeerStore for FailingStore {
    async fn load_peers(&self) -> Result<Vec<OperationalPeer>> {
        Err(PeerError::store("backing store unavailable"))
    }
    async fn update_peer(&self, _peer: &OperationalPeer) -> Result<()> {
        Err(PeerError::store("backing store unavailable"))
    }
    async fn delete_peer(
        &self,
        _address: &matlink::address::PeerAddress,
    ) -> Result<()> {
        Err(PeerError::store("backing store unavailable"))
    }
}

#[tokio::test(start_paused = true)]
async fn failed_store_load_incapacitates_the_peer_set() {
    let scanner = Arc::new(MockScanner::default());
    let sessions = Arc::new(MockSessions::default());
    let mut interfaces = NetInterfaceSet::new();
    interfaces.add_interface(
        ChannelType::Udp,
        BIND_ALL_IPV6,
        Arc::new(MockInterface::default()),
    );

    let peers = PeerSet::new(ControllerContext {
        sessions,
        channels: Arc::new(ChannelManager::new()),
        exchanges: Arc::new(MockExchanges::default()),
        case: Arc::new(MockCase::default()),
        scanner,
        interfaces: Arc::new(interfaces),
        store: Arc::new(FailingStore),
    });

    let err = peers
        .construction()
        .wait()
        .await
        .expect_err("construction fails");
    assert!(matches!(err, PeerError::IncapacitatedDependency { .. }));

    let err = peers
        .get(&addr(1, 0x5008))
        .await
        .expect_err("asserts incapacitated");
    assert!(matches!(err, PeerError::IncapacitatedDependency { .. }));
}
