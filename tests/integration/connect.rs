//! Connect-path scenarios: cached channels, direct reconnects, discovery
//! fallback and waiter coalescing.

use std::sync::atomic::Ordering;
use std::time::Duration;

use matlink::discovery::{DiscoveryKind, DiscoveryOptions};
use matlink::error::PeerError;
use matlink::peers::OperationalPeer;
use matlink::store::PeerStore;

use crate::*;

#[tokio::test(start_paused = true)]
async fn cached_channel_skips_discovery_and_pairing() {
    let h = harness().await;
    let peer = addr(1, 0x12345);
    h.channels.set_channel(&peer, seeded_channel(&peer)).await;

    let client = h
        .peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("connect");

    assert!(client.address().is_same_instance(&peer));
    assert_eq!(h.scanner.find_call_count(), 0);
    assert_eq!(h.case.call_count(), 0);
    assert!(h.interface.opened_endpoints().is_empty());
}

#[tokio::test(start_paused = true)]
async fn direct_reconnect_uses_stored_address() {
    let peer = addr(1, 0x2001);
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

    // One channel open, one CASE run, no scanner query.
    assert_eq!(h.interface.opened_endpoints(), vec![endpoint("fe80::1", 5540)]);
    assert_eq!(h.case.call_count(), 1);
    assert_eq!(h.scanner.find_call_count(), 0);

    // The record write is idempotent: still one record, same endpoint.
    let stored = h.store.load_peers().await.expect("load");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].operational_address, Some(endpoint("fe80::1", 5540)));
}

#[tokio::test(start_paused = true)]
async fn failed_direct_reconnect_falls_back_to_mdns() {
    let peer = addr(1, 0x2002);
    let h = harness_with_store(vec![OperationalPeer {
        address: peer.clone(),
        operational_address: Some(endpoint("fe80::1", 5540)),
        discovery_data: None,
    }])
    .await;

    h.interface
        .script_open_error(PeerError::NoResponseTimeout("peer moved".into()));
    h.scanner
        .script_find(&peer, FindScript::Found(device(&["2001:db8::2"])));

    h.peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("connect");

    // Second CASE exchange ran against the freshly discovered endpoint.
    assert_eq!(
        h.interface.opened_endpoints(),
        vec![endpoint("fe80::1", 5540), endpoint("2001:db8::2", 5540)]
    );
    assert_eq!(h.case.call_count(), 1);

    // Peer record now points at the new endpoint.
    let refreshed = h
        .peers
        .get(&peer)
        .await
        .expect("get")
        .expect("record exists");
    assert_eq!(
        refreshed.operational_address,
        Some(endpoint("2001:db8::2", 5540))
    );
}

#[tokio::test(start_paused = true)]
async fn parallel_connects_share_one_discovery() {
    let h = harness().await;
    let peer = addr(1, 0x2003);
    h.scanner.script_find(
        &peer,
        FindScript::FoundAfter(Duration::from_millis(200), device(&["fd00::5"])),
    );

    let (a, b) = tokio::join!(
        h.peers.connect(&peer, DiscoveryOptions::default()),
        h.peers.connect(&peer, DiscoveryOptions::default()),
    );
    let a = a.expect("first connect");
    let b = b.expect("second connect");

    assert!(a.address().is_same_instance(b.address()));
    assert_eq!(h.scanner.find_call_count(), 1);
    assert_eq!(h.case.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn none_mode_with_no_cached_address_fails_immediately() {
    let h = harness().await;
    let peer = addr(1, 0x2004);

    let err = h
        .peers
        .connect(
            &peer,
            DiscoveryOptions {
                kind: DiscoveryKind::None,
                timeout: None,
            },
        )
        .await
        .expect_err("nothing cached");
    assert!(matches!(err, PeerError::Discovery(_)));
    assert_eq!(h.scanner.find_call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn none_mode_with_addressless_record_fails_immediately() {
    let peer = addr(1, 0x2008);
    let h = harness_with_store(vec![OperationalPeer::new(peer.clone())]).await;

    let err = h
        .peers
        .connect(
            &peer,
            DiscoveryOptions {
                kind: DiscoveryKind::None,
                timeout: None,
            },
        )
        .await
        .expect_err("record has no operational address");
    assert!(matches!(err, PeerError::Discovery(_)));
    assert!(h.interface.opened_endpoints().is_empty());
}

#[tokio::test(start_paused = true)]
async fn none_mode_direct_failure_is_a_discovery_error() {
    let peer = addr(1, 0x2005);
    let h = harness_with_store(vec![OperationalPeer {
        address: peer.clone(),
        operational_address: Some(endpoint("fe80::1", 5540)),
        discovery_data: None,
    }])
    .await;
    h.interface
        .script_open_error(PeerError::NoResponseTimeout("unplugged".into()));

    let err = h
        .peers
        .connect(
            &peer,
            DiscoveryOptions {
                kind: DiscoveryKind::None,
                timeout: None,
            },
        )
        .await
        .expect_err("direct attempt failed");
    assert!(matches!(err, PeerError::Discovery(_)));
    // Cached-only never touches the scanner.
    assert_eq!(h.scanner.find_call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scanner_cache_beats_stored_record_for_direct_reconnect() {
    let peer = addr(1, 0x2006);
    let h = harness_with_store(vec![OperationalPeer {
        address: peer.clone(),
        operational_address: Some(endpoint("fe80::1", 5540)),
        discovery_data: None,
    }])
    .await;
    h.scanner.seed_cache(&peer, device(&["fd00::7"]));

    h.peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("connect");

    assert_eq!(h.interface.opened_endpoints(), vec![endpoint("fd00::7", 5540)]);
}

#[tokio::test(start_paused = true)]
async fn unsecure_session_destroyed_after_successful_pair() {
    let peer = addr(1, 0x2007);
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

    assert_eq!(h.sessions.created.load(Ordering::SeqCst), 1);
    assert_eq!(h.sessions.destroyed.load(Ordering::SeqCst), 1);
}
