//! Discovery-mode rules: option validation at the façade, mode upgrade,
//! timed bounds and the resubmission reactor.

use std::time::Duration;

use matlink::discovery::{DiscoveryKind, DiscoveryOptions};
use matlink::error::PeerError;
use matlink::session::ResubmissionEvent;

use crate::*;

#[tokio::test(start_paused = true)]
async fn retransmission_mode_is_rejected_for_callers() {
    let h = harness().await;
    let err = h
        .peers
        .connect(
            &addr(1, 0x3001),
            DiscoveryOptions {
                kind: DiscoveryKind::Retransmission,
                timeout: None,
            },
        )
        .await
        .expect_err("reserved for the reactor");
    assert!(matches!(err, PeerError::Implementation(_)));
}

#[tokio::test(start_paused = true)]
async fn timeout_outside_timed_mode_is_rejected() {
    let h = harness().await;
    let err = h
        .peers
        .connect(
            &addr(1, 0x3002),
            DiscoveryOptions {
                kind: DiscoveryKind::Full,
                timeout: Some(Duration::from_secs(10)),
            },
        )
        .await
        .expect_err("timeout requires timed mode");
    assert!(matches!(err, PeerError::Implementation(_)));
}

#[tokio::test(start_paused = true)]
async fn timed_discovery_passes_its_bound_to_the_scanner() {
    let h = harness().await;
    let peer = addr(1, 0x3003);
    h.scanner
        .script_find(&peer, FindScript::Found(device(&["fd00::3"])));

    h.peers
        .connect(&peer, DiscoveryOptions::timed(Duration::from_secs(30)))
        .await
        .expect("connect");

    let calls = h.scanner.find_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].timeout, Some(Duration::from_secs(30)));
    assert!(!calls[0].ignore_cache);
}

#[tokio::test(start_paused = true)]
async fn timed_discovery_miss_surfaces_as_discovery_error() {
    let h = harness().await;
    let peer = addr(1, 0x3004);
    h.scanner.script_find(&peer, FindScript::Miss);

    let err = h
        .peers
        .connect(&peer, DiscoveryOptions::timed(Duration::from_secs(5)))
        .await
        .expect_err("nothing found");
    assert!(matches!(err, PeerError::Discovery(_)));
}

#[tokio::test(start_paused = true)]
async fn full_discovery_supersedes_timed() {
    let h = harness().await;
    let peer = addr(1, 0x3005);
    // The timed discovery never answers; the full one resolves.
    h.scanner.script_find(&peer, FindScript::Hang);
    h.scanner
        .script_find(&peer, FindScript::Found(device(&["fd00::6"])));

    let timed = {
        let peers = h.peers.clone();
        let peer = peer.clone();
        tokio::spawn(async move {
            peers
                .connect(&peer, DiscoveryOptions::timed(Duration::from_secs(600)))
                .await
        })
    };
    wait_until("timed discovery reaches the scanner", || {
        h.scanner.find_call_count() == 1
    })
    .await;

    let full = h
        .peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("full discovery connect");

    // The scanner was told to drop the timed query without resolving its
    // waiters, and a fresh query was issued.
    assert!(h
        .scanner
        .cancels
        .lock()
        .unwrap()
        .contains(&(peer.clone(), false)));
    assert_eq!(h.scanner.find_call_count(), 2);

    // The superseded caller settles with the new discovery's outcome.
    let timed = timed
        .await
        .expect("task")
        .expect("superseded caller shares the result");
    assert!(timed.address().is_same_instance(full.address()));
    assert_eq!(h.case.call_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn equal_mode_joins_instead_of_restarting() {
    let h = harness().await;
    let peer = addr(1, 0x3006);
    h.scanner.script_find(
        &peer,
        FindScript::FoundAfter(Duration::from_millis(100), device(&["fd00::8"])),
    );

    let first = {
        let peers = h.peers.clone();
        let peer = peer.clone();
        tokio::spawn(
            async move { peers.connect(&peer, DiscoveryOptions::default()).await },
        )
    };
    wait_until("first discovery reaches the scanner", || {
        h.scanner.find_call_count() == 1
    })
    .await;

    let second = h
        .peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("second connect");
    let first = first.await.expect("task").expect("first connect");

    assert!(first.address().is_same_instance(second.address()));
    assert_eq!(h.scanner.find_call_count(), 1);
    assert!(h.scanner.cancels.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn resubmission_fires_short_cache_bypassing_scan() {
    let h = harness().await;
    let peer = addr(2, 0xABCD);
    h.scanner.script_find(&peer, FindScript::Miss);

    h.sessions.emit_resubmission(ResubmissionEvent {
        secure: true,
        peer: Some(peer.clone()),
    });

    wait_until("reactor scan", || h.scanner.find_call_count() == 1).await;
    let call = h.scanner.find_calls.lock().unwrap()[0].clone();
    assert!(call.address.is_same_instance(&peer));
    assert_eq!(call.timeout, Some(Duration::from_secs(5)));
    assert!(call.ignore_cache);

    // Placeholder cleared on completion: a second event scans again.
    h.scanner.script_find(&peer, FindScript::Miss);
    h.sessions.emit_resubmission(ResubmissionEvent {
        secure: true,
        peer: Some(peer.clone()),
    });
    wait_until("second reactor scan", || h.scanner.find_call_count() == 2).await;
}

#[tokio::test(start_paused = true)]
async fn reactor_ignores_insecure_and_anonymous_sessions() {
    let h = harness().await;

    h.sessions.emit_resubmission(ResubmissionEvent {
        secure: false,
        peer: Some(addr(2, 0x4001)),
    });
    h.sessions.emit_resubmission(ResubmissionEvent {
        secure: true,
        peer: None,
    });

    // Give the reactor time to (not) act.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.scanner.find_call_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn full_discovery_polls_cached_address_every_ten_minutes() {
    let peer = addr(1, 0x3007);
    let h = harness_with_store(vec![OperationalPeer {
        address: peer.clone(),
        operational_address: Some(endpoint("fe80::1", 5540)),
        discovery_data: None,
    }])
    .await;

    // Direct attempt and the mDNS query never succeed; only the periodic
    // poll of the cached address does, once the peer answers again.
    h.interface
        .script_open_error(PeerError::NoResponseTimeout("still offline".into()));
    h.interface
        .script_open_error(PeerError::NoResponseTimeout("still offline".into()));
    h.scanner.script_find(&peer, FindScript::Hang);

    let client = h
        .peers
        .connect(&peer, DiscoveryOptions::default())
        .await
        .expect("poll succeeds on second cycle");

    assert!(client.address().is_same_instance(&peer));
    // Initial direct attempt + two polls (first one still failing).
    assert_eq!(h.interface.opened_endpoints().len(), 3);
    // Resolving the poll also cancels the mDNS side.
    assert!(h
        .scanner
        .cancels
        .lock()
        .unwrap()
        .contains(&(peer.clone(), false)));
}
