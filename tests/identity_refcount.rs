//! Identity reference counting across selectors, responses and GC.

mod common;

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use common::*;
use fqdn_identity::{DnsIpRecords, FqdnConfig, FqdnSelector, IdentityAllocator, RequestContext};

fn cilium_selectors() -> Vec<FqdnSelector> {
    vec![
        FqdnSelector::name("cilium.io"),
        FqdnSelector::pattern("*cilium.io."),
        FqdnSelector::name("ebpf.io"),
    ]
}

#[test]
fn test_identity_refcount_through_selector_lifecycle() {
    let h = TestHarness::new();
    for selector in cilium_selectors() {
        h.daemon.register_selector(&selector).unwrap();
    }
    assert_eq!(h.identity_count(), 0);

    let endpoint = h.daemon.endpoint(1);
    let now = Instant::now();

    h.notify(now, &endpoint, &a_response("cilium.io.", 60, &["192.0.2.3"]))
        .unwrap();
    assert_eq!(h.identity_count(), 1);

    // Same response again: no new references.
    h.notify(now, &endpoint, &a_response("cilium.io.", 60, &["192.0.2.3"]))
        .unwrap();
    assert_eq!(h.identity_count(), 1);
    assert_eq!(h.total_refs(), 2);

    h.notify(now, &endpoint, &a_response("ebpf.io.", 60, &["192.0.2.4"]))
        .unwrap();
    assert_eq!(h.identity_count(), 2);

    // The pattern still selects 192.0.2.3.
    let manager = h.daemon.name_manager();
    manager.unregister_selector(&FqdnSelector::name("cilium.io"));
    assert_eq!(h.identity_count(), 2);

    for selector in manager.selectors() {
        manager.unregister_selector(&selector);
    }
    assert!(h.allocator.reference_counts().is_empty());
    assert_eq!(h.selector_cache.selector_count(), 0);
}

#[test]
fn test_selector_sets_track_matching_names() {
    let h = TestHarness::new();
    for selector in cilium_selectors() {
        h.daemon.register_selector(&selector).unwrap();
    }
    let endpoint = h.daemon.endpoint(1);
    let now = Instant::now();

    h.notify(now, &endpoint, &a_response("www.cilium.io.", 60, &["192.0.2.5"]))
        .unwrap();
    h.notify(now, &endpoint, &a_response("cilium.io.", 60, &["192.0.2.3"]))
        .unwrap();

    let exact = h.selector_cache.selections(&FqdnSelector::name("cilium.io"));
    let pattern = h
        .selector_cache
        .selections(&FqdnSelector::pattern("*cilium.io."));
    let ebpf = h.selector_cache.selections(&FqdnSelector::name("ebpf.io"));

    let id3 = h.identity_of("192.0.2.3").unwrap();
    let id5 = h.identity_of("192.0.2.5").unwrap();
    assert_eq!(*exact, BTreeSet::from([id3]));
    assert_eq!(*pattern, BTreeSet::from([id3, id5]));
    assert!(ebpf.is_empty());
}

#[test]
fn test_late_registration_sees_earlier_responses() {
    let h = TestHarness::new();
    let endpoint = h.daemon.endpoint(1);
    h.notify(
        Instant::now(),
        &endpoint,
        &a_response("cilium.io.", 60, &["192.0.2.3", "192.0.2.4"]),
    )
    .unwrap();
    assert_eq!(h.identity_count(), 0);

    let ids = h
        .daemon
        .name_manager()
        .register_selector(&FqdnSelector::name("cilium.io"))
        .unwrap();

    assert_eq!(ids.len(), 2);
    assert_eq!(
        *h.selector_cache.selections(&FqdnSelector::name("cilium.io")),
        ids
    );
}

#[test]
fn test_name_manager_refcount_scenario_without_daemon() {
    let h = TestHarness::new();
    let manager = h.daemon.name_manager();
    for selector in cilium_selectors() {
        manager.register_selector(&selector).unwrap();
    }

    let records = |name: &str, addr: &str| {
        BTreeMap::from([(
            name.to_string(),
            DnsIpRecords {
                ttl: 60,
                ips: vec![ip(addr)],
            },
        )])
    };
    let ctx = RequestContext::new();
    let now = Instant::now();

    manager
        .ingest_dns_records(&ctx, now, &records("cilium.io.", "192.0.2.3"))
        .unwrap();
    manager
        .ingest_dns_records(&ctx, now, &records("cilium.io.", "192.0.2.3"))
        .unwrap();
    assert_eq!(h.identity_count(), 1);

    manager
        .ingest_dns_records(&ctx, now, &records("ebpf.io.", "192.0.2.4"))
        .unwrap();
    assert_eq!(h.identity_count(), 2);

    manager.unregister_selector(&FqdnSelector::name("cilium.io"));
    assert_eq!(h.identity_count(), 2);

    for selector in cilium_selectors() {
        manager.unregister_selector(&selector);
    }
    assert!(h.allocator.reference_counts().is_empty());
}

#[test]
fn test_gc_releases_everything_after_expiry() {
    let h = TestHarness::with_config(FqdnConfig {
        zombie_idle_grace_secs: 5,
        ..Default::default()
    });
    h.daemon
        .register_selector(&FqdnSelector::pattern("*"))
        .unwrap();
    let t0 = Instant::now();
    for id in 0..4u16 {
        let endpoint = h.daemon.endpoint(id);
        h.notify(
            t0,
            &endpoint,
            &a_response("cilium.io.", 30, &["192.0.2.3", "192.0.2.4"]),
        )
        .unwrap();
    }
    assert_eq!(h.identity_count(), 2);

    // Still live.
    let stats = h.daemon.gc(t0 + Duration::from_secs(10));
    assert_eq!(stats.released, 0);

    // Expired: every endpoint's entries become zombies.
    h.daemon.gc(t0 + Duration::from_secs(40));
    assert_eq!(h.daemon.zombie_count(), 8);
    assert_eq!(h.identity_count(), 2);

    // Grace elapsed: zombies die and identities are released.
    let stats = h.daemon.gc(t0 + Duration::from_secs(60));
    assert_eq!(stats.dead_zombies, 8);
    assert_eq!(h.daemon.zombie_count(), 0);
    assert!(h.allocator.reference_counts().is_empty());
    assert_eq!(h.daemon.name_manager().cache_len(), 0);
}

#[test]
fn test_unregistered_selector_zombies_die_and_release() {
    let h = TestHarness::with_config(FqdnConfig {
        zombie_idle_grace_secs: 600,
        ..Default::default()
    });
    let selector = FqdnSelector::name("cilium.io");
    h.daemon.register_selector(&selector).unwrap();
    let endpoint = h.daemon.endpoint(1);
    let t0 = Instant::now();
    h.notify(t0, &endpoint, &a_response("cilium.io.", 30, &["192.0.2.3"]))
        .unwrap();

    h.daemon.gc(t0 + Duration::from_secs(40));
    assert_eq!(h.daemon.zombie_count(), 1);

    h.daemon.name_manager().unregister_selector(&selector);
    assert!(h.allocator.reference_counts().is_empty());

    let stats = h.daemon.gc(t0 + Duration::from_secs(41));
    assert_eq!(stats.dead_zombies, 1);
    assert_eq!(h.daemon.zombie_count(), 0);
    assert!(h.allocator.reference_counts().is_empty());
}
