//! Architectural Contract Test: Subnet Allocation
//!
//! This test verifies the lease acquisition state machine against a
//! shared registry.
//!
//! Constraints verified:
//! - Fresh allocations stay inside SubnetMin..=SubnetMax and avoid leased blocks
//! - A node's previous subnet is adopted when free and compatible
//! - A lease held under the node's public IP is reused, or dropped when the pool changed
//! - Create races are retried exactly RACE_RETRIES times
//! - Concurrent acquisitions never hand out overlapping subnets
//!
//! If this test fails, nodes can collide on the overlay.

mod common;

use common::*;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use subnet_core::manager::RACE_RETRIES;
use subnet_core::{Error, LocalManager, Manager, MemoryRegistry, Registry};

const MARGIN: Duration = Duration::from_secs(3600);

fn scenario_registry() -> MemoryRegistry {
    MemoryRegistry::new(Some(SCENARIO_CONFIG.to_string()), scenario_leases())
}

#[tokio::test]
async fn fresh_allocation_stays_in_range_and_avoids_leases() {
    let registry = scenario_registry();
    let manager = LocalManager::new(Box::new(registry.clone()), None, None, MARGIN);

    let lease = manager
        .acquire_lease(&attrs([1, 2, 3, 4]))
        .await
        .expect("acquisition succeeds");

    let subnet = lease.subnet.expect("lease has an IPv4 subnet");
    assert_eq!(subnet.prefix_len(), 24);
    assert!(subnet.addr() >= "10.3.6.0".parse::<Ipv4Addr>().unwrap());
    assert!(subnet.addr() <= "10.3.25.0".parse::<Ipv4Addr>().unwrap());
    assert!(scenario_leases().iter().all(|l| l.subnet != Some(subnet)));
    assert!(lease.expiration.is_some());

    let (stored, _) = registry.get_subnet(subnet, None).await.expect("lease was created");
    assert_eq!(stored.attrs.public_ip, "1.2.3.4".parse::<Ipv4Addr>().unwrap());
}

#[tokio::test]
async fn previous_subnet_is_adopted() {
    let registry = scenario_registry();
    let manager = LocalManager::new(
        Box::new(registry),
        Some(sn("10.3.6.0/24")),
        None,
        MARGIN,
    );

    let lease = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap();
    assert_eq!(lease.subnet, Some(sn("10.3.6.0/24")));
}

#[tokio::test]
async fn occupied_previous_subnet_is_not_adopted() {
    let registry = scenario_registry();
    let manager = LocalManager::new(
        Box::new(registry),
        Some(sn("10.3.3.0/24")),
        None,
        MARGIN,
    );

    let lease = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap();
    assert_ne!(lease.subnet, Some(sn("10.3.3.0/24")));
}

#[tokio::test]
async fn lease_for_same_public_ip_is_reused() {
    let registry = scenario_registry();
    let manager = LocalManager::new(Box::new(registry.clone()), None, None, MARGIN);

    let first = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap();
    let second = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap();

    assert_eq!(first.subnet, second.subnet);
    let (leases, _) = registry.get_subnets().await.unwrap();
    assert_eq!(leases.len(), scenario_leases().len() + 1);
}

#[tokio::test]
async fn reused_reservation_stays_a_reservation() {
    let reserved = lease("10.3.9.0/24", [1, 2, 3, 4]);
    let registry = MemoryRegistry::new(Some(SCENARIO_CONFIG.to_string()), vec![reserved]);
    let manager = LocalManager::new(Box::new(registry.clone()), None, None, MARGIN);

    let lease = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap();

    assert_eq!(lease.subnet, Some(sn("10.3.9.0/24")));
    assert!(lease.is_reservation());
    let (stored, _) = registry.get_subnet(sn("10.3.9.0/24"), None).await.unwrap();
    assert!(stored.is_reservation());
}

#[tokio::test]
async fn config_change_moves_the_node() {
    let registry = scenario_registry();
    let manager = LocalManager::new(
        Box::new(registry.clone()),
        Some(sn("10.3.6.0/24")),
        None,
        MARGIN,
    );

    let first = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap();
    assert_eq!(first.subnet, Some(sn("10.3.6.0/24")));

    registry.set_config(r#"{ "Network": "10.4.0.0/16" }"#).await;
    let second = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap();

    let subnet = second.subnet.unwrap();
    assert_ne!(Some(subnet), first.subnet);
    assert!(sn("10.4.0.0/16").contains(&subnet));
    assert_ne!(subnet.addr(), "10.4.0.0".parse::<std::net::Ipv4Addr>().unwrap());

    let stale = registry.get_subnet(sn("10.3.6.0/24"), None).await;
    assert!(matches!(stale, Err(Error::NotFound(_))), "incompatible lease is deleted");
}

#[tokio::test]
async fn create_races_are_retried_exactly_ten_times() {
    let registry = ConflictRegistry::new(SCENARIO_CONFIG);
    let counters = ConflictRegistry::sharing_counters_with(&registry);
    let manager = LocalManager::new(Box::new(registry), None, None, MARGIN);

    let err = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap_err();

    assert!(matches!(err, Error::MaxRetriesExceeded { attempts } if attempts == RACE_RETRIES));
    assert_eq!(counters.create_call_count(), 10);
}

#[tokio::test]
async fn missing_config_is_reported_as_such() {
    let registry = MemoryRegistry::new(None, Vec::new());
    let manager = LocalManager::new(Box::new(registry), None, None, MARGIN);

    let err = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap_err();
    assert!(matches!(err, Error::ConfigNotFound));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn exhausted_pool_is_out_of_subnets() {
    let config = r#"{ "Network": "10.3.0.0/24", "SubnetLen": 26 }"#;
    let taken = vec![
        lease("10.3.0.64/26", [1, 1, 1, 1]),
        lease("10.3.0.128/26", [1, 1, 1, 2]),
        lease("10.3.0.192/26", [1, 1, 1, 3]),
    ];
    let registry = MemoryRegistry::new(Some(config.to_string()), taken);
    let manager = LocalManager::new(Box::new(registry), None, None, MARGIN);

    let err = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap_err();
    assert!(matches!(err, Error::OutOfSubnets));
}

#[tokio::test]
async fn dual_stack_allocation_picks_both_families() {
    let config = r#"{ "Network": "10.3.0.0/16", "EnableIPv6": true, "IPv6Network": "fc00::/48" }"#;
    let registry = MemoryRegistry::new(Some(config.to_string()), Vec::new());
    let manager = LocalManager::new(Box::new(registry.clone()), None, None, MARGIN);

    let lease = manager.acquire_lease(&attrs([1, 2, 3, 4])).await.unwrap();

    let subnet6 = lease.ipv6_subnet.expect("dual-stack lease has an IPv6 subnet");
    assert!(lease.enable_ipv6);
    assert_eq!(subnet6.prefix_len(), 64);
    assert!(sn6("fc00::/48").contains(&subnet6));

    let (stored, _) = registry
        .get_subnet(lease.subnet.unwrap(), Some(subnet6))
        .await
        .expect("stored under the dual-stack key");
    assert_eq!(stored.ipv6_subnet, Some(subnet6));
}

#[tokio::test]
async fn concurrent_nodes_never_overlap() {
    let config = r#"{ "Network": "10.3.0.0/24", "SubnetLen": 28 }"#;
    let registry = MemoryRegistry::new(Some(config.to_string()), Vec::new());

    let mut handles = Vec::new();
    for node in 1..=8u8 {
        let manager = Arc::new(LocalManager::new(Box::new(registry.clone()), None, None, MARGIN));
        handles.push(tokio::spawn(async move {
            manager.acquire_lease(&attrs([192, 168, 0, node])).await
        }));
    }

    let mut subnets = HashSet::new();
    for handle in handles {
        let lease = handle.await.unwrap().expect("each node gets a lease");
        assert!(subnets.insert(lease.subnet.unwrap()), "subnet handed out twice");
    }

    let (leases, _) = registry.get_subnets().await.unwrap();
    assert_eq!(leases.len(), 8);
    for (i, a) in leases.iter().enumerate() {
        for b in &leases[i + 1..] {
            let (a, b) = (a.subnet.unwrap(), b.subnet.unwrap());
            assert!(!a.contains(&b) && !b.contains(&a), "{a} overlaps {b}");
        }
    }
}
