//! Test doubles and common utilities for lease contract tests
//!
//! This module provides registries that count or sabotage calls, plus
//! the pool and lease fixtures shared by the contract tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use subnet_core::error::{Error, Result};
use subnet_core::{Cursor, Lease, LeaseAttrs, LeaseWatchResult, MemoryRegistry, Registry};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Pool used by the allocation scenarios
pub const SCENARIO_CONFIG: &str =
    r#"{ "Network": "10.3.0.0/16", "SubnetMin": "10.3.1.0", "SubnetMax": "10.3.25.0" }"#;

pub fn sn(s: &str) -> Ipv4Net {
    s.parse().expect("valid IPv4 CIDR")
}

pub fn sn6(s: &str) -> Ipv6Net {
    s.parse().expect("valid IPv6 CIDR")
}

pub fn attrs(public_ip: [u8; 4]) -> LeaseAttrs {
    LeaseAttrs::new(Ipv4Addr::from(public_ip)).with_backend_type("vxlan")
}

pub fn lease(subnet: &str, public_ip: [u8; 4]) -> Lease {
    Lease::from_subnets(sn(subnet), None, attrs(public_ip))
}

/// Leases 10.3.1-5.0/24 plus 10.3.31.0/24, all held by 1.1.1.1
pub fn scenario_leases() -> Vec<Lease> {
    [
        "10.3.1.0/24",
        "10.3.2.0/24",
        "10.3.3.0/24",
        "10.3.4.0/24",
        "10.3.5.0/24",
        "10.3.31.0/24",
    ]
    .into_iter()
    .map(|s| lease(s, [1, 1, 1, 1]))
    .collect()
}

/// A registry whose creates always lose the race
///
/// Everything else is served by an inner `MemoryRegistry`.
pub struct ConflictRegistry {
    inner: MemoryRegistry,
    create_calls: Arc<AtomicUsize>,
}

impl ConflictRegistry {
    pub fn new(config: &str) -> Self {
        Self {
            inner: MemoryRegistry::new(Some(config.to_string()), Vec::new()),
            create_calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn create_call_count(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            inner: other.inner.clone(),
            create_calls: Arc::clone(&other.create_calls),
        }
    }
}

/// A registry that records update calls and can be told to fail or
/// stall them
pub struct RecordingRegistry {
    inner: MemoryRegistry,
    update_calls: Arc<AtomicUsize>,
    fail_updates: Arc<AtomicBool>,
    hang_updates: Arc<AtomicBool>,
    fail_watches: Arc<AtomicBool>,
    unsupported_updates: Arc<AtomicBool>,
}

impl RecordingRegistry {
    pub fn new(inner: MemoryRegistry) -> Self {
        Self {
            inner,
            update_calls: Arc::new(AtomicUsize::new(0)),
            fail_updates: Arc::new(AtomicBool::new(false)),
            hang_updates: Arc::new(AtomicBool::new(false)),
            fail_watches: Arc::new(AtomicBool::new(false)),
            unsupported_updates: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn update_call_count(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    pub fn set_fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }

    /// Make every update wait forever, like a store that stopped answering
    pub fn set_hang_updates(&self, hang: bool) {
        self.hang_updates.store(hang, Ordering::SeqCst);
    }

    /// Answer updates like a store that cannot renew leases
    pub fn set_unsupported_updates(&self, unsupported: bool) {
        self.unsupported_updates.store(unsupported, Ordering::SeqCst);
    }

    /// Make single-lease watches fail as soon as they start
    pub fn set_fail_watches(&self, fail: bool) {
        self.fail_watches.store(fail, Ordering::SeqCst);
    }

    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            inner: other.inner.clone(),
            update_calls: Arc::clone(&other.update_calls),
            fail_updates: Arc::clone(&other.fail_updates),
            hang_updates: Arc::clone(&other.hang_updates),
            fail_watches: Arc::clone(&other.fail_watches),
            unsupported_updates: Arc::clone(&other.unsupported_updates),
        }
    }
}

#[async_trait]
impl Registry for ConflictRegistry {
    async fn get_network_config(&self) -> Result<String> {
        self.inner.get_network_config().await
    }

    async fn get_subnets(&self) -> Result<(Vec<Lease>, Cursor)> {
        self.inner.get_subnets().await
    }

    async fn get_subnet(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> Result<(Lease, Cursor)> {
        self.inner.get_subnet(sn, sn6).await
    }

    async fn delete_subnet(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> Result<()> {
        self.inner.delete_subnet(sn, sn6).await
    }

    async fn watch_subnets(
        &self,
        since: Cursor,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.watch_subnets(since, tx, cancel).await
    }

    async fn watch_subnet(
        &self,
        since: Cursor,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.watch_subnet(since, sn, sn6, tx, cancel).await
    }

    async fn create_subnet(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        _attrs: &LeaseAttrs,
        _ttl: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::already_exists(subnet_core::make_subnet_key(sn, sn6)))
    }

    async fn update_subnet(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        attrs: &LeaseAttrs,
        ttl: Duration,
        asof: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.update_subnet(sn, sn6, attrs, ttl, asof).await
    }
}

#[async_trait]
impl Registry for RecordingRegistry {
    async fn get_network_config(&self) -> Result<String> {
        self.inner.get_network_config().await
    }

    async fn get_subnets(&self) -> Result<(Vec<Lease>, Cursor)> {
        self.inner.get_subnets().await
    }

    async fn get_subnet(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> Result<(Lease, Cursor)> {
        self.inner.get_subnet(sn, sn6).await
    }

    async fn delete_subnet(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> Result<()> {
        self.inner.delete_subnet(sn, sn6).await
    }

    async fn watch_subnets(
        &self,
        since: Cursor,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.inner.watch_subnets(since, tx, cancel).await
    }

    async fn watch_subnet(
        &self,
        since: Cursor,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.fail_watches.load(Ordering::SeqCst) {
            return Err(Error::registry("injected watch failure"));
        }
        self.inner.watch_subnet(since, sn, sn6, tx, cancel).await
    }

    async fn create_subnet(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        attrs: &LeaseAttrs,
        ttl: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        self.inner.create_subnet(sn, sn6, attrs, ttl).await
    }

    async fn update_subnet(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        attrs: &LeaseAttrs,
        ttl: Duration,
        asof: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_updates.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.unsupported_updates.load(Ordering::SeqCst) {
            return Err(Error::Unimplemented("update_subnet"));
        }
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(Error::registry("injected update failure"));
        }
        self.inner.update_subnet(sn, sn6, attrs, ttl, asof).await
    }
}
