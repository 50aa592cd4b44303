// # Registry Trait
//
// Defines the interface to a backing coordination store.
//
// ## Purpose
//
// A registry is the single source of truth for the network config and for
// every node's lease. It exposes plain CRUD over leases plus two watch
// primitives (all leases, one lease) that deliver either incremental
// events or, when the requested position is no longer in the store's
// history, a full snapshot to resync from.
//
// ## Implementations
//
// - `MemoryRegistry`: in-process store for tests and embedding
// - `EtcdRegistry` (subnet-registry-etcd crate): etcd v3
//
// ## Usage
//
// ```rust
// use subnet_core::{Registry, Cursor};
// use tokio::sync::mpsc;
// use tokio_util::sync::CancellationToken;
//
// async fn follow(registry: &dyn Registry) -> subnet_core::Result<()> {
//     let reset = registry.leases_watch_reset().await?;
//     let (tx, mut rx) = mpsc::channel(16);
//     let cancel = CancellationToken::new();
//
//     tokio::spawn(async move {
//         while let Some(batch) = rx.recv().await {
//             println!("{} results", batch.len());
//         }
//     });
//
//     registry.watch_subnets(reset.cursor().next(), tx, &cancel).await
// }
// ```

use crate::lease::{Cursor, Lease, LeaseAttrs, LeaseWatchResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Trait for store bindings
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks.
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - ✅ Perform network or in-process I/O against the backing store
/// - ✅ Map store-native TTLs and revisions onto expirations and cursors
/// - ✅ Convert history compaction into a snapshot resync
/// - ✅ Skip (and log) malformed store entries
///
/// ## Forbidden Capabilities
/// - ❌ Choose subnets (owned by `LocalManager`)
/// - ❌ Retry allocation races (owned by `LocalManager`)
/// - ❌ Diff leases against a known set (owned by `LeaseWatcher`)
/// - ❌ Hide "config not found" behind a generic error
#[async_trait]
pub trait Registry: Send + Sync {
    /// Read the raw network config JSON
    ///
    /// # Returns
    ///
    /// - `Ok(String)`: The stored config document
    /// - `Err(Error::ConfigNotFound)`: The store holds no config
    /// - `Err(Error)`: Store error
    async fn get_network_config(&self) -> crate::Result<String>;

    /// List every lease together with the store position of the listing
    async fn get_subnets(&self) -> crate::Result<(Vec<Lease>, Cursor)>;

    /// Fetch one lease
    ///
    /// # Returns
    ///
    /// - `Ok((Lease, Cursor))`: The lease and the store position
    /// - `Err(Error::NotFound)`: No lease under that key
    /// - `Err(Error)`: Store error
    async fn get_subnet(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> crate::Result<(Lease, Cursor)>;

    /// Create a lease that must not already exist
    ///
    /// # Parameters
    ///
    /// - `sn`, `sn6`: The subnets to claim
    /// - `attrs`: Attributes stored with the lease
    /// - `ttl`: Time to live; zero creates a reservation
    ///
    /// # Returns
    ///
    /// - `Ok(Some(expiration))`: Created with a TTL
    /// - `Ok(None)`: Created as a reservation
    /// - `Err(Error::AlreadyExists)`: Another node holds the key
    /// - `Err(Error)`: Store error
    async fn create_subnet(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        attrs: &LeaseAttrs,
        ttl: Duration,
    ) -> crate::Result<Option<DateTime<Utc>>>;

    /// Write a lease unconditionally, refreshing its TTL
    ///
    /// `asof` is the revision the caller last observed; stores without
    /// conditional writes ignore it.
    async fn update_subnet(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        attrs: &LeaseAttrs,
        ttl: Duration,
        asof: i64,
    ) -> crate::Result<Option<DateTime<Utc>>>;

    /// Delete a lease; deleting an absent lease succeeds
    async fn delete_subnet(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> crate::Result<()>;

    /// Full listing as a snapshot watch result
    async fn leases_watch_reset(&self) -> crate::Result<LeaseWatchResult> {
        let (leases, cursor) = self.get_subnets().await?;
        Ok(LeaseWatchResult::Snapshot { leases, cursor })
    }

    /// Stream changes to every lease, starting at revision `since`
    ///
    /// Runs until `cancel` fires or the receiver is dropped (both return
    /// `Ok`), or until an unrecoverable store error (returned as `Err`).
    /// Dropping `tx` on return closes the receiver's queue.
    async fn watch_subnets(
        &self,
        since: Cursor,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;

    /// Stream changes to one lease, starting at revision `since`
    ///
    /// Same termination rules as [`Registry::watch_subnets`]. A resync
    /// snapshot holds the lease, or nothing if it no longer exists.
    async fn watch_subnet(
        &self,
        since: Cursor,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;
}
