// # Manager Trait
//
// Defines the interface backends use to obtain and follow leases.
//
// ## Purpose
//
// A manager sits between the backends and a registry: it hands out the
// node's own lease, keeps it alive, and exposes raw watch streams that
// the watch drivers in `crate::watch` turn into `Added`/`Removed`
// batches.
//
// ## Usage
//
// ```rust
// use subnet_core::{LeaseAttrs, Manager};
// use tokio_util::sync::CancellationToken;
//
// async fn run(manager: &dyn Manager, attrs: LeaseAttrs) -> subnet_core::Result<()> {
//     let lease = manager.acquire_lease(&attrs).await?;
//     let cancel = CancellationToken::new();
//     manager.complete_lease(lease, &cancel).await
// }
// ```

use crate::config::Config;
use crate::lease::{Lease, LeaseAttrs, LeaseWatchResult};
use async_trait::async_trait;
use ipnet::{Ipv4Net, Ipv6Net};
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Trait for lease managers
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - ✅ Allocate subnets and retry optimistic-concurrency races
/// - ✅ Renew the node's own lease on a timer
/// - ✅ Write the subnet file backends read
///
/// ## Forbidden Capabilities
/// - ❌ Program routes or tunnels (owned by backends)
/// - ❌ Talk to a store directly (goes through `Registry`)
/// - ❌ Share a `LeaseWatcher` between watch scopes
#[async_trait]
pub trait Manager: Send + Sync {
    /// Fetch, parse and validate the network config
    ///
    /// # Returns
    ///
    /// - `Ok(Config)`: Checked config with derived defaults filled in
    /// - `Err(Error::ConfigNotFound)`: The cluster is not configured
    /// - `Err(Error::Config)`: The stored config is invalid
    async fn get_network_config(&self) -> crate::Result<Config>;

    /// Persist the parameters backends need to the subnet file
    async fn handle_subnet_file(
        &self,
        path: &Path,
        config: &Config,
        ip_masq: bool,
        sn: Option<Ipv4Net>,
        sn6: Option<Ipv6Net>,
        mtu: u32,
    ) -> crate::Result<()>;

    /// Obtain this node's lease
    ///
    /// # Returns
    ///
    /// - `Ok(Lease)`: The lease, reused or freshly allocated
    /// - `Err(Error::OutOfSubnets)`: The pool is exhausted
    /// - `Err(Error::MaxRetriesExceeded)`: Every attempt lost the create race
    /// - `Err(Error)`: Config or store error
    async fn acquire_lease(&self, attrs: &LeaseAttrs) -> crate::Result<Lease>;

    /// Extend the lease's TTL, updating its expiration in place
    async fn renew_lease(&self, lease: &mut Lease) -> crate::Result<()>;

    /// Raw watch of one lease; see [`crate::Registry::watch_subnet`]
    async fn watch_lease(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;

    /// Raw watch of every lease; see [`crate::Registry::watch_subnets`]
    async fn watch_leases(
        &self,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;

    /// Keep `lease` alive until cancelled
    ///
    /// # Returns
    ///
    /// - `Ok(())`: `cancel` fired
    /// - `Err(Error::LeaseRevoked)`: The lease was removed out of band
    /// - `Err(Error)`: The lease watch failed
    async fn complete_lease(&self, lease: Lease, cancel: &CancellationToken) -> crate::Result<()>;

    /// Human-readable description
    fn name(&self) -> String;
}
