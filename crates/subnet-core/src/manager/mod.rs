// # Local Manager
//
// Lease acquisition and renewal on top of any `Registry`.
//
// ## Acquisition
//
// 1. Fetch and check the network config
// 2. Reuse a lease already held under this node's public IP if it still
//    fits the config, otherwise delete it
// 3. Adopt the subnet the node held before restarting if it is free and
//    still fits the config
// 4. Otherwise pick a random free subnet and create it
//
// A create that loses the race to another node restarts the whole
// attempt, up to `RACE_RETRIES` times.
//
// ## Renewal
//
// `complete_lease` sleeps until `expiration - renew_margin`, renews, and
// reschedules from the new expiration. Failed renewals retry after a
// fixed minute; a registry answering `Unimplemented` disables renewal.
// A concurrent single-lease watch reschedules on external refreshes and
// ends the loop with `LeaseRevoked` if the lease vanishes.

pub mod allocator;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use ipnet::{Ipv4Net, Ipv6Net};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::lease::{EventType, Lease, LeaseAttrs, LeaseWatchResult};
use crate::traits::{Clock, Manager, Registry, SystemClock};
use crate::watch::{self, WATCH_CHANNEL_CAPACITY};
use crate::{Error, Result, subnet_file};

pub use allocator::allocate_subnet;

/// Allocation attempts before giving up on create races
pub const RACE_RETRIES: usize = 10;

/// TTL of a freshly created or renewed lease
pub const SUBNET_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Delay before retrying a failed renewal
pub const RENEW_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Whether `sn` lies inside the config's IPv4 allocation range
pub fn is_subnet_config_compat(config: &Config, sn: Option<Ipv4Net>) -> bool {
    let (Some(range), Some(sn)) = (config.ipv4_range(), sn) else {
        return false;
    };
    sn.addr() >= range.min && sn.addr() <= range.max && sn.prefix_len() == range.len
}

/// Whether `sn6` fits the config's IPv6 settings
///
/// With IPv6 disabled only a lease without an IPv6 subnet fits.
pub fn is_ipv6_subnet_config_compat(config: &Config, sn6: Option<Ipv6Net>) -> bool {
    if !config.enable_ipv6 {
        return sn6.is_none();
    }
    let (Some(range), Some(sn6)) = (config.ipv6_range(), sn6) else {
        return false;
    };
    sn6.addr() >= range.min && sn6.addr() <= range.max && sn6.prefix_len() == range.len
}

/// Manager that allocates from a shared registry
pub struct LocalManager {
    registry: Box<dyn Registry>,
    previous_subnet: Option<Ipv4Net>,
    previous_ipv6_subnet: Option<Ipv6Net>,
    renew_margin: Duration,
    clock: Arc<dyn Clock>,
}

impl LocalManager {
    /// Create a manager
    ///
    /// # Parameters
    ///
    /// - `registry`: Store binding
    /// - `previous_subnet`, `previous_ipv6_subnet`: Subnets this node held
    ///   before restarting, if known
    /// - `renew_margin`: How long before expiration to renew
    pub fn new(
        registry: Box<dyn Registry>,
        previous_subnet: Option<Ipv4Net>,
        previous_ipv6_subnet: Option<Ipv6Net>,
        renew_margin: Duration,
    ) -> Self {
        Self {
            registry,
            previous_subnet,
            previous_ipv6_subnet,
            renew_margin,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used for renewal scheduling
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// One acquisition attempt; `AlreadyExists` means retry
    async fn try_acquire_lease(&self, config: &Config, attrs: &LeaseAttrs) -> Result<Lease> {
        let (leases, _) = self.registry.get_subnets().await?;

        if let Some(existing) = leases.iter().find(|l| l.attrs.public_ip == attrs.public_ip) {
            if let Some(sn) = existing.subnet
                && is_subnet_config_compat(config, existing.subnet)
                && is_ipv6_subnet_config_compat(config, existing.ipv6_subnet)
            {
                info!(subnet = %sn, ipv6_subnet = ?existing.ipv6_subnet, "found lease for current public IP, reusing");

                let ttl = if existing.is_reservation() {
                    Duration::ZERO
                } else {
                    SUBNET_TTL
                };
                let expiration = self
                    .registry
                    .update_subnet(sn, existing.ipv6_subnet, attrs, ttl, existing.asof)
                    .await?;

                return Ok(Lease {
                    attrs: attrs.clone(),
                    expiration,
                    ..existing.clone()
                });
            }

            info!(
                subnet = ?existing.subnet,
                ipv6_subnet = ?existing.ipv6_subnet,
                "found lease for current public IP but it is not compatible with the current config, deleting it"
            );
            if let Some(sn) = existing.subnet {
                self.registry.delete_subnet(sn, existing.ipv6_subnet).await?;
            }
        }

        let (sn, sn6) = match self.previous_subnet {
            Some(prev) if !leases.iter().any(|l| l.subnet == Some(prev)) => {
                if is_subnet_config_compat(config, Some(prev))
                    && is_ipv6_subnet_config_compat(config, self.previous_ipv6_subnet)
                {
                    info!(subnet = %prev, "found previously leased subnet, reusing");
                    (prev, self.previous_ipv6_subnet)
                } else {
                    error!(subnet = %prev, "found previously leased subnet but it is not compatible with the current config, ignoring");
                    allocate_subnet(config, &leases)?
                }
            }
            _ => allocate_subnet(config, &leases)?,
        };

        let expiration = self.registry.create_subnet(sn, sn6, attrs, SUBNET_TTL).await?;
        info!(subnet = %sn, ipv6_subnet = ?sn6, "allocated lease");

        Ok(Lease {
            enable_ipv4: true,
            enable_ipv6: config.enable_ipv6,
            subnet: Some(sn),
            ipv6_subnet: sn6,
            attrs: attrs.clone(),
            expiration,
            asof: 0,
        })
    }

    /// When to wake up for the next renewal; `None` for reservations
    fn renew_deadline(&self, lease: &Lease) -> Option<Instant> {
        let expiration = lease.expiration?;
        let margin = TimeDelta::from_std(self.renew_margin).unwrap_or(TimeDelta::zero());
        let wait = (expiration - margin - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        debug!(?wait, "scheduled lease renewal");
        Some(Instant::now() + wait)
    }
}

#[async_trait]
impl Manager for LocalManager {
    async fn get_network_config(&self) -> Result<Config> {
        let raw = self.registry.get_network_config().await?;
        let mut config = Config::parse(&raw)?;
        config.check()?;
        if !config.enable_ipv4 {
            return Err(Error::config("leases are keyed by their IPv4 subnet; EnableIPv4 must be set"));
        }
        Ok(config)
    }

    async fn handle_subnet_file(
        &self,
        path: &Path,
        config: &Config,
        ip_masq: bool,
        sn: Option<Ipv4Net>,
        sn6: Option<Ipv6Net>,
        mtu: u32,
    ) -> Result<()> {
        subnet_file::write_subnet_file(path, config, ip_masq, sn, sn6, mtu).await
    }

    async fn acquire_lease(&self, attrs: &LeaseAttrs) -> Result<Lease> {
        let config = self.get_network_config().await?;

        for attempt in 1..=RACE_RETRIES {
            match self.try_acquire_lease(&config, attrs).await {
                Ok(lease) => return Ok(lease),
                Err(e) if e.is_already_exists() => {
                    debug!(attempt, "subnet was taken by another node, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::MaxRetriesExceeded {
            attempts: RACE_RETRIES,
        })
    }

    async fn renew_lease(&self, lease: &mut Lease) -> Result<()> {
        let sn = lease
            .subnet
            .ok_or_else(|| Error::invalid_input("cannot renew a lease without an IPv4 subnet"))?;
        lease.expiration = self
            .registry
            .update_subnet(sn, lease.ipv6_subnet, &lease.attrs, SUBNET_TTL, lease.asof)
            .await?;
        Ok(())
    }

    async fn watch_lease(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (lease, cursor) = self.registry.get_subnet(sn, sn6).await?;
        let reset = LeaseWatchResult::Snapshot {
            leases: vec![lease],
            cursor,
        };

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sent = tx.send(vec![reset]) => if sent.is_err() {
                return Ok(());
            },
        }

        self.registry
            .watch_subnet(cursor.next(), sn, sn6, tx, cancel)
            .await
    }

    async fn watch_leases(
        &self,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let reset = self.registry.leases_watch_reset().await?;
        let next = reset.cursor().next();

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            sent = tx.send(vec![reset]) => if sent.is_err() {
                return Ok(());
            },
        }

        self.registry.watch_subnets(next, tx, cancel).await
    }

    async fn complete_lease(&self, mut lease: Lease, cancel: &CancellationToken) -> Result<()> {
        let sn = lease
            .subnet
            .ok_or_else(|| Error::invalid_input("cannot watch a lease without an IPv4 subnet"))?;

        let (tx, mut events) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let watch_cancel = cancel.child_token();
        let watch = watch::watch_lease(self, sn, lease.ipv6_subnet, tx, watch_cancel.clone());
        tokio::pin!(watch);

        let mut watch_error = None;
        let mut watch_done = false;
        let mut renewable = true;
        let mut deadline = self.renew_deadline(&lease);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),

                res = &mut watch, if !watch_done => {
                    watch_done = true;
                    watch_error = res.err();
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let renewed = tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        res = self.renew_lease(&mut lease) => res,
                    };
                    match renewed {
                        Ok(()) => {
                            info!(subnet = %sn, expiration = ?lease.expiration, "lease renewed");
                            deadline = self.renew_deadline(&lease);
                        }
                        Err(Error::Unimplemented(op)) => {
                            warn!(subnet = %sn, "registry cannot renew leases ({}), renewal disabled", op);
                            renewable = false;
                            deadline = None;
                        }
                        Err(e) => {
                            error!(subnet = %sn, "error renewing lease (trying again in 1 min): {}", e);
                            deadline = Some(Instant::now() + RENEW_RETRY_DELAY);
                        }
                    }
                }

                event = events.recv() => match event {
                    Some(event) if event.event_type == EventType::Added => {
                        lease.expiration = event.lease.expiration;
                        if renewable {
                            deadline = self.renew_deadline(&lease);
                        }
                    }
                    Some(_) => {
                        error!(subnet = %sn, "lease has been revoked, shutting down");
                        break Err(Error::LeaseRevoked);
                    }
                    None => {
                        if cancel.is_cancelled() {
                            break Ok(());
                        }
                        // The queue closes just before the driver returns its error
                        if !watch_done {
                            watch_done = true;
                            watch_error = (&mut watch).await.err();
                        }
                        warn!(subnet = %sn, "stopped monitoring lease");
                        break Err(watch_error.take().unwrap_or(Error::WatchClosed));
                    }
                },
            }
        };

        watch_cancel.cancel();
        if !watch_done {
            let _ = (&mut watch).await;
        }
        result
    }

    fn name(&self) -> String {
        match self.previous_subnet {
            Some(sn) => format!("Local Manager with Previous Subnet: {sn}"),
            None => "Local Manager with Previous Subnet: None".to_string(),
        }
    }
}
