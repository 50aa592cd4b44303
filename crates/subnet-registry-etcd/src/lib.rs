// # etcd Registry
//
// This crate provides the etcd v3 `Registry` binding for the overlay
// subnet control plane.
//
// ## Data Layout
//
// - `<prefix>/config`: network config JSON
// - `<prefix>/subnets/<subnet key>`: `LeaseAttrs` JSON, attached to an
//   etcd lease grant carrying the TTL (reservations have no grant)
//
// ## Architectural Constraints
//
// ### Trust Level: Trusted (Core Component)
//
// **Allowed Capabilities**:
// - ✅ gRPC calls to the configured etcd endpoints
// - ✅ Revoke lease grants it created but could not attach
// - ✅ Convert history compaction into a snapshot resync
//
// **Forbidden Capabilities**:
// - ❌ Retry allocation races (owned by `LocalManager`)
// - ❌ Diff leases (owned by `LeaseWatcher`)
// - ❌ Spawn tasks other than revoking orphaned grants
//
// ## Security Requirements
//
// - The password NEVER appears in logs
// - TLS material is read from files named in the config

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, GetOptions, Identity, PutOptions,
    TlsOptions, Txn, TxnOp, WatchOptions,
};
use ipnet::{Ipv4Net, Ipv6Net};
use subnet_core::lease::{Cursor, Event, Lease, LeaseAttrs, LeaseWatchResult};
use subnet_core::traits::{Clock, Registry, SystemClock};
use subnet_core::{Error, Result, make_subnet_key, parse_subnet_key};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default etcd endpoint
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Default key prefix
pub const DEFAULT_PREFIX: &str = "/coreos.com/network";

/// Connection settings
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,
    pub prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ENDPOINT.to_string()],
            prefix: DEFAULT_PREFIX.to_string(),
            username: None,
            password: None,
            ca_file: None,
            cert_file: None,
            key_file: None,
        }
    }
}

fn map_err(e: etcd_client::Error) -> Error {
    Error::registry(e.to_string())
}

/// Key prefix with any trailing slash removed
fn normalize_prefix(prefix: &str) -> String {
    prefix.trim_end_matches('/').to_string()
}

/// Build a lease from a stored key/value pair
///
/// `ttl` is the remaining TTL of the attached grant in seconds, `None`
/// when no grant is attached.
fn lease_from_kv(
    key: &str,
    value: &[u8],
    ttl: Option<i64>,
    mod_revision: i64,
    now: DateTime<Utc>,
) -> Result<Lease> {
    let (sn, sn6) =
        parse_subnet_key(key).ok_or_else(|| Error::invalid_input(format!("not a subnet key: {key}")))?;
    let attrs: LeaseAttrs = serde_json::from_slice(value)?;

    let mut lease = Lease::from_subnets(sn, sn6, attrs)
        .with_expiration(ttl.map(|secs| now + TimeDelta::seconds(secs)));
    lease.asof = mod_revision;
    Ok(lease)
}

/// Build the `Removed` event for a deleted key
///
/// Deletes carry no value, so the lease only identifies its subnets.
fn removed_from_key(key: &str, mod_revision: i64) -> Result<Event> {
    let (sn, sn6) =
        parse_subnet_key(key).ok_or_else(|| Error::invalid_input(format!("not a subnet key: {key}")))?;
    let mut lease = Lease::from_subnets(sn, sn6, LeaseAttrs::new(Ipv4Addr::UNSPECIFIED));
    lease.asof = mod_revision;
    Ok(Event::removed(lease))
}

/// Outcome of the create transaction's `version == 0` guard
fn created(succeeded: bool, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> Result<()> {
    if succeeded {
        Ok(())
    } else {
        Err(Error::already_exists(make_subnet_key(sn, sn6)))
    }
}

/// What to do with one watch response
#[derive(Debug, PartialEq, Eq)]
enum WatchStep {
    /// History was compacted past our position; resync from a snapshot
    Resync { compact_revision: i64 },
    /// Deliver the response's events, stamped with `revision`
    Deliver { revision: i64 },
}

fn watch_step(
    compact_revision: i64,
    canceled: bool,
    cancel_reason: &str,
    header_revision: Option<i64>,
    next: Cursor,
) -> Result<WatchStep> {
    if compact_revision > 0 {
        return Ok(WatchStep::Resync { compact_revision });
    }
    if canceled {
        return Err(Error::registry(format!("etcd canceled the watch: {cancel_reason}")));
    }
    Ok(WatchStep::Deliver {
        revision: header_revision.unwrap_or(next.0),
    })
}

/// Revokes a lease grant on drop unless disarmed
struct GrantGuard {
    client: Client,
    id: i64,
    disarmed: bool,
}

impl GrantGuard {
    fn new(client: Client, id: i64) -> Self {
        Self {
            client,
            id,
            disarmed: false,
        }
    }

    fn disarm(&mut self) {
        self.disarmed = true;
    }
}

impl Drop for GrantGuard {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut client = self.client.clone();
        let id = self.id;
        handle.spawn(async move {
            match client.lease_revoke(id).await {
                Ok(_) => debug!(lease_id = id, "revoked unattached lease grant"),
                Err(e) => warn!(
                    lease_id = id,
                    error = %e,
                    "failed to revoke unattached lease grant, it will expire via TTL"
                ),
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum WatchScope {
    All,
    One(Ipv4Net, Option<Ipv6Net>),
}

/// etcd v3 registry
pub struct EtcdRegistry {
    client: Client,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl EtcdRegistry {
    /// Connect to etcd
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let mut options = ConnectOptions::new();

        if let Some(user) = &config.username {
            options = options.with_user(user.clone(), config.password.clone().unwrap_or_default());
        }

        if config.ca_file.is_some() || config.cert_file.is_some() {
            let mut tls = TlsOptions::new();
            if let Some(ca) = &config.ca_file {
                let pem = tokio::fs::read(ca)
                    .await
                    .map_err(|e| Error::config(format!("failed to read CA file {}: {e}", ca.display())))?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }
            if let (Some(cert), Some(key)) = (&config.cert_file, &config.key_file) {
                let cert = tokio::fs::read(cert)
                    .await
                    .map_err(|e| Error::config(format!("failed to read cert file {}: {e}", cert.display())))?;
                let key = tokio::fs::read(key)
                    .await
                    .map_err(|e| Error::config(format!("failed to read key file {}: {e}", key.display())))?;
                tls = tls.identity(Identity::from_pem(cert, key));
            }
            options = options.with_tls(tls);
        }

        info!(endpoints = ?config.endpoints, prefix = %config.prefix, "connecting to etcd");
        let client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(map_err)?;

        Ok(Self::from_client(client, &config.prefix))
    }

    /// Wrap an existing client
    pub fn from_client(client: Client, prefix: &str) -> Self {
        Self {
            client,
            prefix: normalize_prefix(prefix),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used to turn TTLs into expirations
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn config_key(&self) -> String {
        format!("{}/config", self.prefix)
    }

    fn subnets_prefix(&self) -> String {
        format!("{}/subnets/", self.prefix)
    }

    fn subnet_key(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> String {
        format!("{}{}", self.subnets_prefix(), make_subnet_key(sn, sn6))
    }

    fn scope_key(&self, scope: WatchScope) -> String {
        match scope {
            WatchScope::All => self.subnets_prefix(),
            WatchScope::One(sn, sn6) => self.subnet_key(sn, sn6),
        }
    }

    fn expiration(&self, ttl: i64) -> Option<DateTime<Utc>> {
        Some(self.clock.now() + TimeDelta::seconds(ttl))
    }

    /// Remaining TTL of a grant, `None` when no grant is attached
    async fn grant_ttl(&self, lease_id: i64) -> Result<Option<i64>> {
        if lease_id == 0 {
            return Ok(None);
        }
        let resp = self
            .client
            .clone()
            .lease_time_to_live(lease_id, None)
            .await
            .map_err(map_err)?;
        Ok(Some(resp.ttl()))
    }

    async fn kv_to_lease(&self, kv: &etcd_client::KeyValue) -> Result<Lease> {
        let key = kv.key_str().map_err(map_err)?;
        let ttl = self.grant_ttl(kv.lease()).await?;
        lease_from_kv(key, kv.value(), ttl, kv.mod_revision(), self.clock.now())
    }

    /// List leases under `key`, skipping malformed entries
    async fn list(&self, key: String, prefix: bool) -> Result<(Vec<Lease>, Cursor)> {
        let options = prefix.then(|| GetOptions::new().with_prefix());
        let resp = self.client.clone().get(key, options).await.map_err(map_err)?;
        let cursor = Cursor(resp.header().map(|h| h.revision()).unwrap_or_default());

        let mut leases = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match self.kv_to_lease(kv).await {
                Ok(lease) => leases.push(lease),
                Err(e) => warn!(
                    key = kv.key_str().unwrap_or("<non-utf8>"),
                    "ignoring malformed subnet entry: {}", e
                ),
            }
        }
        Ok((leases, cursor))
    }

    async fn snapshot(&self, scope: WatchScope) -> Result<LeaseWatchResult> {
        let (leases, cursor) = match scope {
            WatchScope::All => self.list(self.subnets_prefix(), true).await?,
            WatchScope::One(..) => self.list(self.scope_key(scope), false).await?,
        };
        Ok(LeaseWatchResult::Snapshot { leases, cursor })
    }

    async fn parse_watch_event(&self, event: &etcd_client::Event) -> Result<Event> {
        let kv = event
            .kv()
            .ok_or_else(|| Error::registry("watch event without a key"))?;
        let key = kv.key_str().map_err(map_err)?;

        match event.event_type() {
            etcd_client::EventType::Delete => removed_from_key(key, kv.mod_revision()),
            etcd_client::EventType::Put => {
                let ttl = self.grant_ttl(kv.lease()).await?;
                let lease = lease_from_kv(key, kv.value(), ttl, kv.mod_revision(), self.clock.now())?;
                Ok(Event::added(lease))
            }
        }
    }

    /// Send a batch unless cancelled; false means stop watching
    async fn deliver(
        tx: &mpsc::Sender<Vec<LeaseWatchResult>>,
        batch: Vec<LeaseWatchResult>,
        cancel: &CancellationToken,
    ) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            sent = tx.send(batch) => sent.is_ok(),
        }
    }

    async fn run_watch(
        &self,
        scope: WatchScope,
        since: Cursor,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = self.scope_key(scope);
        let mut next = since;

        loop {
            debug!(key = %key, revision = next.0, "starting etcd watch");
            let mut options = WatchOptions::new().with_start_revision(next.0);
            if matches!(scope, WatchScope::All) {
                options = options.with_prefix();
            }
            let (mut watcher, mut stream) = self
                .client
                .clone()
                .watch(key.as_str(), Some(options))
                .await
                .map_err(map_err)?;

            let restart = loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => None,
                    _ = tx.closed() => None,
                    msg = stream.message() => Some(msg),
                };
                let Some(msg) = msg else {
                    let _ = watcher.cancel().await;
                    return Ok(());
                };

                let resp = match msg {
                    Ok(Some(resp)) => resp,
                    Ok(None) => return Err(Error::WatchClosed),
                    Err(e) => return Err(map_err(e)),
                };

                let header_revision = resp.header().map(|h| h.revision());
                let revision = match watch_step(
                    resp.compact_revision(),
                    resp.canceled(),
                    resp.cancel_reason(),
                    header_revision,
                    next,
                )? {
                    WatchStep::Resync { compact_revision } => {
                        warn!(
                            since = next.0,
                            compact_revision,
                            "watch position is outside the etcd history window, resyncing"
                        );
                        break true;
                    }
                    WatchStep::Deliver { revision } => revision,
                };

                let mut batch = Vec::with_capacity(resp.events().len());
                for event in resp.events() {
                    match self.parse_watch_event(event).await {
                        Ok(event) => batch.push(LeaseWatchResult::Events {
                            events: vec![event],
                            cursor: Cursor(revision),
                        }),
                        Err(e) => warn!("ignoring etcd watch event: {}", e),
                    }
                }
                next = Cursor(revision).next();

                if !batch.is_empty() && !Self::deliver(&tx, batch, cancel).await {
                    break false;
                }
            };

            let _ = watcher.cancel().await;
            if !restart {
                return Ok(());
            }

            let reset = self.snapshot(scope).await?;
            next = reset.cursor().next();
            if !Self::deliver(&tx, vec![reset], cancel).await {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn get_network_config(&self) -> Result<String> {
        let resp = self
            .client
            .clone()
            .get(self.config_key(), None)
            .await
            .map_err(map_err)?;
        let kv = resp.kvs().first().ok_or(Error::ConfigNotFound)?;
        Ok(kv.value_str().map_err(map_err)?.to_string())
    }

    async fn get_subnets(&self) -> Result<(Vec<Lease>, Cursor)> {
        self.list(self.subnets_prefix(), true).await
    }

    async fn get_subnet(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> Result<(Lease, Cursor)> {
        let key = self.subnet_key(sn, sn6);
        let resp = self.client.clone().get(key.as_str(), None).await.map_err(map_err)?;
        let cursor = Cursor(resp.header().map(|h| h.revision()).unwrap_or_default());
        let kv = resp.kvs().first().ok_or_else(|| Error::not_found(key.clone()))?;
        Ok((self.kv_to_lease(kv).await?, cursor))
    }

    async fn create_subnet(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        attrs: &LeaseAttrs,
        ttl: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let key = self.subnet_key(sn, sn6);
        let value = serde_json::to_vec(attrs)?;
        let mut client = self.client.clone();
        let absent = Compare::version(key.as_str(), CompareOp::Equal, 0);

        if ttl.is_zero() {
            let txn = Txn::new()
                .when([absent])
                .and_then([TxnOp::put(key.as_str(), value, None)]);
            let resp = client.txn(txn).await.map_err(map_err)?;
            created(resp.succeeded(), sn, sn6)?;
            return Ok(None);
        }

        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let grant = client.lease_grant(ttl_secs, None).await.map_err(map_err)?;
        let mut guard = GrantGuard::new(client.clone(), grant.id());

        let txn = Txn::new().when([absent]).and_then([TxnOp::put(
            key.as_str(),
            value,
            Some(PutOptions::new().with_lease(grant.id())),
        )]);
        let resp = client.txn(txn).await.map_err(map_err)?;
        created(resp.succeeded(), sn, sn6)?;

        guard.disarm();
        info!(key = %key, ttl = grant.ttl(), "created subnet lease");
        Ok(self.expiration(grant.ttl()))
    }

    async fn update_subnet(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        attrs: &LeaseAttrs,
        ttl: Duration,
        _asof: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        let key = self.subnet_key(sn, sn6);
        let value = serde_json::to_vec(attrs)?;
        let mut client = self.client.clone();

        if ttl.is_zero() {
            client.put(key.as_str(), value, None).await.map_err(map_err)?;
            return Ok(None);
        }

        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let grant = client.lease_grant(ttl_secs, None).await.map_err(map_err)?;
        let mut guard = GrantGuard::new(client.clone(), grant.id());

        client
            .put(
                key.as_str(),
                value,
                Some(PutOptions::new().with_lease(grant.id())),
            )
            .await
            .map_err(map_err)?;

        guard.disarm();
        debug!(key = %key, ttl = grant.ttl(), "updated subnet lease");
        Ok(self.expiration(grant.ttl()))
    }

    async fn delete_subnet(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> Result<()> {
        let key = self.subnet_key(sn, sn6);
        self.client
            .clone()
            .delete(key.as_str(), None)
            .await
            .map_err(map_err)?;
        info!(key = %key, "deleted subnet lease");
        Ok(())
    }

    async fn leases_watch_reset(&self) -> Result<LeaseWatchResult> {
        self.snapshot(WatchScope::All).await
    }

    async fn watch_subnets(
        &self,
        since: Cursor,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run_watch(WatchScope::All, since, tx, cancel).await
    }

    async fn watch_subnet(
        &self,
        since: Cursor,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run_watch(WatchScope::One(sn, sn6), since, tx, cancel)
            .await
    }
}
