// # Memory Registry
//
// In-memory implementation of Registry.
//
// ## Purpose
//
// Behaves like a revisioned, TTL-aware key/value store without any
// network: every mutation bumps a revision and is kept in an event
// history, leases with a TTL expire against an injected clock, and
// history can be compacted to exercise the snapshot resync path.
//
// ## Crash Behavior
//
// - All leases and history are lost when the registry is dropped
// - Clones share the same store
// - History is capped at `DEFAULT_HISTORY_LIMIT` events; older entries
//   are compacted away and lagging watches resync from a snapshot
//
// ## When to Use
//
// - Tests of the manager, the watch drivers and backends
// - Embedding the lease core in a single process

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use tokio::sync::{Mutex, MutexGuard, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lease::{Cursor, Event, Lease, LeaseAttrs, LeaseWatchResult, make_subnet_key};
use crate::traits::{Clock, Registry, SystemClock};
use crate::{Error, Result};

/// Events kept for watch replay before the oldest are compacted
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug)]
struct MemoryState {
    config: Option<String>,
    leases: Vec<Lease>,
    revision: i64,
    compacted: i64,
    history: Vec<(i64, Event)>,
    history_limit: usize,
}

impl MemoryState {
    fn position(&self, key: &str) -> Option<usize> {
        self.leases
            .iter()
            .position(|l| l.key().as_deref() == Some(key))
    }

    fn record(&mut self, event: Event) {
        self.history.push((self.revision, event));

        let excess = self.history.len().saturating_sub(self.history_limit);
        if excess > 0 {
            let dropped: Vec<_> = self.history.drain(..excess).collect();
            if let Some((rev, _)) = dropped.last() {
                self.compacted = self.compacted.max(*rev);
            }
        }
    }

    /// Drop leases whose expiration has passed, as a TTL store would
    fn expire(&mut self, now: DateTime<Utc>) -> bool {
        let (expired, live): (Vec<Lease>, Vec<Lease>) = std::mem::take(&mut self.leases)
            .into_iter()
            .partition(|l| l.expiration.is_some_and(|exp| exp <= now));
        self.leases = live;

        let any = !expired.is_empty();
        for mut lease in expired {
            self.revision += 1;
            lease.asof = self.revision;
            info!(subnet = ?lease.subnet, revision = self.revision, "lease expired");
            self.record(Event::removed(lease));
        }
        any
    }
}

/// In-memory registry implementation
///
/// # Example
///
/// ```rust,no_run
/// use subnet_core::{MemoryRegistry, Registry};
///
/// #[tokio::main]
/// async fn main() -> subnet_core::Result<()> {
///     let registry = MemoryRegistry::new(Some(r#"{ "Network": "10.3.0.0/16" }"#.to_string()), Vec::new());
///
///     let (leases, cursor) = registry.get_subnets().await?;
///     assert!(leases.is_empty());
///     println!("listed at revision {cursor}");
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryRegistry {
    inner: Arc<Mutex<MemoryState>>,
    revision: Arc<watch::Sender<i64>>,
    clock: Arc<dyn Clock>,
}

impl MemoryRegistry {
    /// Create a registry holding `config` and seeded with `leases`
    pub fn new(config: Option<String>, leases: Vec<Lease>) -> Self {
        Self::with_clock(config, leases, Arc::new(SystemClock))
    }

    /// Create a registry that expires leases against `clock`
    pub fn with_clock(config: Option<String>, leases: Vec<Lease>, clock: Arc<dyn Clock>) -> Self {
        let revision = 1;
        let leases = leases
            .into_iter()
            .map(|mut l| {
                l.asof = revision;
                l
            })
            .collect();

        let (tx, _) = watch::channel(revision);
        Self {
            inner: Arc::new(Mutex::new(MemoryState {
                config,
                leases,
                revision,
                compacted: 0,
                history: Vec::new(),
                history_limit: DEFAULT_HISTORY_LIMIT,
            })),
            revision: Arc::new(tx),
            clock,
        }
    }

    /// Lock the store, applying any pending TTL expiry first
    async fn state(&self) -> MutexGuard<'_, MemoryState> {
        let mut state = self.inner.lock().await;
        if state.expire(self.clock.now()) {
            self.publish(&state);
        }
        state
    }

    fn publish(&self, state: &MemoryState) {
        self.revision.send_replace(state.revision);
    }

    fn expiration(&self, ttl: Duration) -> Result<Option<DateTime<Utc>>> {
        if ttl.is_zero() {
            return Ok(None);
        }
        let ttl = TimeDelta::from_std(ttl)
            .map_err(|e| Error::invalid_input(format!("ttl out of range: {e}")))?;
        Ok(Some(self.clock.now() + ttl))
    }

    /// Keep at most `limit` events of history
    pub async fn set_history_limit(&self, limit: usize) {
        let mut state = self.inner.lock().await;
        state.history_limit = limit.max(1);
    }

    /// Replace the stored network config
    pub async fn set_config(&self, raw: impl Into<String>) {
        self.inner.lock().await.config = Some(raw.into());
    }

    /// Discard history at or below `revision`
    ///
    /// Watches resumed from a compacted position receive a snapshot.
    pub async fn compact(&self, revision: Cursor) {
        let mut state = self.inner.lock().await;
        state.compacted = state.compacted.max(revision.0);
        let watermark = state.compacted;
        state.history.retain(|(rev, _)| *rev > watermark);
        debug!(revision = watermark, "compacted history");
    }

    /// Current store revision
    pub async fn revision(&self) -> Cursor {
        Cursor(self.state().await.revision)
    }

    /// Apply TTL expiry now, returning how many leases remain
    pub async fn expire_leases(&self) -> usize {
        self.state().await.leases.len()
    }

    /// Build the output of one watch wake-up and advance `next`
    async fn poll_watch(&self, next: &mut Cursor, key: Option<&str>) -> Vec<LeaseWatchResult> {
        let state = self.state().await;
        let in_scope = |lease: &Lease| key.is_none() || lease.key().as_deref() == key;

        let results = if next.0 <= state.compacted {
            warn!(
                since = next.0,
                compacted = state.compacted,
                "watch position was compacted, resyncing from snapshot"
            );
            vec![LeaseWatchResult::Snapshot {
                leases: state.leases.iter().filter(|l| in_scope(*l)).cloned().collect(),
                cursor: Cursor(state.revision),
            }]
        } else {
            state
                .history
                .iter()
                .filter(|(rev, event)| *rev >= next.0 && in_scope(&event.lease))
                .map(|(rev, event)| LeaseWatchResult::Events {
                    events: vec![event.clone()],
                    cursor: Cursor(*rev),
                })
                .collect()
        };

        *next = Cursor(state.revision).next();
        results
    }

    async fn run_watch(
        &self,
        since: Cursor,
        key: Option<String>,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut changes = self.revision.subscribe();
        let mut next = since;

        loop {
            changes.borrow_and_update();
            let results = self.poll_watch(&mut next, key.as_deref()).await;

            if !results.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    sent = tx.send(results) => if sent.is_err() {
                        debug!("watch receiver dropped");
                        return Ok(());
                    },
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tx.closed() => {
                    debug!("watch receiver dropped");
                    return Ok(());
                }
                changed = changes.changed() => if changed.is_err() {
                    return Err(Error::WatchClosed);
                },
            }
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get_network_config(&self) -> Result<String> {
        self.inner
            .lock()
            .await
            .config
            .clone()
            .ok_or(Error::ConfigNotFound)
    }

    async fn get_subnets(&self) -> Result<(Vec<Lease>, Cursor)> {
        let state = self.state().await;
        Ok((state.leases.clone(), Cursor(state.revision)))
    }

    async fn get_subnet(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> Result<(Lease, Cursor)> {
        let key = make_subnet_key(sn, sn6);
        let state = self.state().await;
        let i = state.position(&key).ok_or_else(|| Error::not_found(key))?;
        Ok((state.leases[i].clone(), Cursor(state.revision)))
    }

    async fn create_subnet(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        attrs: &LeaseAttrs,
        ttl: Duration,
    ) -> Result<Option<DateTime<Utc>>> {
        let key = make_subnet_key(sn, sn6);
        let expiration = self.expiration(ttl)?;
        let mut state = self.state().await;

        if state.position(&key).is_some() {
            return Err(Error::already_exists(key));
        }

        state.revision += 1;
        let mut lease = Lease::from_subnets(sn, sn6, attrs.clone()).with_expiration(expiration);
        lease.asof = state.revision;

        state.leases.push(lease.clone());
        state.record(Event::added(lease));
        self.publish(&state);
        Ok(expiration)
    }

    async fn update_subnet(
        &self,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        attrs: &LeaseAttrs,
        ttl: Duration,
        _asof: i64,
    ) -> Result<Option<DateTime<Utc>>> {
        let key = make_subnet_key(sn, sn6);
        let expiration = self.expiration(ttl)?;
        let mut state = self.state().await;

        state.revision += 1;
        let mut lease = Lease::from_subnets(sn, sn6, attrs.clone()).with_expiration(expiration);
        lease.asof = state.revision;

        match state.position(&key) {
            Some(i) => state.leases[i] = lease.clone(),
            None => state.leases.push(lease.clone()),
        }
        state.record(Event::added(lease));
        self.publish(&state);
        Ok(expiration)
    }

    async fn delete_subnet(&self, sn: Ipv4Net, sn6: Option<Ipv6Net>) -> Result<()> {
        let key = make_subnet_key(sn, sn6);
        let mut state = self.state().await;

        let Some(i) = state.position(&key) else {
            return Ok(());
        };

        state.revision += 1;
        let mut lease = state.leases.remove(i);
        lease.asof = state.revision;
        state.record(Event::removed(lease));
        self.publish(&state);
        Ok(())
    }

    async fn watch_subnets(
        &self,
        since: Cursor,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run_watch(since, None, tx, cancel).await
    }

    async fn watch_subnet(
        &self,
        since: Cursor,
        sn: Ipv4Net,
        sn6: Option<Ipv6Net>,
        tx: mpsc::Sender<Vec<LeaseWatchResult>>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run_watch(since, Some(make_subnet_key(sn, sn6)), tx, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::EventType;
    use crate::traits::ManualClock;
    use std::net::Ipv4Addr;

    fn attrs() -> LeaseAttrs {
        LeaseAttrs::new(Ipv4Addr::new(1, 2, 3, 4))
    }

    fn sn(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn missing_config_is_distinct() {
        let registry = MemoryRegistry::new(None, Vec::new());
        assert!(matches!(
            registry.get_network_config().await,
            Err(Error::ConfigNotFound)
        ));

        registry.set_config(r#"{ "Network": "10.3.0.0/16" }"#).await;
        tokio_test::assert_ok!(registry.get_network_config().await);
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let registry = MemoryRegistry::new(None, Vec::new());
        let ttl = Duration::from_secs(60);

        let exp = registry
            .create_subnet(sn("10.3.1.0/24"), None, &attrs(), ttl)
            .await
            .expect("first create succeeds");
        assert!(exp.is_some());

        let err = tokio_test::assert_err!(
            registry
                .create_subnet(sn("10.3.1.0/24"), None, &attrs(), ttl)
                .await
        );
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn zero_ttl_creates_reservation() {
        let registry = MemoryRegistry::new(None, Vec::new());
        let exp = registry
            .create_subnet(sn("10.3.1.0/24"), None, &attrs(), Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(exp, None);

        let (lease, _) = registry.get_subnet(sn("10.3.1.0/24"), None).await.unwrap();
        assert!(lease.is_reservation());
    }

    #[tokio::test]
    async fn leases_expire_against_the_clock() {
        let clock = ManualClock::new(Utc::now());
        let registry = MemoryRegistry::with_clock(None, Vec::new(), Arc::new(clock.clone()));

        registry
            .create_subnet(sn("10.3.1.0/24"), None, &attrs(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(registry.expire_leases().await, 1);

        clock.advance(Duration::from_secs(61));
        assert_eq!(registry.expire_leases().await, 0);
        assert!(matches!(
            registry.get_subnet(sn("10.3.1.0/24"), None).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn watch_replays_history_then_follows() {
        let registry = MemoryRegistry::new(None, Vec::new());
        let start = registry.revision().await;
        registry
            .create_subnet(sn("10.3.1.0/24"), None, &attrs(), Duration::ZERO)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let watcher = {
            let registry = registry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { registry.watch_subnets(start.next(), tx, &cancel).await })
        };

        let first = rx.recv().await.unwrap();
        assert_eq!(first[0].events()[0].event_type, EventType::Added);

        registry.delete_subnet(sn("10.3.1.0/24"), None).await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(second[0].events()[0].event_type, EventType::Removed);

        cancel.cancel();
        watcher.await.unwrap().expect("cancelled watch is clean");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn history_is_capped() {
        let registry = MemoryRegistry::new(None, Vec::new());
        registry.set_history_limit(2).await;
        let start = registry.revision().await;

        for third in 1..=3 {
            registry
                .create_subnet(sn(&format!("10.3.{third}.0/24")), None, &attrs(), Duration::ZERO)
                .await
                .unwrap();
        }
        assert_eq!(registry.inner.lock().await.history.len(), 2);

        // The first create fell out of history, so a watch from before it resyncs
        let mut next = start.next();
        let results = registry.poll_watch(&mut next, None).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].snapshot().map(<[Lease]>::len), Some(3));

        // A watch positioned after the dropped entry still replays
        let mut next = Cursor(start.0 + 2);
        let results = registry.poll_watch(&mut next, None).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.snapshot().is_none()));
    }

    #[tokio::test]
    async fn compacted_position_yields_snapshot() {
        let registry = MemoryRegistry::new(None, Vec::new());
        let start = registry.revision().await;
        registry
            .create_subnet(sn("10.3.1.0/24"), None, &attrs(), Duration::ZERO)
            .await
            .unwrap();
        registry.compact(registry.revision().await).await;

        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = {
            let registry = registry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { registry.watch_subnets(start.next(), tx, &cancel).await })
        };

        let batch = rx.recv().await.unwrap();
        let snapshot = batch[0].snapshot().expect("resync snapshot");
        assert_eq!(snapshot.len(), 1);
        assert!(batch[0].events().is_empty());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
