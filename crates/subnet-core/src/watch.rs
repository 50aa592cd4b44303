// # Watch Drivers
//
// Store-agnostic drivers that turn a manager's raw watch stream into
// `Added`/`Removed` batches for backends.
//
// Each driver runs two halves concurrently in the caller's task: the
// manager's watch pushes `LeaseWatchResult`s into an internal queue, and
// a consumer feeds them through its own `LeaseWatcher` and forwards the
// resulting batches. When the manager's watch returns (cancellation or a
// fatal store error) the internal queue closes, the consumer drains it
// and drops `receiver`, so downstream consumers always see end-of-stream.
//
// ## Usage
//
// ```rust
// use subnet_core::watch;
// use tokio::sync::mpsc;
// use tokio_util::sync::CancellationToken;
//
// let (tx, mut rx) = mpsc::channel(16);
// let cancel = CancellationToken::new();
// tokio::spawn(async move {
//     while let Some(batch) = rx.recv().await {
//         for event in batch {
//             println!("{:?} {:?}", event.event_type, event.lease.subnet);
//         }
//     }
// });
// watch::watch_leases(&manager, Some(own_lease), tx, cancel).await?;
// ```

use ipnet::{Ipv4Net, Ipv6Net};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::Result;
use crate::lease::{Event, EventType, Lease, LeaseWatchResult, LeaseWatcher};
use crate::traits::Manager;

/// Capacity of the queue between a manager's watch and its consumer
pub const WATCH_CHANNEL_CAPACITY: usize = 100;

fn log_batch(batch: &[Event]) {
    for (i, event) in batch.iter().enumerate() {
        debug!(
            index = i,
            kind = ?event.event_type,
            subnet = ?event.lease.subnet,
            ipv6_subnet = ?event.lease.ipv6_subnet,
            "lease event"
        );
    }
}

/// Follow every lease except `own_lease`
///
/// Returns `Ok(())` once `cancel` fires or `receiver` is dropped, and the
/// manager's error if its watch fails. `receiver` is closed either way.
pub async fn watch_leases<M: Manager + ?Sized>(
    manager: &M,
    own_lease: Option<Lease>,
    receiver: mpsc::Sender<Vec<Event>>,
    cancel: CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Vec<LeaseWatchResult>>(WATCH_CHANNEL_CAPACITY);

    let producer = async {
        let res = manager.watch_leases(tx, &cancel).await;
        if let Err(e) = &res {
            error!("could not watch leases: {}", e);
        }
        res
    };

    let consumer = async move {
        let mut watcher = LeaseWatcher::new(own_lease);
        while let Some(results) = rx.recv().await {
            for result in results {
                let batch = match &result {
                    LeaseWatchResult::Snapshot { leases, .. } => watcher.reset(leases),
                    LeaseWatchResult::Events { events, .. } => watcher.update(events),
                };
                if batch.is_empty() {
                    continue;
                }
                log_batch(&batch);
                if receiver.send(batch).await.is_err() {
                    debug!("lease event receiver dropped");
                    return;
                }
            }
        }
    };

    let (res, ()) = tokio::join!(producer, consumer);
    res
}

/// Follow a single lease
///
/// Emits `Added` whenever the lease is written (including TTL refreshes
/// and the initial state) and `Removed` when it disappears. Termination
/// rules are the same as [`watch_leases`].
pub async fn watch_lease<M: Manager + ?Sized>(
    manager: &M,
    sn: Ipv4Net,
    sn6: Option<Ipv6Net>,
    receiver: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<Vec<LeaseWatchResult>>(WATCH_CHANNEL_CAPACITY);

    let producer = async {
        let res = manager.watch_lease(sn, sn6, tx, &cancel).await;
        if let Err(e) = &res {
            error!(subnet = %sn, "could not watch lease: {}", e);
        }
        res
    };

    let consumer = async move {
        let mut watcher = LeaseWatcher::new(None);
        while let Some(results) = rx.recv().await {
            for result in results {
                let batch = match &result {
                    LeaseWatchResult::Snapshot { leases, .. } => {
                        let mut batch = watcher.reset(leases);
                        // A resync of a lease we already know still carries
                        // its current expiration.
                        if !batch.iter().any(|e| e.event_type == EventType::Added)
                            && let Some(lease) = leases.first()
                        {
                            batch.push(Event::added(lease.clone()));
                        }
                        batch
                    }
                    LeaseWatchResult::Events { events, .. } => watcher.update(events),
                };
                for event in batch {
                    if receiver.send(event).await.is_err() {
                        debug!("lease event receiver dropped");
                        return;
                    }
                }
            }
        }
    };

    let (res, ()) = tokio::join!(producer, consumer);
    res
}
