//! Lease diff engine
//!
//! Turns raw registry output into a clean stream of `Added`/`Removed`
//! events relative to the set of leases the watcher already knows about,
//! filtering out the local node's own lease.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let mut watcher = LeaseWatcher::new(Some(own_lease));
//! let batch = match &result {
//!     LeaseWatchResult::Snapshot { leases, .. } => watcher.reset(leases),
//!     LeaseWatchResult::Events { events, .. } => watcher.update(events),
//! };
//! ```
//!
//! One instance per watched scope; instances share no state.

use super::{Event, EventType, Lease};
use tracing::error;

/// True when `other` holds the same subnets as `reference`
///
/// Which subnets are compared depends on the address families enabled on
/// `reference`. A lease with neither family enabled predates dual-stack
/// support and is keyed by its IPv4 subnet.
pub fn leases_match(reference: &Lease, other: &Lease) -> bool {
    match (reference.enable_ipv4, reference.enable_ipv6) {
        (true, false) | (false, false) => reference.subnet == other.subnet,
        (false, true) => reference.ipv6_subnet == other.ipv6_subnet,
        (true, true) => {
            reference.subnet == other.subnet && reference.ipv6_subnet == other.ipv6_subnet
        }
    }
}

/// Incremental view over a set of leases
#[derive(Debug, Clone, Default)]
pub struct LeaseWatcher {
    own_lease: Option<Lease>,
    leases: Vec<Lease>,
}

impl LeaseWatcher {
    /// Create a watcher that suppresses events for `own_lease`
    pub fn new(own_lease: Option<Lease>) -> Self {
        Self {
            own_lease,
            leases: Vec::new(),
        }
    }

    /// Leases currently known to the watcher
    pub fn known_leases(&self) -> &[Lease] {
        &self.leases
    }

    fn is_own(&self, lease: &Lease) -> bool {
        self.own_lease
            .as_ref()
            .is_some_and(|own| leases_match(lease, own))
    }

    /// Resynchronize against a full snapshot
    ///
    /// Emits `Added` for every snapshot lease that was not known and
    /// `Removed` for every known lease missing from the snapshot. The own
    /// lease never produces an event. Afterwards the known set equals the
    /// snapshot, so resetting twice with the same snapshot yields nothing
    /// the second time.
    pub fn reset(&mut self, snapshot: &[Lease]) -> Vec<Event> {
        let mut batch = Vec::new();
        let mut stale = std::mem::take(&mut self.leases);

        for lease in snapshot {
            if self.is_own(lease) {
                continue;
            }

            match stale.iter().position(|known| leases_match(known, lease)) {
                Some(i) => {
                    stale.remove(i);
                }
                None => batch.push(Event::added(lease.clone())),
            }
        }

        for lease in stale {
            if !self.is_own(&lease) {
                batch.push(Event::removed(lease));
            }
        }

        self.leases = snapshot.to_vec();
        batch
    }

    /// Apply an incremental delta
    ///
    /// Events for the own lease are dropped. An `Added` for a known lease
    /// replaces it in place (an expiration refresh); a `Removed` for an
    /// unknown lease is still forwarded so consumers converge.
    pub fn update(&mut self, events: &[Event]) -> Vec<Event> {
        let mut batch = Vec::with_capacity(events.len());

        for event in events {
            if self.is_own(&event.lease) {
                continue;
            }

            batch.push(match event.event_type {
                EventType::Added => self.add(&event.lease),
                EventType::Removed => self.remove(&event.lease),
            });
        }

        batch
    }

    fn add(&mut self, lease: &Lease) -> Event {
        match self.leases.iter_mut().find(|known| leases_match(known, lease)) {
            Some(known) => *known = lease.clone(),
            None => self.leases.push(lease.clone()),
        }
        Event::added(lease.clone())
    }

    fn remove(&mut self, lease: &Lease) -> Event {
        match self.leases.iter().position(|known| leases_match(known, lease)) {
            Some(i) => Event::removed(self.leases.remove(i)),
            None => {
                error!(
                    subnet = ?lease.subnet,
                    ipv6_subnet = ?lease.ipv6_subnet,
                    "removed lease was not in the known set"
                );
                Event::removed(lease.clone())
            }
        }
    }
}
