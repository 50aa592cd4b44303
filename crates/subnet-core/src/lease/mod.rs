// # Lease & Event Model
//
// Plain data describing a subnet grant and its lifecycle events.
//
// A lease carries an IPv4 subnet, an IPv6 subnet, or both (dual-stack),
// plus backend attributes that are opaque to this crate. Registries
// report changes to leases as `Added`/`Removed` events, grouped into
// `LeaseWatchResult`s that are either an incremental delta or a full
// snapshot used to resync after the watcher fell behind.

pub mod key;
pub mod watcher;

pub use key::{make_subnet_key, parse_subnet_key};
pub use watcher::{LeaseWatcher, leases_match};

use chrono::{DateTime, Utc};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Backend-specific attributes attached to a lease
///
/// This is the value stored under a subnet key, so the serialized field
/// names follow the layout existing stores already hold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseAttrs {
    /// Public IPv4 address of the node owning the lease
    #[serde(rename = "PublicIP")]
    pub public_ip: Ipv4Addr,

    /// Public IPv6 address, when the node has one
    #[serde(rename = "PublicIPv6", default, skip_serializing_if = "Option::is_none")]
    pub public_ipv6: Option<Ipv6Addr>,

    /// Backend that owns this lease (vxlan, wireguard, host-gw, udp, ...)
    #[serde(rename = "BackendType", default, skip_serializing_if = "String::is_empty")]
    pub backend_type: String,

    /// Opaque backend data for the IPv4 side
    #[serde(rename = "BackendData", default, skip_serializing_if = "Option::is_none")]
    pub backend_data: Option<serde_json::Value>,

    /// Opaque backend data for the IPv6 side
    #[serde(rename = "BackendV6Data", default, skip_serializing_if = "Option::is_none")]
    pub backend_v6_data: Option<serde_json::Value>,
}

impl LeaseAttrs {
    /// Create attributes for a node identified by its public IPv4 address
    pub fn new(public_ip: Ipv4Addr) -> Self {
        Self {
            public_ip,
            public_ipv6: None,
            backend_type: String::new(),
            backend_data: None,
            backend_v6_data: None,
        }
    }

    /// Set the backend type
    pub fn with_backend_type(mut self, backend_type: impl Into<String>) -> Self {
        self.backend_type = backend_type.into();
        self
    }

    /// Set the public IPv6 address
    pub fn with_public_ipv6(mut self, public_ipv6: Ipv6Addr) -> Self {
        self.public_ipv6 = Some(public_ipv6);
        self
    }
}

/// A node's exclusive claim on one or two subnets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    #[serde(rename = "EnableIPv4")]
    pub enable_ipv4: bool,

    #[serde(rename = "EnableIPv6")]
    pub enable_ipv6: bool,

    #[serde(rename = "Subnet")]
    pub subnet: Option<Ipv4Net>,

    #[serde(rename = "IPv6Subnet")]
    pub ipv6_subnet: Option<Ipv6Net>,

    #[serde(rename = "Attrs")]
    pub attrs: LeaseAttrs,

    /// `None` marks a reservation, which never expires
    #[serde(rename = "Expiration")]
    pub expiration: Option<DateTime<Utc>>,

    /// Store revision at which this lease was last modified (0 if unknown)
    #[serde(rename = "Asof", default)]
    pub asof: i64,
}

impl Lease {
    /// Build a lease for the given subnets, the way a registry reports it
    ///
    /// IPv4 is always enabled; IPv6 is enabled when an IPv6 subnet is present.
    pub fn from_subnets(subnet: Ipv4Net, ipv6_subnet: Option<Ipv6Net>, attrs: LeaseAttrs) -> Self {
        Self {
            enable_ipv4: true,
            enable_ipv6: ipv6_subnet.is_some(),
            subnet: Some(subnet),
            ipv6_subnet,
            attrs,
            expiration: None,
            asof: 0,
        }
    }

    /// Set the expiration
    pub fn with_expiration(mut self, expiration: Option<DateTime<Utc>>) -> Self {
        self.expiration = expiration;
        self
    }

    /// The store key addressing this lease, if it has an IPv4 subnet
    pub fn key(&self) -> Option<String> {
        self.subnet.map(|sn| make_subnet_key(sn, self.ipv6_subnet))
    }

    /// Whether this lease is a reservation (no expiration)
    pub fn is_reservation(&self) -> bool {
        self.expiration.is_none()
    }
}

/// Lease lifecycle event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Added,
    Removed,
}

/// A lease lifecycle event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub lease: Lease,
}

impl Event {
    pub fn added(lease: Lease) -> Self {
        Self {
            event_type: EventType::Added,
            lease,
        }
    }

    pub fn removed(lease: Lease) -> Self {
        Self {
            event_type: EventType::Removed,
            lease,
        }
    }
}

/// Opaque watch position (a store revision)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cursor(pub i64);

impl Cursor {
    /// First revision a watch resumed from this cursor should deliver
    pub fn next(self) -> Self {
        Cursor(self.0.saturating_add(1))
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Cursor {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(Cursor)
            .map_err(|e| crate::Error::invalid_input(format!("failed to parse cursor {s:?}: {e}")))
    }
}

/// One unit of watch output from a registry
///
/// Exactly one of the two shapes is produced: an incremental delta, or a
/// full listing when the watcher's position is no longer in the store's
/// history. A snapshot may legitimately be empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseWatchResult {
    /// Incremental delta
    Events { events: Vec<Event>, cursor: Cursor },

    /// Full resync
    Snapshot { leases: Vec<Lease>, cursor: Cursor },
}

impl LeaseWatchResult {
    /// Position to resume watching from
    pub fn cursor(&self) -> Cursor {
        match self {
            Self::Events { cursor, .. } | Self::Snapshot { cursor, .. } => *cursor,
        }
    }

    /// Incremental events, empty for a snapshot
    pub fn events(&self) -> &[Event] {
        match self {
            Self::Events { events, .. } => events,
            Self::Snapshot { .. } => &[],
        }
    }

    /// Snapshot leases, `None` for an incremental delta
    pub fn snapshot(&self) -> Option<&[Lease]> {
        match self {
            Self::Snapshot { leases, .. } => Some(leases),
            Self::Events { .. } => None,
        }
    }
}
