// # subnet-core
//
// Lease coordination core for the overlay subnet control plane.
//
// ## Architecture Overview
//
// Every node acquires an exclusive subnet ("lease") out of a shared pool,
// advertises its backend attributes, and learns every other node's lease
// so its backend can program routes and tunnels:
// - **Lease / Event**: Plain data for subnet grants and their lifecycle
// - **LeaseWatcher**: Diff engine turning snapshots and deltas into Added/Removed batches
// - **Registry**: Trait for backing store bindings (CRUD + revisioned watches)
// - **LocalManager**: Allocation under optimistic concurrency, plus renewal
// - **watch**: Store-agnostic drivers feeding the diff engine from a Manager
// - **MemoryRegistry**: In-process registry for tests and embedding
//
// ## Design Principles
//
// 1. **Store-agnostic**: The manager and drivers only see the `Registry` trait
// 2. **Single owner**: Each watch scope owns its own `LeaseWatcher`
// 3. **Random allocation**: Nodes racing at startup pick different subnets
// 4. **Clean cancellation**: Every long-lived loop observes a `CancellationToken`
//    and closes its output on the way out
// 5. **Injected time**: Expirations come from a `Clock`, never a global

pub mod config;
pub mod error;
pub mod lease;
pub mod manager;
pub mod registry;
pub mod subnet_file;
pub mod traits;
pub mod watch;

// Re-export core types for convenience
pub use config::{Config, SubnetRange};
pub use error::{Error, Result};
pub use lease::{
    Cursor, Event, EventType, Lease, LeaseAttrs, LeaseWatchResult, LeaseWatcher, leases_match,
    make_subnet_key, parse_subnet_key,
};
pub use manager::LocalManager;
pub use registry::MemoryRegistry;
pub use subnet_file::{PreviousSubnets, read_subnet_file, write_subnet_file};
pub use traits::{Clock, Manager, ManualClock, Registry, SystemClock};
