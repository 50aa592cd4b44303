//! Core traits for the lease system
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`Registry`]: Backing store binding
//! - [`Manager`]: Lease acquisition, renewal and raw watches for backends
//! - [`Clock`]: Injected wall-clock time

pub mod clock;
pub mod manager;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use manager::Manager;
pub use registry::Registry;
