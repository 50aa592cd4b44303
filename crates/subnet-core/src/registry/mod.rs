//! Registry implementations
//!
//! - [`MemoryRegistry`]: in-process, revisioned, TTL-aware store

pub mod memory;

pub use memory::MemoryRegistry;
