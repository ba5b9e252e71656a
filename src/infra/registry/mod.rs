//! Server registries.

pub mod memory;

pub use memory::StaticServerRegistry;
