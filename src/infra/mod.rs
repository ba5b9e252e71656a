//! Infrastructure adapters for queue-server clients and server registries.

pub mod client;
pub mod registry;

pub use client::InMemoryCluster;
pub use registry::StaticServerRegistry;
