//! Runtime adapters and API surface.

pub mod api;

#[cfg(feature = "tokio-runtime")]
pub use api::acquire_async;
pub use api::{AcquireResponse, OutcomeKind};
