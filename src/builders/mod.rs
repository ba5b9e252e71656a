//! Builders to construct acquirers from configuration.

pub mod acquirer_builder;

pub use acquirer_builder::build_acquirer;
