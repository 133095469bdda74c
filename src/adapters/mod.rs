//! Adapters
//!
//! Inbound HTTP surfaces and outbound stores/exporters.

pub mod inbound;
pub mod outbound;
