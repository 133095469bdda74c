//! Adaptive Gateway Library
//!
//! This module exposes the gateway components for use in integration tests
//! and as a library.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{CacheWarmer, GatewayService, PipelineConfig};
pub use config::{load_config, Config};
pub use domain::entities::{GatewayRequest, GatewayResponse, InstanceSpec, PoolSpec, ResponseSource};
pub use domain::errors::GatewayError;
pub use domain::ports::{CacheStore, RequestMetrics};
pub use domain::services::LoadBalancer;
pub use domain::value_objects::{Algorithm, CacheKey};
pub use infrastructure::{BackendRegistry, ConnectionPool, MultiLevelCache};
