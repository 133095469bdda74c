//! Application Layer
//!
//! Use cases orchestrating the domain and infrastructure.

pub mod cache_warmer;
pub mod gateway_service;

pub use cache_warmer::CacheWarmer;
pub use gateway_service::{GatewayService, PipelineConfig};
