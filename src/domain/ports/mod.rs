mod cache_store;
mod request_metrics;

pub use cache_store::{glob_matches, is_glob, CacheStore, StoreError};
pub use request_metrics::RequestMetrics;
