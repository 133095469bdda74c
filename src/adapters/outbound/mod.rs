mod memory_cache_store;
mod prometheus_exporter;
mod redis_cache_store;

pub use memory_cache_store::MemoryCacheStore;
pub use prometheus_exporter::PrometheusExporter;
pub use redis_cache_store::RedisCacheStore;
