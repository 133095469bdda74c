//! Hot reload: a rewritten config file flows through the watcher into the
//! registry and cache without disturbing surviving instances.

use adaptive_gateway::adapters::outbound::MemoryCacheStore;
use adaptive_gateway::config::Config;
use adaptive_gateway::infrastructure::clock::SystemClock;
use adaptive_gateway::infrastructure::config_watcher::{ConfigChange, ConfigWatcher};
use adaptive_gateway::infrastructure::multi_level_cache::MultiLevelCache;
use adaptive_gateway::infrastructure::registry::BackendRegistry;
use adaptive_gateway::domain::value_objects::Algorithm;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

const INITIAL: &str = r#"{
    "cache": { "rules": [{ "pattern": "/content/.*", "ttl_secs": 300 }] },
    "pools": [
        { "name": "users", "instances": [
            { "host": "10.0.0.1", "port": 8080 },
            { "host": "10.0.0.2", "port": 8080 }
        ] }
    ]
}"#;

const UPDATED: &str = r#"{
    "cache": { "rules": [
        { "pattern": "/content/.*", "ttl_secs": 60 },
        { "pattern": "/static/.*" }
    ] },
    "pools": [
        { "name": "users", "algorithm": "least_connections", "instances": [
            { "host": "10.0.0.2", "port": 8080 },
            { "host": "10.0.0.3", "port": 8080, "weight": 3 }
        ] },
        { "name": "orders", "instances": [{ "host": "10.0.1.1", "port": 9000 }] }
    ]
}"#;

fn config_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

struct Gateway {
    registry: BackendRegistry,
    cache: MultiLevelCache,
}

impl Gateway {
    fn from_config(config: &Config) -> Self {
        let registry = BackendRegistry::with_pools(config.balancer.registry_config(), Arc::new(SystemClock), &config.pools);
        let cache = MultiLevelCache::new(
            config.cache.settings(),
            config.cache.compile_rules().unwrap(),
            Arc::new(MemoryCacheStore::new()),
            Arc::new(SystemClock),
        );
        Self { registry, cache }
    }

    fn apply(&self, config: &Config) {
        self.registry.reconcile(&config.pools);
        self.cache.replace_rules(config.cache.compile_rules().unwrap());
    }
}

#[tokio::test]
async fn test_reload_reconciles_pools_and_rules() {
    let file = config_file(INITIAL);
    let initial = Config::from_file(file.path()).unwrap();
    let gateway = Gateway::from_config(&initial);
    let watcher = ConfigWatcher::new(file.path(), initial, Duration::from_millis(20)).unwrap();

    let survivor = gateway.registry.pool("users").unwrap().find("10.0.0.2:8080").unwrap().clone();
    let leaving = gateway.registry.pool("users").unwrap().find("10.0.0.1:8080").unwrap().clone();

    std::fs::write(file.path(), UPDATED).unwrap();
    let config = match watcher.check_once().await {
        Some(ConfigChange::Reloaded(config)) => config,
        other => panic!("expected Reloaded, got {:?}", other),
    };
    gateway.apply(&config);

    let users = gateway.registry.pool("users").unwrap();
    assert_eq!(users.algorithm, Algorithm::LeastConnections);
    assert_eq!(users.members.len(), 2);
    assert_eq!(users.find("10.0.0.2:8080").unwrap().id(), survivor.id());
    assert_eq!(users.find("10.0.0.3:8080").unwrap().weight(), 3);
    assert!(users.find("10.0.0.1:8080").is_none());
    assert!(leaving.is_draining());
    assert!(gateway.registry.pool("orders").is_some());

    let get = http::Method::GET;
    assert_eq!(gateway.cache.admission_ttl(&get, "/content/a"), Some(Duration::from_secs(60)));
    assert_eq!(
        gateway.cache.admission_ttl(&get, "/static/app.js"),
        Some(gateway.cache.settings().default_ttl)
    );
}

#[tokio::test]
async fn test_rejected_reload_leaves_gateway_untouched() {
    let file = config_file(INITIAL);
    let initial = Config::from_file(file.path()).unwrap();
    let gateway = Gateway::from_config(&initial);
    let watcher = ConfigWatcher::new(file.path(), initial, Duration::from_millis(20)).unwrap();

    std::fs::write(file.path(), r#"{ "pools": [{ "name": "", "instances": [] }] }"#).unwrap();
    assert!(matches!(watcher.check_once().await, Some(ConfigChange::Rejected(_))));

    assert_eq!(watcher.current().await.pools[0].name, "users");
    assert_eq!(gateway.registry.pool("users").unwrap().members.len(), 2);
}

#[tokio::test]
async fn test_watcher_loop_publishes_changes() {
    let file = config_file(INITIAL);
    let initial = Config::from_file(file.path()).unwrap();
    let watcher = Arc::new(ConfigWatcher::new(file.path(), initial, Duration::from_millis(20)).unwrap());
    let mut changes = watcher.subscribe();
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);

    let handle = watcher.clone().start(shutdown_rx);
    std::fs::write(file.path(), UPDATED).unwrap();

    let change = tokio::time::timeout(Duration::from_secs(2), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(change, ConfigChange::Reloaded(config) if config.pools.len() == 2));

    shutdown_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}
