//! Integration tests for the active health checker with Wiremock
//!
//! Probes feed the registry; unhealthy instances stop receiving traffic.

use adaptive_gateway::domain::value_objects::HealthState;
use adaptive_gateway::infrastructure::clock::SystemClock;
use adaptive_gateway::infrastructure::health_checker::{HealthCheckConfig, HealthCheckType, HealthChecker};
use adaptive_gateway::infrastructure::registry::{BackendRegistry, RegistryConfig};
use adaptive_gateway::InstanceSpec;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn http_checker(registry: Arc<BackendRegistry>, probe_path: &str) -> HealthChecker {
    HealthChecker::new(
        HealthCheckConfig {
            interval: Duration::from_millis(50),
            timeout: Duration::from_millis(500),
            check_type: HealthCheckType::Http {
                path: probe_path.to_string(),
            },
        },
        registry,
    )
}

fn registry_with(servers: &[&MockServer]) -> Arc<BackendRegistry> {
    let registry = Arc::new(BackendRegistry::new(RegistryConfig::default(), Arc::new(SystemClock)));
    for server in servers {
        registry.add_instance("api", &InstanceSpec::new("127.0.0.1", server.address().port(), 1));
    }
    registry
}

#[tokio::test]
async fn test_http_probe_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry_with(&[&server]);
    let checker = http_checker(registry.clone(), "/healthz");
    let instance = registry.all_instances().remove(0);

    let result = checker.check_instance(&instance).await;
    assert!(result.is_success());
}

#[tokio::test]
async fn test_http_probe_server_error_is_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let registry = registry_with(&[&server]);
    let checker = http_checker(registry.clone(), "/healthz");
    let instance = registry.all_instances().remove(0);

    assert!(!checker.check_instance(&instance).await.is_success());
}

#[tokio::test]
async fn test_slow_probe_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/healthz"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let registry = registry_with(&[&server]);
    let checker = http_checker(registry.clone(), "/healthz");
    let instance = registry.all_instances().remove(0);

    assert!(!checker.check_instance(&instance).await.is_success());
}

#[tokio::test]
async fn test_failing_instance_leaves_rotation_and_returns() {
    let good = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&good)
        .await;
    let flaky = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&flaky)
        .await;

    let registry = registry_with(&[&good, &flaky]);
    let checker = http_checker(registry.clone(), "/healthz");
    let flaky_address = format!("127.0.0.1:{}", flaky.address().port());
    let flaky_instance = registry.pool("api").unwrap().find(&flaky_address).unwrap().clone();

    // Three failed probes cross the unhealthy threshold.
    for _ in 0..3 {
        assert_eq!(checker.run_once().await, 2);
    }
    assert_eq!(flaky_instance.health(), HealthState::Unhealthy);
    for _ in 0..6 {
        assert_ne!(registry.select("api", None, &[]).unwrap().address(), flaky_address);
    }

    flaky.reset().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&flaky)
        .await;

    // Two passing probes bring it back.
    checker.run_once().await;
    checker.run_once().await;
    assert_eq!(flaky_instance.health(), HealthState::Healthy);
}

#[tokio::test]
async fn test_tcp_probe_against_closed_port() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let registry = Arc::new(BackendRegistry::new(RegistryConfig::default(), Arc::new(SystemClock)));
    registry.add_instance("api", &InstanceSpec::new("127.0.0.1", port, 1));
    let checker = HealthChecker::new(HealthCheckConfig::default(), registry.clone());
    let instance = registry.all_instances().remove(0);

    assert!(!checker.check_instance(&instance).await.is_success());
}

#[tokio::test]
async fn test_loop_stops_on_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let registry = registry_with(&[&server]);
    let checker = http_checker(registry, "/healthz");
    let (tx, rx) = tokio::sync::broadcast::channel(1);

    let handle = checker.start(rx);
    tokio::time::sleep(Duration::from_millis(120)).await;
    tx.send(()).unwrap();

    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    assert!(server.received_requests().await.unwrap().len() >= 2);
}
