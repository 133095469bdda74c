//! Backend Registry
//!
//! Holds every backend pool and its instances. Readers load an immutable
//! [`RegistrySnapshot`] without locking; membership changes serialize on a
//! mutex and publish a whole new snapshot. Per-instance dynamic state is
//! published through its own `ArcSwap` so prober and request updates never
//! tear each other.

use crate::domain::entities::{
    CallOutcome, DiscoveryEvent, InstanceSnapshot, InstanceSpec, InstanceState, PoolSpec,
};
use crate::domain::errors::GatewayError;
use crate::domain::services::load_balancer::{Candidate, LoadBalancer, SelectionContext, SelectorState};
use crate::domain::services::{weighting, HashRing, DEFAULT_VIRTUAL_NODES};
use crate::domain::value_objects::{Algorithm, CircuitState, HealthState, InstanceId};
use crate::infrastructure::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitPermit};
use crate::infrastructure::clock::Clock;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Algorithm for pools that do not name one
    pub default_algorithm: Algorithm,
    /// Per-instance circuit breaker settings
    pub circuit: CircuitBreakerConfig,
    /// Consecutive failed probes before marking unhealthy
    pub health_failure_threshold: u32,
    /// Consecutive passing probes before marking healthy
    pub health_success_threshold: u32,
    pub min_weight_factor: f64,
    pub max_weight_factor: f64,
    /// Minimum time between weight recomputations per pool
    pub weight_adjustment_interval: Duration,
    /// Hash ring points per instance
    pub virtual_nodes: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_algorithm: Algorithm::RoundRobin,
            circuit: CircuitBreakerConfig::default(),
            health_failure_threshold: 3,
            health_success_threshold: 2,
            min_weight_factor: weighting::DEFAULT_MIN_FACTOR,
            max_weight_factor: weighting::DEFAULT_MAX_FACTOR,
            weight_adjustment_interval: Duration::from_secs(30),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
        }
    }
}

/// One addressable replica of a backend service.
#[derive(Debug)]
pub struct BackendInstance {
    id: InstanceId,
    pool: String,
    host: String,
    port: u16,
    address: String,
    weight: u32,
    state: ArcSwap<InstanceState>,
    /// Borrowed connections (in-flight requests)
    active: AtomicUsize,
    draining: AtomicBool,
    circuit: Arc<CircuitBreaker>,
}

impl BackendInstance {
    fn new(id: InstanceId, pool: &str, spec: &InstanceSpec, circuit: CircuitBreakerConfig) -> Self {
        let address = spec.address();
        Self {
            id,
            pool: pool.to_string(),
            host: spec.host.clone(),
            port: spec.port,
            circuit: Arc::new(CircuitBreaker::new(format!("{}/{}", pool, address), circuit)),
            address,
            weight: spec.weight,
            state: ArcSwap::from_pointee(InstanceState::default()),
            active: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port`
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Current dynamic state, as one consistent value.
    pub fn state(&self) -> Arc<InstanceState> {
        self.state.load_full()
    }

    /// Apply an update to the dynamic state.
    pub fn update_state<F>(&self, f: F)
    where
        F: Fn(&InstanceState) -> InstanceState,
    {
        self.state.rcu(|current| f(current.as_ref()));
    }

    pub fn circuit(&self) -> &Arc<CircuitBreaker> {
        &self.circuit
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub(crate) fn mark_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Connections currently borrowed by requests.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Track a connection handed to a request.
    pub fn connection_borrowed(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Track a borrowed connection coming back (or being destroyed).
    pub fn connection_returned(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Health as seen by the load balancer.
    pub fn health(&self) -> HealthState {
        if self.is_draining() || self.circuit.is_ejecting() {
            HealthState::Ejected
        } else if self.state.load().probe_healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let state = self.state();
        let circuit = self.circuit.metrics();
        InstanceSnapshot {
            id: self.id,
            pool: self.pool.clone(),
            address: self.address.clone(),
            weight: self.weight,
            weight_factor: state.weight_factor,
            effective_weight: self.weight as f64 * state.weight_factor,
            health: self.health(),
            circuit: circuit.state,
            consecutive_failures: circuit.failures,
            active_connections: self.active_connections(),
            avg_response_ms: state.avg_response_ms,
            success_rate: state.success_rate,
            total_requests: state.total_requests,
            failed_requests: state.failed_requests,
            draining: self.is_draining(),
        }
    }
}

impl Candidate for BackendInstance {
    fn id(&self) -> InstanceId {
        self.id
    }

    fn is_selectable(&self) -> bool {
        !self.is_draining() && self.circuit.admits(self.state.load().probe_healthy)
    }

    fn effective_weight(&self) -> f64 {
        self.weight as f64 * self.state.load().weight_factor
    }

    fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn avg_response_ms(&self) -> f64 {
        self.state.load().avg_response_ms
    }
}

/// One pool inside a snapshot.
#[derive(Debug)]
pub struct PoolView {
    pub name: String,
    pub algorithm: Algorithm,
    /// Members in registration order
    pub members: Vec<Arc<BackendInstance>>,
    ring: HashRing,
    selector: Arc<SelectorState>,
}

impl PoolView {
    fn build(
        name: &str,
        algorithm: Algorithm,
        members: Vec<Arc<BackendInstance>>,
        selector: Arc<SelectorState>,
        virtual_nodes: usize,
    ) -> Self {
        let ring = HashRing::new(members.iter().map(|m| m.address()), virtual_nodes);
        Self {
            name: name.to_string(),
            algorithm,
            members,
            ring,
            selector,
        }
    }

    pub fn find(&self, address: &str) -> Option<&Arc<BackendInstance>> {
        self.members.iter().find(|m| m.address() == address)
    }

    /// Pick an instance, skipping unselectable and excluded members.
    pub fn select(&self, client_key: Option<&str>, excluded: &[InstanceId]) -> Option<Arc<BackendInstance>> {
        LoadBalancer::select(
            self.algorithm,
            &self.members,
            &self.ring,
            &self.selector,
            SelectionContext { client_key, excluded },
        )
        .cloned()
    }
}

/// Immutable view of all pools.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub pools: HashMap<String, Arc<PoolView>>,
}

/// Admin view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub name: String,
    pub algorithm: Algorithm,
    pub instances: Vec<InstanceSnapshot>,
}

/// The backend registry.
pub struct BackendRegistry {
    config: RegistryConfig,
    snapshot: ArcSwap<RegistrySnapshot>,
    /// Serializes snapshot writers
    write_lock: Mutex<()>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl BackendRegistry {
    pub fn new(config: RegistryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    /// Create a registry populated from pool specs.
    pub fn with_pools(config: RegistryConfig, clock: Arc<dyn Clock>, pools: &[PoolSpec]) -> Self {
        let registry = Self::new(config, clock);
        registry.reconcile(pools);
        registry
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Current snapshot. Never blocks.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    pub fn pool(&self, name: &str) -> Option<Arc<PoolView>> {
        self.snapshot.load().pools.get(name).cloned()
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot.load().pools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every instance currently in the registry.
    pub fn all_instances(&self) -> Vec<Arc<BackendInstance>> {
        let snapshot = self.snapshot.load();
        let mut all: Vec<Arc<BackendInstance>> = snapshot
            .pools
            .values()
            .flat_map(|p| p.members.iter().cloned())
            .collect();
        all.sort_by_key(|i| i.id());
        all
    }

    pub fn instance(&self, id: InstanceId) -> Option<Arc<BackendInstance>> {
        self.snapshot
            .load()
            .pools
            .values()
            .flat_map(|p| p.members.iter())
            .find(|i| i.id() == id)
            .cloned()
    }

    /// Select a backend for a request.
    pub fn select(
        &self,
        pool: &str,
        client_key: Option<&str>,
        excluded: &[InstanceId],
    ) -> Result<Arc<BackendInstance>, GatewayError> {
        let view = self.pool(pool).ok_or_else(|| GatewayError::UnknownPool {
            pool: pool.to_string(),
        })?;

        view.select(client_key, excluded)
            .ok_or_else(|| GatewayError::NoHealthyBackend {
                pool: pool.to_string(),
            })
    }

    // ===== Membership =====

    fn publish<F>(&self, f: F)
    where
        F: FnOnce(&mut HashMap<String, Arc<PoolView>>),
    {
        let current = self.snapshot.load_full();
        let mut pools = current.pools.clone();
        f(&mut pools);
        self.snapshot.store(Arc::new(RegistrySnapshot { pools }));
    }

    fn rebuild(&self, old: Option<&Arc<PoolView>>, name: &str, algorithm: Algorithm, members: Vec<Arc<BackendInstance>>) -> Arc<PoolView> {
        let selector = old
            .map(|p| p.selector.clone())
            .unwrap_or_else(|| Arc::new(SelectorState::new()));
        Arc::new(PoolView::build(name, algorithm, members, selector, self.config.virtual_nodes))
    }

    fn new_instance(&self, pool: &str, spec: &InstanceSpec) -> Arc<BackendInstance> {
        let id = InstanceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Arc::new(BackendInstance::new(id, pool, spec, self.config.circuit.clone()))
    }

    /// Create an empty pool or change its algorithm.
    pub fn upsert_pool(&self, name: &str, algorithm: Option<Algorithm>) {
        let _guard = self.write_lock.lock();
        let algorithm = algorithm.unwrap_or(self.config.default_algorithm);

        self.publish(|pools| {
            let old = pools.get(name).cloned();
            if let Some(old) = &old {
                if old.algorithm == algorithm {
                    return;
                }
                tracing::info!(pool = %name, algorithm = %algorithm, "pool algorithm changed");
            } else {
                tracing::info!(pool = %name, algorithm = %algorithm, "pool created");
            }
            let members = old.as_ref().map(|p| p.members.clone()).unwrap_or_default();
            let view = self.rebuild(old.as_ref(), name, algorithm, members);
            pools.insert(name.to_string(), view);
        });
    }

    /// Add an instance to a pool, creating the pool if needed.
    ///
    /// Returns `None` when the address is already a member.
    pub fn add_instance(&self, pool: &str, spec: &InstanceSpec) -> Option<Arc<BackendInstance>> {
        let _guard = self.write_lock.lock();
        let address = spec.address();
        let mut added = None;

        self.publish(|pools| {
            let old = pools.get(pool).cloned();
            if old.as_ref().and_then(|p| p.find(&address)).is_some() {
                return;
            }

            let instance = self.new_instance(pool, spec);
            let algorithm = old
                .as_ref()
                .map(|p| p.algorithm)
                .unwrap_or(self.config.default_algorithm);
            let mut members = old.as_ref().map(|p| p.members.clone()).unwrap_or_default();
            members.push(instance.clone());

            pools.insert(pool.to_string(), self.rebuild(old.as_ref(), pool, algorithm, members));
            added = Some(instance);
        });

        if let Some(instance) = &added {
            tracing::info!(pool = %pool, address = %address, id = %instance.id(), weight = spec.weight, "instance added");
        }
        added
    }

    /// Remove an instance. It is marked draining and leaves the
    /// selection snapshot at once; its connections drain on release.
    pub fn remove_instance(&self, pool: &str, address: &str) -> Option<Arc<BackendInstance>> {
        let _guard = self.write_lock.lock();
        let mut removed = None;

        self.publish(|pools| {
            let Some(old) = pools.get(pool).cloned() else {
                return;
            };
            let Some(instance) = old.find(address).cloned() else {
                return;
            };

            instance.mark_draining();
            let members = old
                .members
                .iter()
                .filter(|m| m.id() != instance.id())
                .cloned()
                .collect();
            pools.insert(pool.to_string(), self.rebuild(Some(&old), pool, old.algorithm, members));
            removed = Some(instance);
        });

        if removed.is_some() {
            tracing::info!(pool = %pool, address = %address, "instance removed, draining");
        }
        removed
    }

    /// Drop a whole pool; its instances drain.
    pub fn remove_pool(&self, name: &str) -> bool {
        let _guard = self.write_lock.lock();
        let mut removed = false;

        self.publish(|pools| {
            if let Some(old) = pools.remove(name) {
                for member in &old.members {
                    member.mark_draining();
                }
                removed = true;
            }
        });

        if removed {
            tracing::info!(pool = %name, "pool removed");
        }
        removed
    }

    /// Apply a service discovery event.
    pub fn apply(&self, event: DiscoveryEvent) -> bool {
        match event {
            DiscoveryEvent::Added { pool, instance } => self.add_instance(&pool, &instance).is_some(),
            DiscoveryEvent::Removed { pool, address } => self.remove_instance(&pool, &address).is_some(),
        }
    }

    /// Consume discovery events from a channel until it closes.
    pub fn spawn_discovery_feed(self: &Arc<Self>, mut rx: mpsc::Receiver<DiscoveryEvent>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracing::debug!(?event, "discovery event");
                registry.apply(event);
            }
            tracing::debug!("discovery feed closed");
        })
    }

    /// Bring membership in line with a full set of pool specs.
    ///
    /// Existing instances keep their state; missing ones drain.
    pub fn reconcile(&self, specs: &[PoolSpec]) {
        for spec in specs {
            self.upsert_pool(&spec.name, spec.algorithm);
            for instance in &spec.instances {
                self.add_instance(&spec.name, instance);
            }

            if let Some(view) = self.pool(&spec.name) {
                for member in &view.members {
                    let keep = spec.instances.iter().any(|i| i.address() == member.address());
                    if !keep {
                        self.remove_instance(&spec.name, member.address());
                    }
                }
            }
        }

        for name in self.pool_names() {
            if !specs.iter().any(|s| s.name == name) {
                self.remove_pool(&name);
            }
        }
    }

    // ===== Runtime state =====

    /// Record the result of a forwarded call.
    ///
    /// Resolves the circuit permit, folds the outcome into the rolling
    /// averages and, when due, recomputes the pool's weight factors.
    pub fn complete_call(&self, instance: &Arc<BackendInstance>, permit: CircuitPermit, outcome: CallOutcome) {
        let transition = if outcome.success {
            permit.success()
        } else {
            permit.failure()
        };
        self.on_circuit_transition(instance, transition);

        instance.update_state(|state| weighting::record_outcome(state, outcome));
        self.maybe_adjust_weights(instance.pool());
    }

    /// Record a failure that happened before a permit could be used.
    pub fn record_failure(&self, instance: &Arc<BackendInstance>) {
        let transition = instance.circuit().record_failure();
        self.on_circuit_transition(instance, transition);
    }

    fn on_circuit_transition(&self, instance: &BackendInstance, transition: Option<CircuitState>) {
        if transition == Some(CircuitState::Closed) {
            Self::restore_health(instance);
        }
    }

    fn restore_health(instance: &BackendInstance) {
        instance.update_state(|state| InstanceState {
            probe_healthy: true,
            probe_failures: 0,
            ..*state
        });
    }

    /// Record a health probe. Returns the new health when a threshold was crossed.
    pub fn record_probe(&self, instance: &Arc<BackendInstance>, success: bool, latency: Duration) -> Option<HealthState> {
        let failure_threshold = self.config.health_failure_threshold.max(1);
        let success_threshold = self.config.health_success_threshold.max(1);
        let latency_ms = Some(latency.as_millis() as u64);

        let before = instance.state().probe_healthy;
        instance.update_state(|state| {
            if success {
                let successes = state.probe_successes.saturating_add(1);
                InstanceState {
                    probe_successes: successes,
                    probe_failures: 0,
                    probe_healthy: state.probe_healthy || successes >= success_threshold,
                    last_probe_latency_ms: latency_ms,
                    ..*state
                }
            } else {
                let failures = state.probe_failures.saturating_add(1);
                InstanceState {
                    probe_failures: failures,
                    probe_successes: 0,
                    probe_healthy: state.probe_healthy && failures < failure_threshold,
                    last_probe_latency_ms: latency_ms,
                    ..*state
                }
            }
        });

        if success {
            instance.circuit().record_probe_success();
        } else {
            self.record_failure(instance);
        }

        let after = instance.state().probe_healthy;
        match (before, after) {
            (false, true) => {
                tracing::info!(instance = %instance.address(), pool = %instance.pool(), "instance healthy");
                Some(HealthState::Healthy)
            }
            (true, false) => {
                tracing::warn!(instance = %instance.address(), pool = %instance.pool(), "instance unhealthy");
                Some(HealthState::Unhealthy)
            }
            _ => None,
        }
    }

    /// Recompute weight factors for a pool if the adjustment interval passed.
    pub fn maybe_adjust_weights(&self, pool: &str) -> bool {
        let Some(view) = self.pool(pool) else {
            return false;
        };

        let interval_ms = self.config.weight_adjustment_interval.as_millis() as u64;
        if !view.selector.try_begin_adjustment(self.clock.now_ms(), interval_ms) {
            return false;
        }

        let states: Vec<InstanceState> = view.members.iter().map(|m| *m.state()).collect();
        let factors = weighting::compute_factors(
            &states,
            self.config.min_weight_factor,
            self.config.max_weight_factor,
        );

        for (member, factor) in view.members.iter().zip(factors) {
            if let Some(factor) = factor {
                member.update_state(|state| InstanceState {
                    weight_factor: factor,
                    ..*state
                });
                tracing::debug!(instance = %member.address(), factor, "weight factor adjusted");
            }
        }
        true
    }

    /// Manually close an instance's circuit.
    pub fn reset_circuit(&self, id: InstanceId) -> bool {
        match self.instance(id) {
            Some(instance) => {
                instance.circuit().reset();
                Self::restore_health(&instance);
                true
            }
            None => false,
        }
    }

    // ===== Admin views =====

    pub fn pool_snapshot(&self, name: &str) -> Option<PoolSnapshot> {
        self.pool(name).map(|view| PoolSnapshot {
            name: view.name.clone(),
            algorithm: view.algorithm,
            instances: view.members.iter().map(|m| m.snapshot()).collect(),
        })
    }

    pub fn pool_snapshots(&self) -> Vec<PoolSnapshot> {
        self.pool_names()
            .iter()
            .filter_map(|name| self.pool_snapshot(name))
            .collect()
    }
}
