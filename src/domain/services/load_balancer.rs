//! Load Balancer Service
//!
//! Pure domain logic for picking a backend instance out of a pool.
//! This service has NO infrastructure dependencies: instances are seen
//! through the [`Candidate`] trait, and per-pool state lives in a
//! [`SelectorState`] owned by the caller.

use crate::domain::services::hash_ring::HashRing;
use crate::domain::value_objects::{Algorithm, InstanceId};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// What the load balancer needs to know about an instance.
pub trait Candidate {
    fn id(&self) -> InstanceId;

    /// Whether the instance may receive traffic right now (health,
    /// circuit and draining already folded in).
    fn is_selectable(&self) -> bool;

    /// Static weight times the adaptive factor.
    fn effective_weight(&self) -> f64;

    fn active_connections(&self) -> usize;

    /// Rolling average response time; 0 when no data yet.
    fn avg_response_ms(&self) -> f64;
}

impl<T: Candidate + ?Sized> Candidate for Arc<T> {
    fn id(&self) -> InstanceId {
        (**self).id()
    }

    fn is_selectable(&self) -> bool {
        (**self).is_selectable()
    }

    fn effective_weight(&self) -> f64 {
        (**self).effective_weight()
    }

    fn active_connections(&self) -> usize {
        (**self).active_connections()
    }

    fn avg_response_ms(&self) -> f64 {
        (**self).avg_response_ms()
    }
}

/// Per-pool selector state. Survives registry snapshot replacement.
#[derive(Debug, Default)]
pub struct SelectorState {
    /// Round-robin cursor
    cursor: AtomicUsize,
    /// Smooth weighted round-robin current weights
    current_weights: Mutex<HashMap<InstanceId, f64>>,
    /// Last weight adjustment (ms on the caller's clock)
    last_adjustment_ms: AtomicU64,
}

impl SelectorState {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_cursor(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed)
    }

    /// Claim the right to recompute weight factors.
    ///
    /// Returns true at most once per `interval_ms`.
    pub fn try_begin_adjustment(&self, now_ms: u64, interval_ms: u64) -> bool {
        let last = self.last_adjustment_ms.load(Ordering::Acquire);
        if last != 0 && now_ms.saturating_sub(last) < interval_ms {
            return false;
        }
        self.last_adjustment_ms
            .compare_exchange(last, now_ms.max(1), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Per-request inputs to selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelectionContext<'a> {
    /// Client identity for hash-based algorithms
    pub client_key: Option<&'a str>,
    /// Instances already tried by this request
    pub excluded: &'a [InstanceId],
}

/// Load balancer service for selecting a backend instance.
///
/// Only instances that are selectable and not excluded are considered.
/// Every algorithm returns `None` when that leaves nothing.
pub struct LoadBalancer;

impl LoadBalancer {
    /// Select an instance from `members` using `algorithm`.
    ///
    /// # Arguments
    /// * `members` - All pool members in registration order
    /// * `ring` - Hash ring built over `members` (used by `IpHash`)
    /// * `state` - The pool's selector state
    /// * `ctx` - Client key and excluded instances
    pub fn select<'m, C: Candidate>(
        algorithm: Algorithm,
        members: &'m [C],
        ring: &HashRing,
        state: &SelectorState,
        ctx: SelectionContext<'_>,
    ) -> Option<&'m C> {
        let eligible = |c: &C| c.is_selectable() && !ctx.excluded.contains(&c.id());

        if algorithm == Algorithm::IpHash {
            if let Some(key) = ctx.client_key {
                return ring
                    .walk(key)
                    .filter_map(|idx| members.get(idx))
                    .find(|c| eligible(*c));
            }
        }

        let candidates: Vec<&'m C> = members.iter().filter(|c| eligible(*c)).collect();
        if candidates.is_empty() {
            return None;
        }

        let picked = match algorithm {
            Algorithm::RoundRobin => Self::round_robin(&candidates, state),
            Algorithm::WeightedRoundRobin => Self::smooth_weighted(&candidates, state),
            Algorithm::LeastConnections => {
                Self::min_by_score(&candidates, state, |c| c.active_connections() as f64)
            }
            Algorithm::WeightedLeastConnections => Self::min_by_score(&candidates, state, |c| {
                let weight = c.effective_weight();
                if weight > 0.0 {
                    c.active_connections() as f64 / weight
                } else {
                    f64::INFINITY
                }
            }),
            Algorithm::Random | Algorithm::IpHash => Self::random(&candidates),
            Algorithm::WeightedRandom => Self::weighted_random(&candidates),
            Algorithm::ResponseTime => {
                Self::min_by_score(&candidates, state, |c| c.avg_response_ms())
            }
        };

        Some(picked)
    }

    fn round_robin<'m, C: Candidate>(candidates: &[&'m C], state: &SelectorState) -> &'m C {
        candidates[state.next_cursor() % candidates.len()]
    }

    /// Smooth weighted round robin: every pick adds each candidate's weight
    /// to its running value, takes the largest, and subtracts the total from it.
    fn smooth_weighted<'m, C: Candidate>(candidates: &[&'m C], state: &SelectorState) -> &'m C {
        let total: f64 = candidates.iter().map(|c| c.effective_weight().max(0.0)).sum();
        if total <= 0.0 {
            return Self::round_robin(candidates, state);
        }

        let mut current = state.current_weights.lock();
        if current.len() > candidates.len() * 2 {
            current.retain(|id, _| candidates.iter().any(|c| c.id() == *id));
        }

        let mut best: Option<(usize, f64)> = None;
        for (i, c) in candidates.iter().enumerate() {
            let value = current.entry(c.id()).or_insert(0.0);
            *value += c.effective_weight().max(0.0);
            match best {
                Some((_, best_value)) if *value <= best_value => {}
                _ => best = Some((i, *value)),
            }
        }

        let idx = best.map(|(i, _)| i).unwrap_or(0);
        if let Some(value) = current.get_mut(&candidates[idx].id()) {
            *value -= total;
        }
        candidates[idx]
    }

    /// Lowest score wins; ties rotate through the cursor.
    fn min_by_score<'m, C, F>(candidates: &[&'m C], state: &SelectorState, score: F) -> &'m C
    where
        C: Candidate,
        F: Fn(&C) -> f64,
    {
        let n = candidates.len();
        let start = state.next_cursor() % n;

        let mut best = candidates[start];
        let mut best_score = score(best);
        for offset in 1..n {
            let c = candidates[(start + offset) % n];
            let s = score(c);
            if s < best_score {
                best = c;
                best_score = s;
            }
        }
        best
    }

    fn random<'m, C: Candidate>(candidates: &[&'m C]) -> &'m C {
        candidates[rand::thread_rng().gen_range(0..candidates.len())]
    }

    fn weighted_random<'m, C: Candidate>(candidates: &[&'m C]) -> &'m C {
        let total: f64 = candidates.iter().map(|c| c.effective_weight().max(0.0)).sum();
        if total <= 0.0 {
            return Self::random(candidates);
        }

        let mut point = rand::thread_rng().gen::<f64>() * total;
        for c in candidates {
            point -= c.effective_weight().max(0.0);
            if point < 0.0 {
                return c;
            }
        }
        candidates[candidates.len() - 1]
    }
}
