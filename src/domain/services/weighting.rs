//! Adaptive Weighting
//!
//! Rolling response-time and success-rate averages per instance, and the
//! weight factors derived from them relative to the pool.

use crate::domain::entities::{CallOutcome, InstanceState};

/// Smoothing factor for the exponential moving averages.
pub const EMA_ALPHA: f64 = 0.1;

/// Default lower bound for a weight factor.
pub const DEFAULT_MIN_FACTOR: f64 = 0.1;

/// Default upper bound for a weight factor.
pub const DEFAULT_MAX_FACTOR: f64 = 2.0;

/// Fold one completed call into an instance's rolling averages.
///
/// The first latency sample seeds the response-time average.
pub fn record_outcome(state: &InstanceState, outcome: CallOutcome) -> InstanceState {
    let latency_ms = outcome.latency.as_secs_f64() * 1000.0;
    let sample = if outcome.success { 1.0 } else { 0.0 };

    let avg_response_ms = if state.total_requests == 0 || state.avg_response_ms == 0.0 {
        latency_ms
    } else {
        EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * state.avg_response_ms
    };

    InstanceState {
        avg_response_ms,
        success_rate: EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * state.success_rate,
        total_requests: state.total_requests + 1,
        failed_requests: state.failed_requests + u64::from(!outcome.success),
        ..*state
    }
}

/// Compute new weight factors for a pool.
///
/// Returns one entry per input state; `None` means the instance has no
/// traffic yet and keeps its current factor.
pub fn compute_factors(states: &[InstanceState], min_factor: f64, max_factor: f64) -> Vec<Option<f64>> {
    let with_traffic: Vec<&InstanceState> = states
        .iter()
        .filter(|s| s.total_requests > 0 && s.avg_response_ms > 0.0)
        .collect();

    if with_traffic.is_empty() {
        return vec![None; states.len()];
    }

    let n = with_traffic.len() as f64;
    let avg_rt = with_traffic.iter().map(|s| s.avg_response_ms).sum::<f64>() / n;
    let avg_sr = with_traffic.iter().map(|s| s.success_rate).sum::<f64>() / n;

    states
        .iter()
        .map(|s| {
            if s.total_requests == 0 || s.avg_response_ms <= 0.0 {
                return None;
            }
            let rt_factor = avg_rt / s.avg_response_ms.max(0.001);
            let sr_factor = s.success_rate / avg_sr.max(0.001);
            let factor = (rt_factor + sr_factor) / 2.0;
            Some(factor.clamp(min_factor, max_factor))
        })
        .collect()
}
