//! Single-flight request coalescing
//!
//! Concurrent callers asking for the same key share one execution. The
//! first caller leads; later callers wait on a `watch` channel for the
//! leader's result. A leader that is cancelled closes the channel without
//! a value and one of the waiters takes over with its own loader.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

type Slot<V> = Arc<watch::Sender<Option<V>>>;

/// Result of a coalesced call.
#[derive(Debug, Clone, PartialEq)]
pub struct Flight<V> {
    pub value: V,
    /// True when the value came from another caller's execution
    pub shared: bool,
}

/// Deduplicates concurrent work per key.
pub struct SingleFlight<V> {
    calls: Mutex<HashMap<String, Slot<V>>>,
    executions: AtomicU64,
    shared: AtomicU64,
}

impl<V> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            executions: AtomicU64::new(0),
            shared: AtomicU64::new(0),
        }
    }
}

/// Removes the in-flight slot when the leader finishes or is dropped.
struct LeaderGuard<'a, V> {
    calls: &'a Mutex<HashMap<String, Slot<V>>>,
    key: &'a str,
    slot: Slot<V>,
}

impl<V> Drop for LeaderGuard<'_, V> {
    fn drop(&mut self) {
        let mut calls = self.calls.lock();
        if calls.get(self.key).is_some_and(|s| Arc::ptr_eq(s, &self.slot)) {
            calls.remove(self.key);
        }
    }
}

impl<V: Clone + Send + Sync> SingleFlight<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `load` for `key` unless an execution is already in flight, in
    /// which case wait for and share its result.
    pub async fn work<F, Fut>(&self, key: &str, load: F) -> Flight<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let slot = loop {
            let waiting = {
                let mut calls = self.calls.lock();
                match calls.get(key) {
                    Some(slot) => Some(slot.subscribe()),
                    None => {
                        let slot: Slot<V> = Arc::new(watch::channel(None).0);
                        calls.insert(key.to_string(), slot.clone());
                        break slot;
                    }
                }
            };

            if let Some(mut rx) = waiting {
                if let Ok(value) = rx.wait_for(Option::is_some).await {
                    if let Some(value) = value.as_ref() {
                        self.shared.fetch_add(1, Ordering::Relaxed);
                        return Flight {
                            value: value.clone(),
                            shared: true,
                        };
                    }
                }
                tracing::debug!(key = %key, "single-flight leader gone, taking over");
            }
        };

        let guard = LeaderGuard {
            calls: &self.calls,
            key,
            slot,
        };

        self.executions.fetch_add(1, Ordering::Relaxed);
        let value = load().await;
        guard.slot.send_replace(Some(value.clone()));
        drop(guard);

        Flight { value, shared: false }
    }

    /// Number of keys with an execution in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }

    /// Loader executions started.
    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    /// Callers served from another caller's execution.
    pub fn shared_waits(&self) -> u64 {
        self.shared.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_calls_share_one_execution() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let flight = flight.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    flight
                        .work("k", || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            7
                        })
                        .await
                })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        assert!(results.iter().all(|r| r.as_ref().unwrap().value == 7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(results.iter().filter(|r| r.as_ref().unwrap().shared).count(), 9);
        assert_eq!(flight.shared_waits(), 9);
        assert_eq!(flight.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_error_is_shared() {
        let flight = Arc::new(SingleFlight::<Result<u32, String>>::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .work("k", || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err("boom".to_string())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        let waiter = flight.work("k", || async { Ok(1) }).await;
        assert!(waiter.shared);
        assert_eq!(waiter.value, Err("boom".to_string()));
        assert_eq!(leader.await.unwrap().value, Err("boom".to_string()));
    }

    #[tokio::test]
    async fn test_waiter_takes_over_from_cancelled_leader() {
        let flight = Arc::new(SingleFlight::<u32>::new());

        let leader = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .work("k", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        1
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = {
            let flight = flight.clone();
            tokio::spawn(async move { flight.work("k", || async { 2 }).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        leader.abort();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.value, 2);
        assert!(!result.shared);
        assert_eq!(flight.executions(), 2);
    }

    #[tokio::test]
    async fn test_sequential_calls_each_execute() {
        let flight = SingleFlight::<u32>::new();
        assert_eq!(flight.work("k", || async { 1 }).await.value, 1);
        assert_eq!(flight.work("k", || async { 2 }).await.value, 2);
        assert_eq!(flight.executions(), 2);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_coalesce() {
        let flight = Arc::new(SingleFlight::<u32>::new());
        let (a, b) = tokio::join!(
            flight.work("a", || async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                1
            }),
            flight.work("b", || async { 2 })
        );
        assert_eq!((a.value, b.value), (1, 2));
        assert!(!a.shared && !b.shared);
    }
}
