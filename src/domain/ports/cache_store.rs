//! Cache Store Port
//!
//! Defines the interface for the shared (L2) response cache tier.
//! Implementations may use Redis or in-process storage.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by a cache store. Never surfaced to gateway clients.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),

    #[error("cache store timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache entry could not be decoded: {0}")]
    Codec(String),
}

/// Shared key/value store holding encoded cache envelopes.
///
/// This is an outbound port. Keys passed in are already prefixed;
/// values are opaque bytes. The store is expected to drop entries
/// once their TTL has passed.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the raw value for a key.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Store a value with a time-to-live.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a single key. Returns true if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove every key matching a glob pattern (`*` and `?`).
    async fn delete_matching(&self, pattern: &str) -> Result<u64, StoreError>;

    /// Backend name for logs and stats.
    fn name(&self) -> &'static str;
}

/// Whether a pattern contains glob metacharacters.
pub fn is_glob(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Match `text` against a glob supporting `*` (any run) and `?` (one char).
///
/// # Examples
/// ```
/// use adaptive_gateway::domain::ports::glob_matches;
///
/// assert!(glob_matches("content:GET:/content/*", "content:GET:/content/42"));
/// assert!(glob_matches("a?c", "abc"));
/// assert!(!glob_matches("a?c", "abbc"));
/// ```
pub fn glob_matches(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0, 0);
    // Position of the last `*` and the text index it was tried at
    let mut backtrack: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            backtrack = Some((pi, ti));
            pi += 1;
        } else if let Some((star, matched)) = backtrack {
            pi = star + 1;
            ti = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_literal() {
        assert!(glob_matches("abc", "abc"));
        assert!(!glob_matches("abc", "abd"));
        assert!(!glob_matches("abc", "abcd"));
    }

    #[test]
    fn test_glob_star() {
        assert!(glob_matches("*", ""));
        assert!(glob_matches("*", "anything"));
        assert!(glob_matches("users:*", "users:GET:/users/1"));
        assert!(glob_matches("*:/content/*", "content:GET:/content/42?a=1"));
        assert!(!glob_matches("users:*", "orders:GET:/orders"));
    }

    #[test]
    fn test_glob_star_backtracks() {
        assert!(glob_matches("a*b*c", "axxbyyc"));
        assert!(glob_matches("a*bc", "abcbc"));
        assert!(!glob_matches("a*bc", "abcb"));
    }

    #[test]
    fn test_glob_question_mark() {
        assert!(glob_matches("v?", "v1"));
        assert!(!glob_matches("v?", "v"));
    }

    #[test]
    fn test_is_glob() {
        assert!(is_glob("a*"));
        assert!(is_glob("a?"));
        assert!(!is_glob("content:GET:/x"));
    }
}
