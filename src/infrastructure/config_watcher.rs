//! Configuration Hot Reload
//!
//! Polls the gateway's JSON config file and republishes the parsed,
//! validated configuration when it changes. A file that fails to parse or
//! validate is reported and the previous configuration stays active.

use crate::config::{load_config_with, Config};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

/// Configuration change event.
#[derive(Debug, Clone)]
pub enum ConfigChange {
    /// The file changed and the new configuration is now active
    Reloaded(Arc<Config>),
    /// The file changed but could not be loaded; the previous config stays
    Rejected(ConfigWatchError),
}

/// Errors that can occur during configuration watching.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigWatchError {
    #[error("file error for {0:?}: {1}")]
    FileError(PathBuf, String),

    #[error("parse error: {0}")]
    ParseError(String),
}

/// Modification fingerprint of the watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

fn stamp(path: &Path) -> Result<FileStamp, ConfigWatchError> {
    let metadata = std::fs::metadata(path).map_err(|e| ConfigWatchError::FileError(path.to_path_buf(), e.to_string()))?;
    let modified = metadata
        .modified()
        .map_err(|e| ConfigWatchError::FileError(path.to_path_buf(), e.to_string()))?;

    Ok(FileStamp {
        modified,
        len: metadata.len(),
    })
}

/// Watches one configuration file.
pub struct ConfigWatcher {
    path: PathBuf,
    last_stamp: RwLock<FileStamp>,
    current: HotValue<Arc<Config>>,
    change_tx: broadcast::Sender<ConfigChange>,
    poll_interval: Duration,
}

impl ConfigWatcher {
    /// Start watching `path`, with `initial` as the active configuration.
    pub fn new(path: impl AsRef<Path>, initial: Config, poll_interval: Duration) -> Result<Self, ConfigWatchError> {
        let path = path.as_ref().to_path_buf();
        let last_stamp = stamp(&path)?;
        let (change_tx, _) = broadcast::channel(16);

        Ok(Self {
            path,
            last_stamp: RwLock::new(last_stamp),
            current: HotValue::new("config", Arc::new(initial)),
            change_tx,
            poll_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The active configuration.
    pub async fn current(&self) -> Arc<Config> {
        self.current.get().await
    }

    /// Subscribe to configuration changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ConfigChange> {
        self.change_tx.subscribe()
    }

    /// Check the file once. Returns the change that was broadcast, if any.
    pub async fn check_once(&self) -> Option<ConfigChange> {
        let stamp = match stamp(&self.path) {
            Ok(stamp) => stamp,
            Err(e) => {
                tracing::warn!(path = ?self.path, "cannot stat config file: {}", e);
                return None;
            }
        };

        {
            let mut last = self.last_stamp.write().await;
            if *last == stamp {
                return None;
            }
            *last = stamp;
        }

        tracing::info!(path = ?self.path, "configuration file modified");
        let change = match load_config_with(Some(&self.path), |key| std::env::var(key).ok()) {
            Ok(config) => {
                let config = Arc::new(config);
                self.current.set(config.clone()).await;
                tracing::info!(pools = config.pools.len(), "configuration reloaded");
                ConfigChange::Reloaded(config)
            }
            Err(e) => {
                tracing::warn!(path = ?self.path, "configuration rejected, keeping previous: {}", e);
                ConfigChange::Rejected(ConfigWatchError::ParseError(e.to_string()))
            }
        };

        let _ = self.change_tx.send(change.clone());
        Some(change)
    }

    /// Start the polling loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.check_once().await;
                    }
                    _ = shutdown.recv() => {
                        tracing::debug!("config watcher stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// Hot-reloadable value.
pub struct HotValue<T> {
    value: Arc<RwLock<T>>,
    key: String,
}

impl<T: Clone + Send + Sync + 'static> HotValue<T> {
    pub fn new(key: impl Into<String>, initial: T) -> Self {
        Self {
            value: Arc::new(RwLock::new(initial)),
            key: key.into(),
        }
    }

    /// Get the current value.
    pub async fn get(&self) -> T {
        self.value.read().await.clone()
    }

    pub async fn set(&self, value: T) {
        *self.value.write().await = value;
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}
