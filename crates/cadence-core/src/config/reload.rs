// crates/cadence-core/src/config/reload.rs
// Hot-reloadable config handle
//
// Readers take an Arc snapshot; a turn keeps the snapshot it started with, so
// a reload never changes an in-flight turn.

use super::file::CadenceConfig;
use crate::error::{CadenceError, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Shared, swappable configuration
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<CadenceConfig>>>,
    path: Option<PathBuf>,
}

impl ConfigHandle {
    /// Handle over a fixed config (no backing file)
    pub fn new(config: CadenceConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            path: None,
        }
    }

    /// Load from a file; the file is re-read on `reload`
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = CadenceConfig::load_from(&path)?;
        Self::check(&config)?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current config snapshot
    pub fn snapshot(&self) -> Arc<CadenceConfig> {
        self.current.read().clone()
    }

    /// Swap in a new config after validating it
    pub fn replace(&self, config: CadenceConfig) -> Result<()> {
        Self::check(&config)?;
        *self.current.write() = Arc::new(config);
        info!("Configuration replaced");
        Ok(())
    }

    /// Re-read the backing file. Invalid files are rejected and the old config kept.
    pub fn reload(&self) -> Result<()> {
        let Some(ref path) = self.path else {
            return Err(CadenceError::Config(
                "config handle has no backing file".to_string(),
            ));
        };
        let config = CadenceConfig::load_from(path)?;
        self.replace(config)
    }

    fn check(config: &CadenceConfig) -> Result<()> {
        let validation = config.validate();
        if validation.is_valid() {
            Ok(())
        } else {
            Err(CadenceError::Config(validation.report()))
        }
    }

    /// Poll the backing file's mtime and reload when it changes.
    ///
    /// Returns immediately when the handle has no backing file.
    pub fn spawn_watcher(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let path = self.path.clone()?;
        let handle = self.clone();

        Some(tokio::spawn(async move {
            let mut last_seen = modified_at(&path);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("Config watcher shutting down");
                            break;
                        }
                        continue;
                    }
                }

                let seen = modified_at(&path);
                if seen == last_seen {
                    continue;
                }
                last_seen = seen;

                match handle.reload() {
                    Ok(()) => info!(path = %path.display(), "Configuration reloaded"),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Config reload rejected, keeping previous")
                    }
                }
            }
        }))
    }
}

fn modified_at(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(file: &mut NamedTempFile, body: &str) {
        let f = file.as_file_mut();
        f.set_len(0).unwrap();
        use std::io::Seek;
        f.seek(std::io::SeekFrom::Start(0)).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn test_snapshot_is_stable_across_replace() {
        let handle = ConfigHandle::new(CadenceConfig::with_default_providers());
        let before = handle.snapshot();

        let mut next = CadenceConfig::with_default_providers();
        next.stream.window_size = 5;
        handle.replace(next).unwrap();

        // The old snapshot is untouched; new readers see the update
        assert_eq!(before.stream.window_size, 20);
        assert_eq!(handle.snapshot().stream.window_size, 5);
    }

    #[test]
    fn test_replace_rejects_invalid() {
        let handle = ConfigHandle::new(CadenceConfig::with_default_providers());
        let mut bad = CadenceConfig::with_default_providers();
        bad.stream.window_size = 0;
        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.snapshot().stream.window_size, 20);
    }

    #[test]
    fn test_reload_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write_config(&mut file, "[stream]\nwindow_size = 8\n");

        let handle = ConfigHandle::from_file(file.path()).unwrap();
        assert_eq!(handle.snapshot().stream.window_size, 8);

        write_config(&mut file, "[stream]\nwindow_size = 12\n");
        handle.reload().unwrap();
        assert_eq!(handle.snapshot().stream.window_size, 12);

        // Broken file keeps the previous config
        write_config(&mut file, "[stream\nwindow_size = ");
        assert!(handle.reload().is_err());
        assert_eq!(handle.snapshot().stream.window_size, 12);
    }

    #[test]
    fn test_reload_without_file_errors() {
        let handle = ConfigHandle::new(CadenceConfig::with_default_providers());
        assert!(matches!(handle.reload(), Err(CadenceError::Config(_))));
        let (_tx, rx) = watch::channel(false);
        assert!(handle.spawn_watcher(Duration::from_secs(1), rx).is_none());
    }
}
