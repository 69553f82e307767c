//! Hot reload file watcher for code units
//!
//! Watches unit directories and registers, re-registers or unregisters units
//! as their files change. Every edit produces a new code hash, so approvals
//! granted to the previous version do not carry over.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::discovery::{DiscoveryError, UnitScanner};
use crate::registry::NativeHost;

/// Hot reload settings
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period before a burst of file events is applied
    pub debounce: Duration,
    /// Register units already present on start
    pub load_existing: bool,
    pub scanner: UnitScanner,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            load_existing: true,
            scanner: UnitScanner::new(),
        }
    }
}

/// Keeps a [`NativeHost`] in sync with unit files on disk
///
/// Dropping the watcher stops filesystem notifications; [`shutdown`]
/// also stops the background task.
///
/// [`shutdown`]: HotReloadWatcher::shutdown
pub struct HotReloadWatcher {
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
}

impl HotReloadWatcher {
    pub async fn new(
        host: NativeHost,
        directories: impl IntoIterator<Item = impl AsRef<Path>>,
        config: WatcherConfig,
    ) -> Result<Self, WatcherError> {
        let directories: Vec<PathBuf> = directories.into_iter().map(|p| p.as_ref().to_path_buf()).collect();

        if config.load_existing {
            for dir in directories.iter().filter(|d| d.is_dir()) {
                register_directory(&host, &config.scanner, dir).await?;
            }
        }

        let (event_tx, event_rx) = mpsc::channel::<Event>(100);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = event_tx.blocking_send(event);
            }
        })
        .map_err(WatcherError::WatcherInit)?;

        for dir in &directories {
            if !dir.exists() {
                tracing::warn!(dir = %dir.display(), "Unit directory does not exist, skipping");
                continue;
            }
            watcher
                .watch(dir, RecursiveMode::NonRecursive)
                .map_err(WatcherError::WatcherInit)?;
            tracing::info!(dir = %dir.display(), "Watching directory for units");
        }

        let sync = UnitSync {
            host,
            config,
            pending: BTreeSet::new(),
        };
        tokio::spawn(sync.run(event_rx, shutdown_rx));

        Ok(Self {
            _watcher: watcher,
            shutdown_tx,
        })
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Background task applying debounced file events to the host
struct UnitSync {
    host: NativeHost,
    config: WatcherConfig,
    pending: BTreeSet<PathBuf>,
}

impl UnitSync {
    async fn run(mut self, mut events: mpsc::Receiver<Event>, mut shutdown: mpsc::Receiver<()>) {
        let mut deadline: Option<Instant> = None;
        loop {
            let quiet = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = shutdown.recv() => break,
                Some(event) = events.recv() => {
                    let scanner = &self.config.scanner;
                    let units: Vec<PathBuf> = event.paths.into_iter().filter(|p| scanner.is_unit_file(p)).collect();
                    if !units.is_empty() {
                        self.pending.extend(units);
                        deadline = Some(Instant::now() + self.config.debounce);
                    }
                }
                _ = quiet => {
                    deadline = None;
                    for path in std::mem::take(&mut self.pending) {
                        self.apply(&path).await;
                    }
                }
            }
        }
        tracing::info!("Hot reload watcher stopped");
    }

    /// Register a changed file, or unload the unit of a deleted one
    async fn apply(&self, path: &Path) {
        if path.exists() {
            match self.host.register_file(path).await {
                Ok(channel) => tracing::info!(channel = %channel, path = %path.display(), "Unit reloaded"),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to reload unit"),
            }
        } else if let Some(id) = self.host.unload_by_path(path).await {
            tracing::info!(unit = %id, path = %path.display(), "Unit unloaded after file removal");
        }
    }
}

async fn register_directory(host: &NativeHost, scanner: &UnitScanner, dir: &Path) -> Result<(), WatcherError> {
    let scan = scanner.scan_directory(dir)?;
    for (path, error) in &scan.failures {
        tracing::warn!(path = %path.display(), error = %error, "Failed to read unit");
    }
    for path in scan.units.into_iter().filter_map(|unit| unit.origin) {
        if let Err(e) = host.register_file(&path).await {
            tracing::warn!(path = %path.display(), error = %e, "Failed to load unit");
        }
    }
    Ok(())
}

/// Errors that can occur during watching
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to initialize watcher: {0}")]
    WatcherInit(#[source] notify::Error),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::trust::TrustPresets;
    use std::fs;
    use tempfile::TempDir;

    const UNIT: &str = r#"(module (func (export "ping") (result i32) i32.const 1))"#;

    fn host() -> NativeHost {
        let config = HostConfig::default().with_data_dir(std::env::temp_dir());
        NativeHost::new(TrustPresets::testing(), &config).unwrap()
    }

    async fn wait_for(host: &NativeHost, id: &str, present: bool) -> bool {
        for _ in 0..50 {
            if host.contains(id).await == present {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_watcher_loads_existing() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("ping.wat"), UNIT).unwrap();

        let host = host();
        let _watcher = HotReloadWatcher::new(host.clone(), vec![temp.path()], WatcherConfig::default())
            .await
            .unwrap();

        assert!(host.contains("ping").await);
    }

    #[tokio::test]
    async fn test_watcher_hot_reload() {
        let temp = TempDir::new().unwrap();
        let host = host();
        let watcher = HotReloadWatcher::new(
            host.clone(),
            vec![temp.path()],
            WatcherConfig {
                debounce: Duration::from_millis(100),
                ..WatcherConfig::default()
            },
        )
        .await
        .unwrap();
        assert!(!host.contains("ping").await);

        let path = temp.path().join("ping.wat");
        fs::write(&path, UNIT).unwrap();
        assert!(wait_for(&host, "ping", true).await);

        fs::remove_file(&path).unwrap();
        assert!(wait_for(&host, "ping", false).await);

        watcher.shutdown().await;
    }
}
