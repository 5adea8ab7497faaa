use crate::config::BackendConfig;
use crate::error::InstanceError;
use crate::launcher::{BackendProcess, Launch, Launched};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Snapshot of a live backend instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    /// Smallest free positive integer at creation time
    pub name: String,
    /// Absolute log directory served by this instance
    pub directory: PathBuf,
    /// Port the backend listens on
    pub port: u16,
    /// Seconds between backend reloads of the directory
    pub reload_interval: u64,
}

struct Instance {
    info: InstanceInfo,
    process: BackendProcess,
}

/// Both lookup indices, always mutated together
#[derive(Default)]
struct Instances {
    by_name: HashMap<String, Instance>,
    by_directory: HashMap<PathBuf, String>,
}

impl Instances {
    fn next_available_name(&self) -> String {
        let mut candidate = 1u64;
        while self.by_name.contains_key(&candidate.to_string()) {
            candidate += 1;
        }
        candidate.to_string()
    }

    fn find_by_directory(&self, directory: &Path) -> Option<InstanceInfo> {
        self.by_directory
            .get(directory)
            .and_then(|name| self.by_name.get(name))
            .map(|instance| instance.info.clone())
    }

    fn insert(&mut self, directory: PathBuf, reload_interval: u64, launched: Launched) -> InstanceInfo {
        let info = InstanceInfo {
            name: self.next_available_name(),
            directory,
            port: launched.port,
            reload_interval,
        };
        self.by_directory
            .insert(info.directory.clone(), info.name.clone());
        self.by_name.insert(
            info.name.clone(),
            Instance {
                info: info.clone(),
                process: launched.process,
            },
        );
        info
    }

    fn remove(&mut self, name: &str) -> Option<Instance> {
        let instance = self.by_name.remove(name)?;
        self.by_directory.remove(&instance.info.directory);
        Some(instance)
    }
}

/// Registry-wide settings derived from the backend configuration
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Relative directories are resolved against this
    pub base_dir: PathBuf,
    pub default_reload_interval_secs: u64,
    pub purge_orphaned_data: bool,
    pub shutdown_grace_period: Duration,
}

impl RegistrySettings {
    pub fn from_config(config: &BackendConfig) -> std::io::Result<Self> {
        let base_dir = match config.base_dir {
            Some(ref dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        Ok(Self {
            base_dir,
            default_reload_interval_secs: config.default_reload_interval_secs,
            purge_orphaned_data: config.purge_orphaned_data,
            shutdown_grace_period: config.shutdown_grace_period(),
        })
    }
}

/// Owns every backend instance, keyed by name and by log directory.
///
/// # Usage
///
/// The [`new`](InstanceRegistry::new) constructor returns `Arc<Self>`:
/// launches run in their own task so that a caller going away mid-launch
/// does not orphan the backend.
///
/// # Concurrency
///
/// The indices sit behind a synchronous mutex that is never held across an
/// await point. Launches for one directory are serialized through a
/// per-directory async lock, so concurrent creates for the same directory
/// spawn a single backend while other directories launch in parallel.
pub struct InstanceRegistry<L: Launch> {
    instances: Mutex<Instances>,
    launch_locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
    launcher: L,
    settings: RegistrySettings,
    /// Set by `terminate_all`; no instance is registered afterwards
    closed: AtomicBool,
}

impl<L: Launch> InstanceRegistry<L> {
    pub fn new(launcher: L, settings: RegistrySettings) -> Arc<Self> {
        Arc::new(Self {
            instances: Mutex::new(Instances::default()),
            launch_locks: DashMap::new(),
            launcher,
            settings,
            closed: AtomicBool::new(false),
        })
    }

    /// Make `directory` absolute and lexically normalized
    pub fn resolve_directory(&self, directory: &Path) -> PathBuf {
        let joined = if directory.is_absolute() {
            directory.to_path_buf()
        } else {
            self.settings.base_dir.join(directory)
        };
        normalize_lexically(&joined)
    }

    /// Return the instance serving `directory`, launching one if needed.
    ///
    /// Non-positive or missing reload intervals fall back to the configured
    /// default. An existing instance is returned unchanged.
    pub async fn get_or_create(
        self: &Arc<Self>,
        directory: &Path,
        reload_interval: Option<i64>,
    ) -> Result<InstanceInfo, InstanceError> {
        let directory = self.resolve_directory(directory);

        let existing = self.instances.lock().find_by_directory(&directory);
        if let Some(info) = existing {
            debug!(name = %info.name, directory = %directory.display(), "Reusing existing instance");
            return Ok(info);
        }

        let reload_interval = match reload_interval {
            Some(secs) if secs > 0 => secs as u64,
            _ => self.settings.default_reload_interval_secs,
        };

        let registry = Arc::clone(self);
        let task_directory = directory.clone();
        tokio::spawn(async move {
            registry
                .launch_and_register(task_directory, reload_interval)
                .await
        })
        .await
        .map_err(|e| {
            warn!(directory = %directory.display(), error = %e, "Launch task failed");
            InstanceError::LaunchAborted {
                directory: directory.clone(),
            }
        })?
    }

    async fn launch_and_register(
        &self,
        directory: PathBuf,
        reload_interval: u64,
    ) -> Result<InstanceInfo, InstanceError> {
        let lock = Arc::clone(
            &self
                .launch_locks
                .entry(directory.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        );

        let result = {
            let _guard = lock.lock().await;

            // Another create may have finished while we waited for the lock
            let existing = self.instances.lock().find_by_directory(&directory);
            match existing {
                Some(info) => Ok(info),
                None if self.is_closed() => Err(InstanceError::Closed),
                None => self.launch_locked(&directory, reload_interval).await,
            }
        };

        drop(lock);
        self.launch_locks
            .remove_if(&directory, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    /// Launch and register; the caller holds the directory's launch lock
    async fn launch_locked(
        &self,
        directory: &Path,
        reload_interval: u64,
    ) -> Result<InstanceInfo, InstanceError> {
        let launched = match self
            .launcher
            .launch(directory, reload_interval, self.settings.purge_orphaned_data)
            .await
        {
            Ok(launched) => launched,
            Err(source) => {
                warn!(directory = %directory.display(), error = %source, "Failed to launch backend");
                return Err(InstanceError::Launch {
                    directory: directory.to_path_buf(),
                    source,
                });
            }
        };

        if self.is_closed() {
            warn!(
                directory = %directory.display(),
                port = launched.port,
                "Registry closed during launch, stopping backend"
            );
            let outcome = launched
                .process
                .stop("unregistered", self.settings.shutdown_grace_period, true)
                .await;
            debug!(directory = %directory.display(), ?outcome, "Late backend stopped");
            return Err(InstanceError::Closed);
        }

        let info = self
            .instances
            .lock()
            .insert(directory.to_path_buf(), reload_interval, launched);
        info!(
            name = %info.name,
            directory = %info.directory.display(),
            port = info.port,
            reload_interval = info.reload_interval,
            "Instance created"
        );
        Ok(info)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn get(&self, name: &str) -> Option<InstanceInfo> {
        self.instances
            .lock()
            .by_name
            .get(name)
            .map(|instance| instance.info.clone())
    }

    /// All live instances, ordered by name
    pub fn list(&self) -> Vec<InstanceInfo> {
        let mut infos: Vec<InstanceInfo> = self
            .instances
            .lock()
            .by_name
            .values()
            .map(|instance| instance.info.clone())
            .collect();
        infos.sort_by_key(|info| info.name.parse::<u64>().unwrap_or(u64::MAX));
        infos
    }

    pub fn len(&self) -> usize {
        self.instances.lock().by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove an instance and stop its backend.
    ///
    /// The instance leaves both indices before the process is signalled, so
    /// no new request is routed to a dying backend. Without `force` a backend
    /// that ignores the stop request keeps running.
    pub async fn terminate(&self, name: &str, force: bool) -> Result<(), InstanceError> {
        let instance = self
            .instances
            .lock()
            .remove(name)
            .ok_or_else(|| InstanceError::NotFound(name.to_string()))?;

        info!(
            name,
            directory = %instance.info.directory.display(),
            port = instance.info.port,
            force,
            "Terminating instance"
        );

        let outcome = instance
            .process
            .stop(name, self.settings.shutdown_grace_period, force)
            .await;
        debug!(name, ?outcome, "Instance terminated");

        Ok(())
    }

    /// Close the registry and terminate every instance.
    ///
    /// Launches already in flight are waited for and stopped rather than
    /// registered; later creates fail with [`InstanceError::Closed`]. One
    /// failing stop never blocks the others.
    pub async fn terminate_all(&self, force: bool) {
        self.closed.store(true, Ordering::SeqCst);

        let in_flight: Vec<Arc<tokio::sync::Mutex<()>>> = self
            .launch_locks
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        if !in_flight.is_empty() {
            info!(count = in_flight.len(), "Waiting for in-flight launches");
            for lock in in_flight {
                drop(lock.lock().await);
            }
        }

        let names: Vec<String> = self.instances.lock().by_name.keys().cloned().collect();
        if names.is_empty() {
            return;
        }

        info!(count = names.len(), "Terminating all instances");
        let results =
            futures::future::join_all(names.iter().map(|name| self.terminate(name, force))).await;

        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                warn!(name = %name, error = %e, "Failed to terminate instance");
            }
        }
    }
}

/// Drop `.` segments and fold `..` without touching the filesystem
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
