//! Host heartbeats and storage-pool health.
//!
//! The monitor writes a heartbeat file for this host into every pool on a
//! fixed interval. Pools that keep failing are reported unreachable. Other
//! hosts read the same files to decide whether a peer may be fenced.

use crate::config::{keys, AgentConfig, LocalStorage};
use crate::error::{Error, Result};
use hostagent_protocol::{HostHealth, PoolHealth};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Directory inside each pool holding heartbeat files.
pub const HEARTBEAT_DIR: &str = "KVMHA";

/// A storage pool heartbeats are written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaPool {
    pub uuid: String,
    pub path: PathBuf,
}

impl From<&LocalStorage> for HaPool {
    fn from(storage: &LocalStorage) -> Self {
        Self {
            uuid: storage.uuid.to_string(),
            path: storage.path.clone(),
        }
    }
}

/// Persistence for host heartbeats.
pub trait HeartbeatStore: Send + Sync {
    /// Record a heartbeat for `host_ip` in `pool` at the current time.
    fn write(&self, pool: &HaPool, host_ip: &str) -> Result<()>;

    /// Time of the last heartbeat for `host_ip` in `pool`, if any.
    fn last_beat(&self, pool: &HaPool, host_ip: &str) -> Result<Option<SystemTime>>;
}

/// Stores heartbeats as epoch seconds in `<pool>/KVMHA/hb-<ip>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileHeartbeatStore;

impl FileHeartbeatStore {
    pub fn heartbeat_path(pool: &HaPool, host_ip: &str) -> PathBuf {
        pool.path
            .join(HEARTBEAT_DIR)
            .join(format!("hb-{}", host_ip))
    }
}

impl HeartbeatStore for FileHeartbeatStore {
    fn write(&self, pool: &HaPool, host_ip: &str) -> Result<()> {
        let path = Self::heartbeat_path(pool, host_ip);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                Error::storage(format!("pool {}: cannot create {}: {}", pool.uuid, dir.display(), e))
            })?;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        fs::write(&path, now.to_string()).map_err(|e| {
            Error::storage(format!("pool {}: cannot write {}: {}", pool.uuid, path.display(), e))
        })
    }

    fn last_beat(&self, pool: &HaPool, host_ip: &str) -> Result<Option<SystemTime>> {
        let path = Self::heartbeat_path(pool, host_ip);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::storage(format!(
                    "pool {}: cannot read {}: {}",
                    pool.uuid,
                    path.display(),
                    e
                )))
            }
        };
        let secs: u64 = text.trim().parse().map_err(|_| {
            Error::storage(format!("malformed heartbeat in {}", path.display()))
        })?;
        Ok(Some(UNIX_EPOCH + Duration::from_secs(secs)))
    }
}

/// Whether any pool carries a heartbeat for `host_ip` younger than `window`.
pub fn is_host_alive(
    store: &dyn HeartbeatStore,
    pools: &[HaPool],
    host_ip: &str,
    window: Duration,
) -> bool {
    let now = SystemTime::now();
    pools.iter().any(|pool| match store.last_beat(pool, host_ip) {
        Ok(Some(beat)) => match now.duration_since(beat) {
            Ok(age) => age <= window,
            // Clock skew between hosts; a beat from the future is fresh.
            Err(_) => true,
        },
        Ok(None) => false,
        Err(e) => {
            tracing::debug!(pool = %pool.uuid, host = host_ip, error = %e, "cannot read heartbeat");
            false
        }
    })
}

/// Heartbeat timing from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaSettings {
    pub interval: Duration,
    /// Consecutive write failures before a pool counts as unreachable.
    pub max_failures: u32,
    /// Age after which a peer's heartbeat is considered stale.
    pub window: Duration,
}

impl Default for HaSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_failures: 5,
            window: Duration::from_secs(180),
        }
    }
}

impl HaSettings {
    pub fn from_config(config: &AgentConfig) -> Self {
        let defaults = Self::default();
        Self {
            interval: config.get_duration(keys::HA_INTERVAL, defaults.interval),
            max_failures: config
                .get_u64(keys::HA_FAILURES, defaults.max_failures as u64)
                .clamp(1, u32::MAX as u64) as u32,
            window: config.get_duration(keys::HA_WINDOW, defaults.window),
        }
    }
}

/// Background heartbeat writer.
pub struct HaMonitor {
    health: Arc<Mutex<Vec<PoolHealth>>>,
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl HaMonitor {
    /// Start the heartbeat thread. The first round runs immediately.
    pub fn spawn(
        settings: HaSettings,
        host_ip: impl Into<String>,
        pools: Vec<HaPool>,
        store: Arc<dyn HeartbeatStore>,
    ) -> Result<Self> {
        let host_ip = host_ip.into();
        let health = Arc::new(Mutex::new(
            pools
                .iter()
                .map(|p| PoolHealth {
                    uuid: p.uuid.clone(),
                    path: p.path.display().to_string(),
                    reachable: true,
                    consecutive_failures: 0,
                })
                .collect::<Vec<_>>(),
        ));
        let (stop_tx, stop_rx) = mpsc::channel();

        let shared = health.clone();
        let handle = thread::Builder::new()
            .name("ha-monitor".into())
            .spawn(move || {
                tracing::info!(host = %host_ip, pools = pools.len(), "ha monitor started");
                loop {
                    beat_once(&settings, &host_ip, &pools, store.as_ref(), &shared);
                    match stop_rx.recv_timeout(settings.interval) {
                        Err(mpsc::RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                tracing::info!("ha monitor stopped");
            })?;

        Ok(Self {
            health,
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn health(&self) -> HostHealth {
        let pools = self.health.lock().clone();
        HostHealth {
            healthy: pools.iter().all(|p| p.reachable),
            pools,
        }
    }

    /// Stop the heartbeat thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("ha monitor thread panicked");
            }
        }
    }
}

impl Drop for HaMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn beat_once(
    settings: &HaSettings,
    host_ip: &str,
    pools: &[HaPool],
    store: &dyn HeartbeatStore,
    health: &Mutex<Vec<PoolHealth>>,
) {
    for (idx, pool) in pools.iter().enumerate() {
        let result = store.write(pool, host_ip);
        let mut health = health.lock();
        let Some(entry) = health.get_mut(idx) else {
            continue;
        };
        match result {
            Ok(()) => {
                if !entry.reachable {
                    tracing::info!(pool = %pool.uuid, "pool reachable again");
                }
                entry.consecutive_failures = 0;
                entry.reachable = true;
            }
            Err(e) => {
                entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
                tracing::warn!(
                    pool = %pool.uuid,
                    failures = entry.consecutive_failures,
                    error = %e,
                    "heartbeat write failed"
                );
                if entry.reachable && entry.consecutive_failures >= settings.max_failures {
                    tracing::error!(pool = %pool.uuid, "pool unreachable");
                    entry.reachable = false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn pool(dir: &Path) -> HaPool {
        HaPool {
            uuid: "pool-1".into(),
            path: dir.to_path_buf(),
        }
    }

    fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_file_store_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(tmp.path());
        let store = FileHeartbeatStore;

        assert_eq!(store.last_beat(&pool, "10.0.0.5").unwrap(), None);
        store.write(&pool, "10.0.0.5").unwrap();
        assert!(tmp.path().join("KVMHA/hb-10.0.0.5").is_file());
        assert!(store.last_beat(&pool, "10.0.0.5").unwrap().is_some());
    }

    #[test]
    fn test_malformed_heartbeat_is_error() {
        let tmp = TempDir::new().unwrap();
        let pool = pool(tmp.path());
        let path = FileHeartbeatStore::heartbeat_path(&pool, "10.0.0.5");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "yesterday").unwrap();
        assert!(matches!(
            FileHeartbeatStore.last_beat(&pool, "10.0.0.5"),
            Err(Error::Storage(_))
        ));
    }

    #[test]
    fn test_is_host_alive() {
        let tmp = TempDir::new().unwrap();
        let pools = vec![pool(tmp.path())];
        let store = FileHeartbeatStore;
        let window = Duration::from_secs(180);

        assert!(!is_host_alive(&store, &pools, "10.0.0.5", window));

        store.write(&pools[0], "10.0.0.5").unwrap();
        assert!(is_host_alive(&store, &pools, "10.0.0.5", window));

        let stale = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs()
            - 3600;
        fs::write(
            FileHeartbeatStore::heartbeat_path(&pools[0], "10.0.0.5"),
            stale.to_string(),
        )
        .unwrap();
        assert!(!is_host_alive(&store, &pools, "10.0.0.5", window));
    }

    #[test]
    fn test_settings_from_config() {
        let config = AgentConfig::from_params([
            (keys::HA_INTERVAL, "30s"),
            (keys::HA_FAILURES, "0"),
        ])
        .unwrap();
        let settings = HaSettings::from_config(&config);
        assert_eq!(settings.interval, Duration::from_secs(30));
        assert_eq!(settings.max_failures, 1);
        assert_eq!(settings.window, Duration::from_secs(180));
    }

    #[test]
    fn test_monitor_writes_heartbeats() {
        let tmp = TempDir::new().unwrap();
        let settings = HaSettings {
            interval: Duration::from_millis(20),
            ..Default::default()
        };
        let monitor = HaMonitor::spawn(
            settings,
            "10.0.0.5",
            vec![pool(tmp.path())],
            Arc::new(FileHeartbeatStore),
        )
        .unwrap();

        let beat = FileHeartbeatStore::heartbeat_path(&pool(tmp.path()), "10.0.0.5");
        assert!(wait_until(|| beat.is_file()));
        let health = monitor.health();
        assert!(health.healthy);
        assert_eq!(health.pools.len(), 1);
        monitor.stop();
    }

    #[test]
    fn test_monitor_marks_failing_pool_unreachable() {
        let tmp = TempDir::new().unwrap();
        // A regular file where the pool directory should be makes every write fail.
        let bogus = tmp.path().join("not-a-dir");
        fs::write(&bogus, "").unwrap();

        let settings = HaSettings {
            interval: Duration::from_millis(10),
            max_failures: 3,
            ..Default::default()
        };
        let monitor = HaMonitor::spawn(
            settings,
            "10.0.0.5",
            vec![pool(tmp.path()), pool(&bogus)],
            Arc::new(FileHeartbeatStore),
        )
        .unwrap();

        assert!(wait_until(|| !monitor.health().healthy));
        let health = monitor.health();
        assert!(health.pools[0].reachable);
        assert!(!health.pools[1].reachable);
        assert!(health.pools[1].consecutive_failures >= 3);
    }
}
