//! Agent configuration.
//!
//! The agent is configured from a flat map of dotted string keys, as the
//! control plane hands it over. [`AgentConfig::load`] reads the same map from
//! a TOML file, flattening nested tables into dotted keys.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Recognised configuration keys.
pub mod keys {
    pub const BRIDGE_TYPE: &str = "network.bridge.type";
    pub const VIF_DRIVER: &str = "libvirt.vif.driver";
    /// Prefix for per-traffic-type overrides, e.g. `libvirt.vif.driver.Guest`.
    pub const VIF_DRIVER_PREFIX: &str = "libvirt.vif.driver.";
    pub const PUBLIC_DEVICE: &str = "public.network.device";
    pub const GUEST_DEVICE: &str = "guest.network.device";
    pub const PRIVATE_DEVICE: &str = "private.network.device";
    pub const DIRECT_DEVICE: &str = "network.direct.source.device";

    pub const LOCAL_STORAGE_PATH: &str = "local.storage.path";
    pub const LOCAL_STORAGE_UUID: &str = "local.storage.uuid";

    pub const MEMBALLOON_DISABLE: &str = "vm.memballoon.disable";
    pub const MEMBALLOON_STATS_PERIOD: &str = "vm.memballoon.stats.period";
    pub const KVMCLOCK_DISABLE: &str = "kvmclock.disable";
    pub const CPU_MODE: &str = "guest.cpu.mode";
    pub const CPU_MODEL: &str = "guest.cpu.model";
    pub const CPU_TOPOLOGY_ENABLE: &str = "guest.cpu.topology.enable";
    pub const VNC_LISTEN: &str = "vnc.listen";
    pub const CHANNEL_DIR: &str = "guest.channel.dir";
    pub const LOADER_LEGACY: &str = "guest.loader.legacy";
    pub const LOADER_SECURE: &str = "guest.loader.secure";
    pub const NVRAM_TEMPLATE_LEGACY: &str = "guest.nvram.template.legacy";
    pub const NVRAM_TEMPLATE_SECURE: &str = "guest.nvram.template.secure";
    pub const NVRAM_PATH: &str = "guest.nvram.path";
    pub const WATCHDOG_MODEL: &str = "vm.watchdog.model";
    pub const WATCHDOG_ACTION: &str = "vm.watchdog.action";
    pub const RNG_ENABLE: &str = "vm.rng.enable";

    pub const MIGRATE_SPEED: &str = "vm.migrate.speed";
    pub const MIGRATE_WAIT: &str = "vm.migrate.wait";
    pub const MIGRATE_PAUSE_AFTER: &str = "vm.migrate.pauseafter";
    pub const MIGRATE_AUTOCONVERGE: &str = "vm.migrate.autoconverge";

    pub const HOST_IP: &str = "host.ip";
    pub const HA_INTERVAL: &str = "ha.heartbeat.interval";
    pub const HA_FAILURES: &str = "ha.heartbeat.failures";
    pub const HA_WINDOW: &str = "ha.heartbeat.window";

    pub const HYPERVISOR_URI: &str = "hypervisor.uri";
    pub const HYPERVISOR_CHECK_INTERVAL: &str = "hypervisor.check.interval";
    pub const AGENT_SOCKET: &str = "agent.socket";
}

/// Default hypervisor connection URI.
pub const DEFAULT_HYPERVISOR_URI: &str = "qemu:///system";

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/hostagent.sock";

/// Host networking technology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BridgeType {
    /// Native Linux bridges.
    #[default]
    Native,
    /// Open vSwitch.
    OpenVswitch,
}

/// A local storage pool declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalStorage {
    pub path: PathBuf,
    pub uuid: Uuid,
}

/// Parsed agent configuration.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    params: BTreeMap<String, String>,
    local_storage: Vec<LocalStorage>,
    bridge_type: BridgeType,
}

impl AgentConfig {
    /// Build a configuration from a parameter map.
    ///
    /// Malformed local-storage lists and unknown bridge types fail here
    /// rather than at request time.
    pub fn from_params<I, K, V>(params: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let params: BTreeMap<String, String> = params
            .into_iter()
            .map(|(k, v)| (k.into(), v.into().trim().to_string()))
            .collect();

        let local_storage = parse_local_storage(
            params.get(keys::LOCAL_STORAGE_PATH).map(String::as_str),
            params.get(keys::LOCAL_STORAGE_UUID).map(String::as_str),
        )?;

        let bridge_type = match params.get(keys::BRIDGE_TYPE).map(String::as_str) {
            None | Some("") | Some("native") => BridgeType::Native,
            Some("openvswitch") => BridgeType::OpenVswitch,
            Some(other) => {
                return Err(Error::config(format!(
                    "{} must be 'native' or 'openvswitch', got '{}'",
                    keys::BRIDGE_TYPE,
                    other
                )))
            }
        };

        Ok(Self {
            params,
            local_storage,
            bridge_type,
        })
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let table: toml::Table = text
            .parse()
            .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;

        let mut params = BTreeMap::new();
        flatten_toml("", &table, &mut params);
        tracing::debug!(path = %path.display(), keys = params.len(), "loaded configuration");
        Self::from_params(params)
    }

    /// Raw value for `key`, if set and non-empty.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Boolean value; anything other than `true`/`false` falls back to `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            Some("true") => true,
            Some("false") => false,
            None => default,
            Some(other) => {
                tracing::warn!(key, value = other, "ignoring non-boolean value");
                default
            }
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        match self.get(key) {
            None => default,
            Some(v) => v.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = v, "ignoring non-numeric value");
                default
            }),
        }
    }

    /// Duration value given as whole seconds or a humantime string (`90s`, `2m`).
    pub fn get_duration(&self, key: &str, default: Duration) -> Duration {
        match self.get(key) {
            None => default,
            Some(v) => parse_duration(v).unwrap_or_else(|| {
                tracing::warn!(key, value = v, "ignoring malformed duration");
                default
            }),
        }
    }

    /// All parameters with the given prefix, prefix stripped.
    pub fn with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> {
        self.params
            .iter()
            .filter_map(move |(k, v)| k.strip_prefix(prefix).map(|rest| (rest, v.as_str())))
    }

    pub fn bridge_type(&self) -> BridgeType {
        self.bridge_type
    }

    pub fn local_storage(&self) -> &[LocalStorage] {
        &self.local_storage
    }

    pub fn host_ip(&self) -> Option<&str> {
        self.get(keys::HOST_IP)
    }

    pub fn hypervisor_uri(&self) -> &str {
        self.get_or(keys::HYPERVISOR_URI, DEFAULT_HYPERVISOR_URI)
    }

    pub fn socket_path(&self) -> PathBuf {
        PathBuf::from(self.get_or(keys::AGENT_SOCKET, DEFAULT_SOCKET_PATH))
    }
}

fn parse_duration(v: &str) -> Option<Duration> {
    if let Ok(secs) = v.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(v).ok()
}

/// Parse the parallel `local.storage.path` / `local.storage.uuid` lists.
fn parse_local_storage(paths: Option<&str>, uuids: Option<&str>) -> Result<Vec<LocalStorage>> {
    let split = |s: &str| -> Vec<String> {
        s.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect()
    };

    let paths = paths.map(split).unwrap_or_default();
    let uuids = uuids.map(split).unwrap_or_default();

    if paths.is_empty() {
        if !uuids.is_empty() {
            return Err(Error::config(format!(
                "{} is set but {} is empty",
                keys::LOCAL_STORAGE_UUID,
                keys::LOCAL_STORAGE_PATH
            )));
        }
        return Ok(Vec::new());
    }

    let uuids: Vec<Uuid> = if uuids.is_empty() {
        let generated: Vec<Uuid> = paths.iter().map(|_| Uuid::new_v4()).collect();
        tracing::warn!(count = generated.len(), "no local storage uuids configured, generated new ones");
        generated
    } else {
        if uuids.len() != paths.len() {
            return Err(Error::config(format!(
                "{} has {} entries but {} has {}",
                keys::LOCAL_STORAGE_PATH,
                paths.len(),
                keys::LOCAL_STORAGE_UUID,
                uuids.len()
            )));
        }
        uuids
            .iter()
            .map(|u| {
                Uuid::parse_str(u)
                    .map_err(|e| Error::config(format!("invalid local storage uuid '{}': {}", u, e)))
            })
            .collect::<Result<_>>()?
    };

    Ok(paths
        .into_iter()
        .zip(uuids)
        .map(|(path, uuid)| LocalStorage {
            path: PathBuf::from(path),
            uuid,
        })
        .collect())
}

fn flatten_toml(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) {
    for (key, value) in table {
        let full = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        match value {
            toml::Value::Table(inner) => flatten_toml(&full, inner, out),
            toml::Value::String(s) => {
                out.insert(full, s.clone());
            }
            toml::Value::Array(items) => {
                let joined = items
                    .iter()
                    .map(|v| match v {
                        toml::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(",");
                out.insert(full, joined);
            }
            other => {
                out.insert(full, other.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_storage_parallel_lists() {
        let cfg = AgentConfig::from_params([
            (keys::LOCAL_STORAGE_PATH, "/var/lib/libvirt/images, /mnt/local2"),
            (
                keys::LOCAL_STORAGE_UUID,
                "0a4d7f1e-5c43-4b6e-9d02-2b9b2f8c1a11,6c3e2a9b-0d7f-4e81-8f3a-5b1c9d0e2f44",
            ),
        ])
        .unwrap();
        let pools = cfg.local_storage();
        assert_eq!(pools.len(), 2);
        assert_eq!(pools[1].path, PathBuf::from("/mnt/local2"));
        assert_eq!(
            pools[0].uuid.to_string(),
            "0a4d7f1e-5c43-4b6e-9d02-2b9b2f8c1a11"
        );
    }

    #[test]
    fn test_local_storage_mismatched_lengths_is_fatal() {
        let err = AgentConfig::from_params([
            (keys::LOCAL_STORAGE_PATH, "/a,/b"),
            (keys::LOCAL_STORAGE_UUID, "0a4d7f1e-5c43-4b6e-9d02-2b9b2f8c1a11"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_local_storage_malformed_uuid_is_fatal() {
        let err = AgentConfig::from_params([
            (keys::LOCAL_STORAGE_PATH, "/a"),
            (keys::LOCAL_STORAGE_UUID, "not-a-uuid"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_local_storage_generates_missing_uuids() {
        let cfg = AgentConfig::from_params([(keys::LOCAL_STORAGE_PATH, "/a,/b")]).unwrap();
        assert_eq!(cfg.local_storage().len(), 2);
        assert_ne!(cfg.local_storage()[0].uuid, cfg.local_storage()[1].uuid);
    }

    #[test]
    fn test_bridge_type() {
        let empty: [(&str, &str); 0] = [];
        assert_eq!(AgentConfig::from_params(empty).unwrap().bridge_type(), BridgeType::Native);
        assert_eq!(AgentConfig::default().bridge_type(), BridgeType::Native);
        let ovs = AgentConfig::from_params([(keys::BRIDGE_TYPE, "openvswitch")]).unwrap();
        assert_eq!(ovs.bridge_type(), BridgeType::OpenVswitch);
        assert!(AgentConfig::from_params([(keys::BRIDGE_TYPE, "vde")]).is_err());
    }

    #[test]
    fn test_typed_accessors() {
        let cfg = AgentConfig::from_params([
            ("a.bool", "TRUE"),
            ("a.num", "42"),
            ("a.bad", "x"),
            ("a.secs", "90"),
            ("a.human", "2m"),
        ])
        .unwrap();
        assert!(cfg.get_bool("a.bool", false));
        assert!(cfg.get_bool("missing", true));
        assert_eq!(cfg.get_u64("a.num", 0), 42);
        assert_eq!(cfg.get_u64("a.bad", 7), 7);
        assert_eq!(cfg.get_duration("a.secs", Duration::ZERO), Duration::from_secs(90));
        assert_eq!(cfg.get_duration("a.human", Duration::ZERO), Duration::from_secs(120));
    }

    #[test]
    fn test_load_flattens_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            r#"
"host.ip" = "10.0.0.5"

[libvirt.vif.driver]
Guest = "OvsVifDriver"

[vm.memballoon]
disable = true
"#,
        )
        .unwrap();

        let cfg = AgentConfig::load(&path).unwrap();
        assert_eq!(cfg.host_ip(), Some("10.0.0.5"));
        assert_eq!(cfg.get("libvirt.vif.driver.Guest"), Some("OvsVifDriver"));
        assert!(cfg.get_bool(keys::MEMBALLOON_DISABLE, false));
    }
}
