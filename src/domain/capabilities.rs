//! Version-gated hypervisor features.
//!
//! Versions use the `major * 1_000_000 + minor * 1_000 + release` encoding.
//! [`Capabilities`] is computed once when the agent connects and passed to
//! the descriptor builder; nothing else compares version numbers.

use std::collections::BTreeMap;

/// Library version from which the kvmclock timer can be requested.
pub const KVMCLOCK_MIN_LIBRARY: u64 = 9_008;
/// Hyper-V enlightenments need both of these.
pub const HYPERV_MIN_HYPERVISOR: u64 = 1_001_000;
pub const HYPERV_MIN_LIBRARY: u64 = 1_000_003;
/// Per-disk I/O throttling.
pub const IO_THROTTLING_MIN_HYPERVISOR: u64 = 1_002_000;
/// io_uring disk driver mode needs both of these.
pub const IO_URING_MIN_HYPERVISOR: u64 = 5_000_000;
pub const IO_URING_MIN_LIBRARY: u64 = 6_003_000;
/// Selective block migration (`migrate_disks`).
pub const MIGRATE_DISKS_MIN_LIBRARY: u64 = 1_002_017;

/// Detected control-library and hypervisor versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HypervisorVersions {
    pub library: u64,
    pub hypervisor: u64,
}

impl HypervisorVersions {
    pub fn new(library: u64, hypervisor: u64) -> Self {
        Self {
            library,
            hypervisor,
        }
    }

    /// Encode a dotted version (`8.0.0`, `6.2`) as a single number.
    pub fn encode(dotted: &str) -> Option<u64> {
        let mut parts = dotted.trim().split('.');
        let major: u64 = parts.next()?.parse().ok()?;
        let minor: u64 = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
        let release: u64 = parts.next().map(str::parse).transpose().ok()?.unwrap_or(0);
        if minor >= 1_000 || release >= 1_000 {
            return None;
        }
        Some(major * 1_000_000 + minor * 1_000 + release)
    }
}

/// Feature switches derived from [`HypervisorVersions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub versions: HypervisorVersions,
    pub kvmclock: bool,
    pub hyperv_enlightenments: bool,
    pub io_throttling: bool,
    pub io_uring: bool,
    pub selective_block_migration: bool,
}

impl Capabilities {
    pub fn from_versions(versions: HypervisorVersions) -> Self {
        let HypervisorVersions {
            library,
            hypervisor,
        } = versions;
        Self {
            versions,
            kvmclock: library >= KVMCLOCK_MIN_LIBRARY,
            hyperv_enlightenments: hypervisor >= HYPERV_MIN_HYPERVISOR
                && library >= HYPERV_MIN_LIBRARY,
            io_throttling: hypervisor >= IO_THROTTLING_MIN_HYPERVISOR,
            io_uring: hypervisor >= IO_URING_MIN_HYPERVISOR && library >= IO_URING_MIN_LIBRARY,
            selective_block_migration: library >= MIGRATE_DISKS_MIN_LIBRARY,
        }
    }

    /// Flags by name, for the `Ready` payload.
    pub fn as_map(&self) -> BTreeMap<String, bool> {
        [
            ("kvmclock", self.kvmclock),
            ("hyperv_enlightenments", self.hyperv_enlightenments),
            ("io_throttling", self.io_throttling),
            ("io_uring", self.io_uring),
            ("selective_block_migration", self.selective_block_migration),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}
