//! Orchestrator-supplied VM description.
//!
//! A [`VmSpec`] is the abstract, hypervisor-independent description of a
//! virtual machine as the control plane sends it. The host agent turns it
//! into a concrete domain descriptor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kind of virtual machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum VmKind {
    /// Tenant workload.
    #[default]
    UserVm,
    /// Virtual router appliance.
    DomainRouter,
    /// Any other infrastructure VM (console proxy, secondary storage, ...).
    SystemVm,
}

/// Boot mode hint supplied alongside the spec.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BootMode {
    #[default]
    Bios,
    Uefi,
}

/// Network traffic type a NIC is attached for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrafficType {
    Public,
    Guest,
    Management,
    Control,
    Storage,
    Vpn,
}

impl TrafficType {
    /// Every traffic type, in a stable order.
    pub const ALL: [TrafficType; 6] = [
        TrafficType::Public,
        TrafficType::Guest,
        TrafficType::Management,
        TrafficType::Control,
        TrafficType::Storage,
        TrafficType::Vpn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficType::Public => "Public",
            TrafficType::Guest => "Guest",
            TrafficType::Management => "Management",
            TrafficType::Control => "Control",
            TrafficType::Storage => "Storage",
            TrafficType::Vpn => "Vpn",
        }
    }
}

impl fmt::Display for TrafficType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a traffic type name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownTrafficType(pub String);

impl fmt::Display for UnknownTrafficType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown traffic type: '{}'", self.0)
    }
}

impl std::error::Error for UnknownTrafficType {}

impl FromStr for TrafficType {
    type Err = UnknownTrafficType;

    /// Parse a traffic type name, ignoring ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrafficType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTrafficType(s.to_string()))
    }
}

/// Emulated NIC model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NicModel {
    #[default]
    Virtio,
    E1000,
    Rtl8139,
}

impl NicModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NicModel::Virtio => "virtio",
            NicModel::E1000 => "e1000",
            NicModel::Rtl8139 => "rtl8139",
        }
    }
}

/// A virtual NIC requested for the VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NicSpec {
    /// Position on the guest PCI bus (also used for the tap name).
    pub device_id: u32,
    /// MAC address, `aa:bb:cc:dd:ee:ff`.
    pub mac: String,
    pub traffic_type: TrafficType,
    /// VLAN tag, when the network is VLAN-isolated.
    #[serde(default)]
    pub vlan: Option<u16>,
    /// Rate limit in megabits per second.
    #[serde(default)]
    pub network_rate_mbps: Option<u32>,
    #[serde(default)]
    pub model: Option<NicModel>,
}

/// Bus a disk is attached to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskBus {
    #[default]
    Virtio,
    Scsi,
    Sata,
    Ide,
}

impl DiskBus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "virtio",
            DiskBus::Scsi => "scsi",
            DiskBus::Sata => "sata",
            DiskBus::Ide => "ide",
        }
    }

    /// Target device name prefix for this bus (`vd`, `sd`, `hd`).
    pub fn device_prefix(&self) -> &'static str {
        match self {
            DiskBus::Virtio => "vd",
            DiskBus::Scsi | DiskBus::Sata => "sd",
            DiskBus::Ide => "hd",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskDevice {
    #[default]
    Disk,
    Cdrom,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Qcow2,
    Raw,
}

impl DiskFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

/// Optional I/O throttling applied to a disk. Zero values mean unlimited.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct DiskThrottle {
    #[serde(default)]
    pub read_iops: u64,
    #[serde(default)]
    pub write_iops: u64,
    #[serde(default)]
    pub read_bytes_sec: u64,
    #[serde(default)]
    pub write_bytes_sec: u64,
}

impl DiskThrottle {
    pub fn is_empty(&self) -> bool {
        self.read_iops == 0
            && self.write_iops == 0
            && self.read_bytes_sec == 0
            && self.write_bytes_sec == 0
    }
}

/// Block-device encryption metadata (LUKS with a hypervisor-held secret).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskEncryption {
    /// UUID of the secret holding the passphrase.
    pub secret_uuid: Uuid,
}

/// A disk requested for the VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskSpec {
    /// Stable label identifying this disk, exposed to the guest as the disk serial.
    pub label: String,
    /// Index on its bus; drives the target device name.
    pub device_id: u32,
    /// Source file or block device path.
    pub path: String,
    #[serde(default)]
    pub bus: DiskBus,
    #[serde(default)]
    pub device: DiskDevice,
    #[serde(default)]
    pub format: DiskFormat,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub throttle: Option<DiskThrottle>,
    #[serde(default)]
    pub encryption: Option<DiskEncryption>,
}

/// Abstract VM description supplied by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VmSpec {
    pub name: String,
    pub uuid: Uuid,
    #[serde(default)]
    pub kind: VmKind,
    pub vcpus: u32,
    /// Minimum guaranteed clock speed per vCPU in MHz.
    #[serde(default)]
    pub min_speed_mhz: Option<u32>,
    /// Maximum clock speed per vCPU in MHz.
    #[serde(default)]
    pub max_speed_mhz: Option<u32>,
    /// Minimum memory in bytes.
    pub min_ram: u64,
    /// Maximum memory in bytes.
    pub max_ram: u64,
    /// Guest OS label, e.g. "Ubuntu 22.04" or "Windows Server 2019".
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub boot_mode: BootMode,
    #[serde(default)]
    pub vnc_password: Option<String>,
    /// Whether the CPU use of this VM should be capped.
    #[serde(default)]
    pub limit_cpu_use: bool,
    /// Fraction of a host core each vCPU may use when capped (`0 < p <= 1`).
    #[serde(default)]
    pub cpu_quota_percentage: Option<f64>,
    /// Hard limit on hot-pluggable vCPUs.
    #[serde(default)]
    pub vcpu_max_limit: Option<u32>,
    #[serde(default)]
    pub nics: Vec<NicSpec>,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    /// Free-form details (`UEFI`, `cpu.corespersocket`, ...).
    #[serde(default)]
    pub extra_config: BTreeMap<String, String>,
}

impl VmSpec {
    /// Create a spec with the given identity and resources and no devices.
    pub fn new(name: impl Into<String>, vcpus: u32, min_ram: u64, max_ram: u64) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            kind: VmKind::UserVm,
            vcpus,
            min_speed_mhz: None,
            max_speed_mhz: None,
            min_ram,
            max_ram,
            os: String::new(),
            boot_mode: BootMode::Bios,
            vnc_password: None,
            limit_cpu_use: false,
            cpu_quota_percentage: None,
            vcpu_max_limit: None,
            nics: Vec::new(),
            disks: Vec::new(),
            extra_config: BTreeMap::new(),
        }
    }

    /// Whether the OS label names a Windows guest.
    pub fn is_windows(&self) -> bool {
        self.os.to_ascii_lowercase().contains("windows")
    }

    /// Look up an extra-configuration value.
    pub fn detail(&self, key: &str) -> Option<&str> {
        self.extra_config.get(key).map(String::as_str)
    }
}
