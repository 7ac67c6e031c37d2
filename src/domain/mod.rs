//! Domain descriptors.
//!
//! A [`DomainDescriptor`] is the hypervisor-facing description of one VM:
//! firmware, CPU, memory and the ordered device list. It is built by
//! [`DomainBuilder`] from a [`VmSpec`](hostagent_protocol::VmSpec) and
//! serialized with [`DomainDescriptor::to_xml`] as the payload of the
//! hypervisor's define call.

pub mod builder;
pub mod capabilities;
mod xml;

pub use builder::DomainBuilder;
pub use capabilities::{Capabilities, HypervisorVersions};
pub use xml::device_xml;

use crate::topology::CpuTopology;
use hostagent_protocol::{DiskBus, DiskDevice, DiskFormat, DiskThrottle, NicModel};
use uuid::Uuid;

/// Guest virtualization kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestKind {
    /// Hardware-accelerated KVM guest.
    Kvm,
    /// Pure emulation, for hosts without virtualization extensions.
    Qemu,
}

impl GuestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuestKind::Kvm => "kvm",
            GuestKind::Qemu => "qemu",
        }
    }
}

/// UEFI sub-mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UefiMode {
    Legacy,
    Secure,
}

/// Firmware selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Firmware {
    Bios,
    Uefi {
        mode: UefiMode,
        loader: Option<String>,
        nvram: Option<String>,
        nvram_template: Option<String>,
    },
}

impl Firmware {
    pub fn is_uefi(&self) -> bool {
        matches!(self, Firmware::Uefi { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsDef {
    pub arch: String,
    /// Machine type, `pc` or `q35`.
    pub machine: String,
    pub firmware: Firmware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuDef {
    /// vCPUs online at boot.
    pub current: u32,
    /// Hot-plug ceiling.
    pub max: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuDef {
    /// `host-model`, `host-passthrough` or `custom`.
    pub mode: String,
    pub model: Option<String>,
    pub topology: Option<CpuTopology>,
}

/// CPU scheduler tuning. Zero quota and period mean "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTune {
    pub shares: u32,
    pub quota: u64,
    pub period: u64,
}

impl CpuTune {
    pub fn is_limited(&self) -> bool {
        self.quota > 0 && self.period > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryDef {
    pub max_kib: u64,
    pub current_kib: u64,
    pub ballooning: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypervFeatures {
    pub relaxed: bool,
    pub vapic: bool,
    pub spinlock_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features {
    pub acpi: bool,
    pub apic: bool,
    pub pae: bool,
    pub smm: bool,
    pub hyperv: Option<HypervFeatures>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOffset {
    Utc,
    Localtime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClockDef {
    pub offset: ClockOffset,
    /// Present timers by name (`kvmclock`, `hypervclock`).
    pub timers: Vec<String>,
}

impl ClockDef {
    pub fn has_timer(&self, name: &str) -> bool {
        self.timers.iter().any(|t| t == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Destroy,
    Restart,
}

impl LifecycleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleAction::Destroy => "destroy",
            LifecycleAction::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub on_poweroff: LifecycleAction,
    pub on_reboot: LifecycleAction,
    pub on_crash: LifecycleAction,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            on_poweroff: LifecycleAction::Destroy,
            on_reboot: LifecycleAction::Restart,
            on_crash: LifecycleAction::Destroy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskSource {
    File(String),
    Block(String),
}

impl DiskSource {
    /// Block devices live under `/dev`; everything else is a file.
    pub fn from_path(path: &str) -> Self {
        if path.starts_with("/dev/") {
            DiskSource::Block(path.to_string())
        } else {
            DiskSource::File(path.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskDef {
    pub device: DiskDevice,
    pub source: DiskSource,
    pub format: DiskFormat,
    pub bus: DiskBus,
    /// Guest target name, e.g. `vda`.
    pub target: String,
    pub serial: Option<String>,
    pub readonly: bool,
    pub iotune: Option<DiskThrottle>,
    /// Driver I/O mode (`native`, `io_uring`).
    pub io: Option<String>,
    pub encryption_secret: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Tap device enslaved to a bridge.
    Bridge { bridge: String },
    /// macvtap on a physical device.
    Direct { device: String, mode: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDef {
    pub kind: InterfaceKind,
    pub mac: String,
    pub model: NicModel,
    /// Virtual port type (`openvswitch`) for switch-managed ports.
    pub virtualport: Option<String>,
    pub vlan: Option<u16>,
    pub target_dev: Option<String>,
    /// Average bandwidth in KB/s, applied inbound and outbound.
    pub bandwidth_kbps: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerDef {
    pub kind: String,
    pub model: String,
    pub queues: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDef {
    pub path: String,
    pub target_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphicsDef {
    pub listen: String,
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchdogDef {
    pub model: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RngDef {
    pub backend: String,
    pub rate_bytes: u32,
    pub rate_period_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemBalloonDef {
    /// `virtio` or `none`.
    pub model: String,
    pub stats_period_secs: u64,
}

/// One entry of the ordered device list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Device {
    Emulator(String),
    Disk(DiskDef),
    Controller(ControllerDef),
    Input { kind: String, bus: String },
    Interface(InterfaceDef),
    Serial,
    Console,
    Channel(ChannelDef),
    Graphics(GraphicsDef),
    Watchdog(WatchdogDef),
    Rng(RngDef),
    MemBalloon(MemBalloonDef),
}

/// Complete hypervisor-facing VM description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    pub name: String,
    pub uuid: Uuid,
    pub description: String,
    pub guest: GuestKind,
    pub os: OsDef,
    pub vcpu: VcpuDef,
    pub cpu: CpuDef,
    pub cputune: CpuTune,
    pub memory: MemoryDef,
    pub features: Features,
    pub clock: ClockDef,
    pub lifecycle: Lifecycle,
    pub devices: Vec<Device>,
}

impl DomainDescriptor {
    /// Serialize as domain XML.
    pub fn to_xml(&self) -> String {
        xml::domain_xml(self)
    }

    pub fn disks(&self) -> impl Iterator<Item = &DiskDef> {
        self.devices.iter().filter_map(|d| match d {
            Device::Disk(disk) => Some(disk),
            _ => None,
        })
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &InterfaceDef> {
        self.devices.iter().filter_map(|d| match d {
            Device::Interface(nic) => Some(nic),
            _ => None,
        })
    }

    pub fn find_device<F>(&self, pred: F) -> Option<&Device>
    where
        F: Fn(&Device) -> bool,
    {
        self.devices.iter().find(|d| pred(d))
    }
}
