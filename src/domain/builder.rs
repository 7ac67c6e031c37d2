//! VmSpec to DomainDescriptor translation.

use super::{
    Capabilities, ChannelDef, ClockDef, ClockOffset, ControllerDef, CpuDef, CpuTune, Device,
    DiskDef, DiskSource, DomainDescriptor, Features, Firmware, GraphicsDef, GuestKind,
    HypervFeatures, Lifecycle, MemBalloonDef, MemoryDef, OsDef, RngDef, UefiMode, VcpuDef,
    WatchdogDef,
};
use crate::config::{keys, AgentConfig};
use crate::error::{Error, Result};
use crate::topology::{self, CORES_PER_SOCKET_KEY, THREADS_PER_CORE_KEY};
use crate::vif::VifRegistry;
use hostagent_protocol::{BootMode, DiskBus, DiskSpec, VmKind, VmSpec};

/// Extra-configuration key selecting UEFI boot; its value picks the sub-mode.
pub const UEFI_KEY: &str = "UEFI";

/// Extra-configuration key forcing ACPI/APIC/PAE and Hyper-V features.
pub const GUEST_FEATURES_KEY: &str = "guest.features";

pub const CPU_SHARES_BASELINE: u32 = 1024;
pub const DEFAULT_CPU_PERIOD: u64 = 10_000;
/// Smallest quota handed to the scheduler, so tiny percentages don't starve the VM.
pub const MIN_QUOTA: u64 = 1_000;
pub const MAX_PERIOD: u64 = 1_000_000;

/// Longest VNC password the hypervisor accepts.
pub const VNC_PASSWORD_MAX_LEN: usize = 8;

pub const HYPERV_SPINLOCK_RETRIES: u32 = 8191;
pub const RNG_RATE_BYTES: u32 = 2048;
pub const RNG_RATE_PERIOD_MS: u32 = 1000;

pub const DEFAULT_EMULATOR: &str = "/usr/libexec/qemu-kvm";
pub const GUEST_AGENT_CHANNEL: &str = "org.qemu.guest_agent.0";

/// Builds domain descriptors against a fixed configuration, capability set
/// and VIF table.
pub struct DomainBuilder<'a> {
    config: &'a AgentConfig,
    caps: &'a Capabilities,
    vifs: &'a VifRegistry,
}

impl<'a> DomainBuilder<'a> {
    pub fn new(config: &'a AgentConfig, caps: &'a Capabilities, vifs: &'a VifRegistry) -> Self {
        Self { config, caps, vifs }
    }

    pub fn build(&self, spec: &VmSpec) -> Result<DomainDescriptor> {
        validate(spec)?;

        let os = self.os_def(spec);
        let vcpu = VcpuDef {
            current: spec.vcpus,
            max: spec
                .vcpu_max_limit
                .filter(|&max| max >= spec.vcpus)
                .unwrap_or(spec.vcpus),
        };
        let features = self.features(spec, &os.firmware);

        let mut devices = vec![Device::Emulator(DEFAULT_EMULATOR.to_string())];
        devices.extend(self.disks(spec));
        devices.extend(self.controllers(spec, &os.machine));
        for nic in &spec.nics {
            devices.push(Device::Interface(self.vifs.plug(nic)?));
        }
        devices.extend(self.console_devices(spec));

        let memory = self.memory(spec);
        devices.push(Device::MemBalloon(MemBalloonDef {
            model: if memory.ballooning { "virtio" } else { "none" }.to_string(),
            stats_period_secs: self.config.get_u64(keys::MEMBALLOON_STATS_PERIOD, 0),
        }));

        let descriptor = DomainDescriptor {
            name: spec.name.clone(),
            uuid: spec.uuid,
            description: if spec.os.is_empty() {
                spec.name.clone()
            } else {
                spec.os.clone()
            },
            guest: GuestKind::Kvm,
            os,
            vcpu,
            cpu: self.cpu_def(spec),
            cputune: cpu_tune(spec),
            memory,
            features,
            clock: self.clock(spec),
            lifecycle: Lifecycle::default(),
            devices,
        };

        tracing::debug!(
            vm = %spec.name,
            machine = %descriptor.os.machine,
            uefi = descriptor.os.firmware.is_uefi(),
            devices = descriptor.devices.len(),
            "built domain descriptor"
        );
        Ok(descriptor)
    }

    fn os_def(&self, spec: &VmSpec) -> OsDef {
        let uefi_mode = match spec.detail(UEFI_KEY) {
            Some(value) => Some(match value.trim().to_ascii_lowercase().as_str() {
                "" | "legacy" => UefiMode::Legacy,
                "secure" => UefiMode::Secure,
                other => {
                    tracing::warn!(vm = %spec.name, value = other, "unknown UEFI mode, using legacy");
                    UefiMode::Legacy
                }
            }),
            None if spec.boot_mode == BootMode::Uefi => Some(UefiMode::Legacy),
            None => None,
        };

        let firmware = match uefi_mode {
            None => Firmware::Bios,
            Some(mode) => {
                let (loader_key, template_key) = match mode {
                    UefiMode::Legacy => (keys::LOADER_LEGACY, keys::NVRAM_TEMPLATE_LEGACY),
                    UefiMode::Secure => (keys::LOADER_SECURE, keys::NVRAM_TEMPLATE_SECURE),
                };
                let nvram_dir = self
                    .config
                    .get_or(keys::NVRAM_PATH, "/var/lib/libvirt/qemu/nvram");
                Firmware::Uefi {
                    mode,
                    loader: self.config.get(loader_key).map(String::from),
                    nvram: Some(format!("{}/{}.fd", nvram_dir.trim_end_matches('/'), spec.uuid)),
                    nvram_template: self.config.get(template_key).map(String::from),
                }
            }
        };

        OsDef {
            arch: "x86_64".to_string(),
            machine: if firmware.is_uefi() { "q35" } else { "pc" }.to_string(),
            firmware,
        }
    }

    fn features(&self, spec: &VmSpec, firmware: &Firmware) -> Features {
        let wanted = spec.is_windows()
            || spec
                .detail(GUEST_FEATURES_KEY)
                .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let secure = matches!(
            firmware,
            Firmware::Uefi {
                mode: UefiMode::Secure,
                ..
            }
        );

        let hyperv = (wanted && self.caps.hyperv_enlightenments).then_some(HypervFeatures {
            relaxed: true,
            vapic: true,
            spinlock_retries: HYPERV_SPINLOCK_RETRIES,
        });

        Features {
            acpi: wanted,
            apic: wanted,
            pae: wanted,
            smm: secure,
            hyperv,
        }
    }

    fn clock(&self, spec: &VmSpec) -> ClockDef {
        if spec.is_windows() {
            return ClockDef {
                offset: ClockOffset::Localtime,
                timers: vec!["hypervclock".to_string()],
            };
        }

        let mut timers = Vec::new();
        if self.caps.kvmclock && !self.config.get_bool(keys::KVMCLOCK_DISABLE, false) {
            timers.push("kvmclock".to_string());
        }
        ClockDef {
            offset: ClockOffset::Utc,
            timers,
        }
    }

    fn cpu_def(&self, spec: &VmSpec) -> CpuDef {
        let topology = self
            .config
            .get_bool(keys::CPU_TOPOLOGY_ENABLE, true)
            .then(|| {
                topology::resolve_from_details(
                    spec.detail(CORES_PER_SOCKET_KEY),
                    spec.detail(THREADS_PER_CORE_KEY),
                    spec.vcpus,
                )
            });
        let mode = self.config.get_or(keys::CPU_MODE, "host-model").to_string();
        let model = if mode == "custom" {
            self.config.get(keys::CPU_MODEL).map(String::from)
        } else {
            None
        };
        CpuDef {
            mode,
            model,
            topology,
        }
    }

    fn memory(&self, spec: &VmSpec) -> MemoryDef {
        let ballooning =
            spec.kind == VmKind::UserVm && !self.config.get_bool(keys::MEMBALLOON_DISABLE, false);
        let max_kib = spec.max_ram / 1024;
        let current_kib = if ballooning {
            spec.min_ram / 1024
        } else {
            max_kib
        };
        MemoryDef {
            max_kib,
            current_kib,
            ballooning,
        }
    }

    /// Disk definition for one spec disk, shared with hot-plug.
    pub fn disk_def(&self, disk: &DiskSpec) -> DiskDef {
        DiskDef {
            device: disk.device,
            source: DiskSource::from_path(&disk.path),
            format: disk.format,
            bus: disk.bus,
            target: target_dev(disk.bus, disk.device_id),
            serial: (!disk.label.is_empty()).then(|| disk.label.clone()),
            readonly: disk.readonly,
            iotune: if self.caps.io_throttling {
                disk.throttle.filter(|t| !t.is_empty())
            } else {
                None
            },
            io: self.caps.io_uring.then(|| "io_uring".to_string()),
            encryption_secret: disk.encryption.as_ref().map(|e| e.secret_uuid),
        }
    }

    fn disks(&self, spec: &VmSpec) -> Vec<Device> {
        let mut disks: Vec<&DiskSpec> = spec.disks.iter().collect();
        disks.sort_by_key(|d| (d.bus.device_prefix(), d.device_id));
        disks
            .into_iter()
            .map(|d| Device::Disk(self.disk_def(d)))
            .collect()
    }

    fn controllers(&self, spec: &VmSpec, machine: &str) -> Vec<Device> {
        let mut devices = Vec::new();
        if spec.disks.iter().any(|d| d.bus == DiskBus::Scsi) {
            devices.push(Device::Controller(ControllerDef {
                kind: "scsi".to_string(),
                model: "virtio-scsi".to_string(),
                queues: Some(spec.vcpus + 1),
            }));
        }
        devices.push(Device::Controller(ControllerDef {
            kind: "usb".to_string(),
            model: if machine == "q35" { "qemu-xhci" } else { "piix3-uhci" }.to_string(),
            queues: None,
        }));
        devices.push(Device::Input {
            kind: "tablet".to_string(),
            bus: "usb".to_string(),
        });
        devices
    }

    fn console_devices(&self, spec: &VmSpec) -> Vec<Device> {
        let channel_dir = self
            .config
            .get_or(keys::CHANNEL_DIR, "/var/lib/libvirt/qemu")
            .trim_end_matches('/');

        let mut devices = vec![
            Device::Serial,
            Device::Console,
            Device::Channel(ChannelDef {
                path: format!("{}/{}.{}", channel_dir, spec.name, GUEST_AGENT_CHANNEL),
                target_name: GUEST_AGENT_CHANNEL.to_string(),
            }),
            Device::Graphics(GraphicsDef {
                listen: self.config.get_or(keys::VNC_LISTEN, "0.0.0.0").to_string(),
                password: spec
                    .vnc_password
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .map(|p| p.chars().take(VNC_PASSWORD_MAX_LEN).collect()),
            }),
            Device::Watchdog(WatchdogDef {
                model: self.config.get_or(keys::WATCHDOG_MODEL, "i6300esb").to_string(),
                action: self.config.get_or(keys::WATCHDOG_ACTION, "reset").to_string(),
            }),
        ];

        if self.config.get_bool(keys::RNG_ENABLE, true) {
            devices.push(Device::Rng(RngDef {
                backend: "/dev/random".to_string(),
                rate_bytes: RNG_RATE_BYTES,
                rate_period_ms: RNG_RATE_PERIOD_MS,
            }));
        }
        devices
    }
}

fn validate(spec: &VmSpec) -> Result<()> {
    if spec.name.is_empty() {
        return Err(Error::invalid_request("vm name cannot be empty"));
    }
    if spec.vcpus == 0 {
        return Err(Error::invalid_request(format!("vm {} has no vcpus", spec.name)));
    }
    if spec.max_ram == 0 || spec.min_ram > spec.max_ram {
        return Err(Error::invalid_request(format!(
            "vm {} has invalid memory range {}..{}",
            spec.name, spec.min_ram, spec.max_ram
        )));
    }
    Ok(())
}

/// Quota and period scale with the percentage; quotas under [`MIN_QUOTA`]
/// are raised to it and the period stretched to keep the same ratio.
fn cpu_tune(spec: &VmSpec) -> CpuTune {
    let mut tune = CpuTune {
        shares: CPU_SHARES_BASELINE,
        quota: 0,
        period: 0,
    };

    let pct = match spec.cpu_quota_percentage {
        Some(p) if spec.limit_cpu_use && p > 0.0 => p.min(1.0),
        _ => return tune,
    };

    let quota = (DEFAULT_CPU_PERIOD as f64 * pct).round() as u64;
    if quota >= MIN_QUOTA {
        tune.quota = quota;
        tune.period = DEFAULT_CPU_PERIOD;
    } else {
        tune.quota = MIN_QUOTA;
        tune.period = ((MIN_QUOTA as f64 / pct).round() as u64).min(MAX_PERIOD);
    }
    tune
}

/// `vda`, `vdb`, ... `vdz`, `vdaa`, ...
pub fn target_dev(bus: DiskBus, index: u32) -> String {
    let mut suffix = Vec::new();
    let mut n = index as u64 + 1;
    while n > 0 {
        n -= 1;
        suffix.push(b'a' + (n % 26) as u8);
        n /= 26;
    }
    suffix.reverse();
    format!(
        "{}{}",
        bus.device_prefix(),
        String::from_utf8_lossy(&suffix)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HypervisorVersions, InterfaceKind};
    use hostagent_protocol::{DiskEncryption, DiskThrottle, NicSpec, TrafficType};
    use uuid::Uuid;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn config(pairs: &[(&str, &str)]) -> AgentConfig {
        AgentConfig::from_params(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
            .unwrap()
    }

    fn modern() -> Capabilities {
        Capabilities::from_versions(HypervisorVersions::new(8_000_000, 6_002_000))
    }

    fn ancient() -> Capabilities {
        Capabilities::from_versions(HypervisorVersions::new(9_000, 900_000))
    }

    fn spec() -> VmSpec {
        let mut spec = VmSpec::new("i-2-10-VM", 4, GIB, 2 * GIB);
        spec.uuid = Uuid::parse_str("5f0f2a56-9b1c-4b07-9a2a-0d1f3c2b8e11").unwrap();
        spec.os = "Ubuntu 22.04".into();
        spec
    }

    fn build_with(cfg: &AgentConfig, caps: &Capabilities, spec: &VmSpec) -> DomainDescriptor {
        let vifs = VifRegistry::configure(cfg).unwrap();
        DomainBuilder::new(cfg, caps, &vifs).build(spec).unwrap()
    }

    fn build(spec: &VmSpec) -> DomainDescriptor {
        build_with(&config(&[]), &modern(), spec)
    }

    #[test]
    fn test_default_is_bios_pc() {
        let d = build(&spec());
        assert_eq!(d.os.firmware, Firmware::Bios);
        assert_eq!(d.os.machine, "pc");
        assert!(!d.features.smm);
    }

    #[test]
    fn test_uefi_marker() {
        for (value, expected) in [
            ("", UefiMode::Legacy),
            ("legacy", UefiMode::Legacy),
            ("secure", UefiMode::Secure),
        ] {
            let mut s = spec();
            s.extra_config.insert(UEFI_KEY.into(), value.into());
            let cfg = config(&[
                (keys::LOADER_SECURE, "/usr/share/OVMF/OVMF_CODE.secboot.fd"),
                (keys::NVRAM_PATH, "/var/lib/nvram/"),
            ]);
            let d = build_with(&cfg, &modern(), &s);
            assert_eq!(d.os.machine, "q35");
            match &d.os.firmware {
                Firmware::Uefi {
                    mode, nvram, loader, ..
                } => {
                    assert_eq!(*mode, expected, "value {:?}", value);
                    assert_eq!(
                        nvram.as_deref(),
                        Some("/var/lib/nvram/5f0f2a56-9b1c-4b07-9a2a-0d1f3c2b8e11.fd")
                    );
                    assert_eq!(loader.is_some(), expected == UefiMode::Secure);
                }
                Firmware::Bios => panic!("expected uefi"),
            }
            assert_eq!(d.features.smm, expected == UefiMode::Secure);
        }
    }

    #[test]
    fn test_boot_mode_hint_selects_legacy_uefi() {
        let mut s = spec();
        s.boot_mode = BootMode::Uefi;
        let d = build(&s);
        assert!(matches!(
            d.os.firmware,
            Firmware::Uefi {
                mode: UefiMode::Legacy,
                ..
            }
        ));
    }

    #[test]
    fn test_windows_features_and_clock() {
        let mut s = spec();
        s.os = "Windows Server 2019 (64-bit)".into();
        let d = build(&s);
        assert!(d.features.acpi && d.features.apic && d.features.pae);
        assert!(d.features.hyperv.is_some());
        assert_eq!(d.clock.offset, ClockOffset::Localtime);
        assert!(d.clock.has_timer("hypervclock"));
        assert!(!d.clock.has_timer("kvmclock"));

        let d = build_with(&config(&[]), &ancient(), &s);
        assert!(d.features.acpi);
        assert!(d.features.hyperv.is_none());
    }

    #[test]
    fn test_linux_clock_depends_on_version() {
        let d = build(&spec());
        assert_eq!(d.clock.offset, ClockOffset::Utc);
        assert!(d.clock.has_timer("kvmclock"));
        assert!(!d.features.acpi);
        assert!(d.features.hyperv.is_none());

        let d = build_with(&config(&[]), &ancient(), &spec());
        assert!(d.clock.timers.is_empty());

        let d = build_with(&config(&[(keys::KVMCLOCK_DISABLE, "true")]), &modern(), &spec());
        assert!(d.clock.timers.is_empty());
    }

    #[test]
    fn test_explicit_features_request() {
        let mut s = spec();
        s.extra_config.insert(GUEST_FEATURES_KEY.into(), "true".into());
        let d = build(&s);
        assert!(d.features.acpi);
        assert_eq!(d.clock.offset, ClockOffset::Utc);
    }

    #[test]
    fn test_cpu_tune() {
        let mut s = spec();
        s.cpu_quota_percentage = Some(0.5);
        assert_eq!(cpu_tune(&s), CpuTune { shares: CPU_SHARES_BASELINE, quota: 0, period: 0 });

        s.limit_cpu_use = true;
        let tune = cpu_tune(&s);
        assert_eq!((tune.quota, tune.period), (5_000, DEFAULT_CPU_PERIOD));

        s.cpu_quota_percentage = Some(0.05);
        let tune = cpu_tune(&s);
        assert_eq!(tune.quota, MIN_QUOTA);
        assert_eq!(tune.period, 20_000);

        s.cpu_quota_percentage = Some(0.0001);
        assert_eq!(cpu_tune(&s).period, MAX_PERIOD);

        s.cpu_quota_percentage = None;
        assert!(!cpu_tune(&s).is_limited());
    }

    #[test]
    fn test_memory_ballooning() {
        let d = build(&spec());
        assert_eq!(d.memory.max_kib, 2 * 1024 * 1024);
        assert_eq!(d.memory.current_kib, 1024 * 1024);
        assert!(d.memory.ballooning);

        let d = build_with(&config(&[(keys::MEMBALLOON_DISABLE, "true")]), &modern(), &spec());
        assert_eq!(d.memory.current_kib, d.memory.max_kib);
        assert!(d.devices.contains(&Device::MemBalloon(MemBalloonDef {
            model: "none".into(),
            stats_period_secs: 0
        })));

        let mut router = spec();
        router.kind = VmKind::DomainRouter;
        let d = build(&router);
        assert_eq!(d.memory.current_kib, d.memory.max_kib);
    }

    #[test]
    fn test_vcpu_max_limit() {
        let mut s = spec();
        assert_eq!(build(&s).vcpu, VcpuDef { current: 4, max: 4 });
        s.vcpu_max_limit = Some(16);
        assert_eq!(build(&s).vcpu, VcpuDef { current: 4, max: 16 });
    }

    #[test]
    fn test_topology_from_details() {
        let mut s = spec();
        s.vcpus = 8;
        s.extra_config.insert(CORES_PER_SOCKET_KEY.into(), "2".into());
        s.extra_config.insert(THREADS_PER_CORE_KEY.into(), "2".into());
        let topo = build(&s).cpu.topology.unwrap();
        assert_eq!(topo.as_tuple(), (2, 2, 2));

        let cfg = config(&[(keys::CPU_TOPOLOGY_ENABLE, "false")]);
        assert!(build_with(&cfg, &modern(), &s).cpu.topology.is_none());
    }

    #[test]
    fn test_disks_and_scsi_queues() {
        let mut s = spec();
        s.disks = vec![
            DiskSpec {
                label: "ROOT-10".into(),
                device_id: 0,
                path: "/mnt/pool/root.qcow2".into(),
                bus: DiskBus::Scsi,
                device: Default::default(),
                format: Default::default(),
                readonly: false,
                throttle: Some(DiskThrottle {
                    read_iops: 500,
                    ..Default::default()
                }),
                encryption: Some(DiskEncryption {
                    secret_uuid: Uuid::nil(),
                }),
            },
            DiskSpec {
                label: "DATA-11".into(),
                device_id: 1,
                path: "/dev/sdz".into(),
                bus: DiskBus::Virtio,
                device: Default::default(),
                format: hostagent_protocol::DiskFormat::Raw,
                readonly: false,
                throttle: None,
                encryption: None,
            },
        ];

        let d = build(&s);
        let disks: Vec<&DiskDef> = d.disks().collect();
        assert_eq!(disks.len(), 2);
        let root = disks.iter().find(|d| d.target == "sda").unwrap();
        assert_eq!(root.iotune.unwrap().read_iops, 500);
        assert_eq!(root.io.as_deref(), Some("io_uring"));
        assert_eq!(root.encryption_secret, Some(Uuid::nil()));
        let data = disks.iter().find(|d| d.target == "vdb").unwrap();
        assert_eq!(data.source, DiskSource::Block("/dev/sdz".into()));

        let scsi = d
            .find_device(|dev| matches!(dev, Device::Controller(c) if c.kind == "scsi"))
            .unwrap();
        assert!(matches!(scsi, Device::Controller(c) if c.queues == Some(5)));

        let old = build_with(&config(&[]), &ancient(), &s);
        assert!(old.disks().all(|d| d.iotune.is_none() && d.io.is_none()));
    }

    #[test]
    fn test_no_scsi_controller_without_scsi_disks() {
        let d = build(&spec());
        assert!(d
            .find_device(|dev| matches!(dev, Device::Controller(c) if c.kind == "scsi"))
            .is_none());
    }

    #[test]
    fn test_nics_use_vif_registry() {
        let mut s = spec();
        s.nics = vec![
            NicSpec {
                device_id: 0,
                mac: "02:00:00:00:00:01".into(),
                traffic_type: TrafficType::Guest,
                vlan: Some(300),
                network_rate_mbps: None,
                model: None,
            },
            NicSpec {
                device_id: 1,
                mac: "02:00:00:00:00:02".into(),
                traffic_type: TrafficType::Public,
                vlan: None,
                network_rate_mbps: None,
                model: None,
            },
        ];
        let cfg = config(&[("libvirt.vif.driver.Guest", "OvsVifDriver")]);
        let d = build_with(&cfg, &modern(), &s);
        let nics: Vec<_> = d.interfaces().collect();
        assert_eq!(nics[0].virtualport.as_deref(), Some("openvswitch"));
        assert_eq!(nics[1].virtualport, None);
        assert_eq!(
            nics[1].kind,
            InterfaceKind::Bridge {
                bridge: "cloudbr0".into()
            }
        );
    }

    #[test]
    fn test_console_devices() {
        let mut s = spec();
        s.vnc_password = Some("supersecretpassword".into());
        let d = build(&s);

        let graphics = d
            .find_device(|dev| matches!(dev, Device::Graphics(_)))
            .unwrap();
        assert!(matches!(graphics, Device::Graphics(g) if g.password.as_deref() == Some("supersec")));

        let channel = d.find_device(|dev| matches!(dev, Device::Channel(_))).unwrap();
        assert!(matches!(
            channel,
            Device::Channel(c) if c.path == "/var/lib/libvirt/qemu/i-2-10-VM.org.qemu.guest_agent.0"
        ));
        assert!(d.devices.contains(&Device::Serial));
        assert!(d.devices.contains(&Device::Console));
        assert!(d.devices.contains(&Device::Watchdog(WatchdogDef {
            model: "i6300esb".into(),
            action: "reset".into()
        })));
        assert!(d.find_device(|dev| matches!(dev, Device::Rng(_))).is_some());

        let d = build_with(&config(&[(keys::RNG_ENABLE, "false")]), &modern(), &s);
        assert!(d.find_device(|dev| matches!(dev, Device::Rng(_))).is_none());
    }

    #[test]
    fn test_invalid_specs() {
        let cfg = config(&[]);
        let vifs = VifRegistry::configure(&cfg).unwrap();
        let caps = modern();
        let builder = DomainBuilder::new(&cfg, &caps, &vifs);

        let mut s = spec();
        s.vcpus = 0;
        assert!(matches!(builder.build(&s), Err(Error::InvalidRequest(_))));

        let mut s = spec();
        s.min_ram = 4 * GIB;
        assert!(matches!(builder.build(&s), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_build_is_deterministic_and_serializes() {
        let mut s = spec();
        s.extra_config.insert(UEFI_KEY.into(), "secure".into());
        let a = build(&s);
        let b = build(&s);
        assert_eq!(a, b);

        let xml = a.to_xml();
        assert_eq!(xml, b.to_xml());
        assert!(xml.starts_with("<domain type='kvm'>"));
        assert!(xml.contains("<name>i-2-10-VM</name>"));
        assert!(xml.contains("machine='q35'"));
        assert!(xml.contains("<smm state='on'/>"));
        assert!(xml.contains("<vcpu current='4'>4</vcpu>"));
        assert!(xml.contains("<on_reboot>restart</on_reboot>"));
        assert!(!xml.contains("<quota>"));
    }

    #[test]
    fn test_target_dev() {
        assert_eq!(target_dev(DiskBus::Virtio, 0), "vda");
        assert_eq!(target_dev(DiskBus::Scsi, 25), "sdz");
        assert_eq!(target_dev(DiskBus::Ide, 26), "hdaa");
    }
}
