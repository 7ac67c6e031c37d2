//! Domain XML serialization.

use super::{
    ClockOffset, Device, DiskDef, DiskSource, DomainDescriptor, Firmware, InterfaceDef,
    InterfaceKind, UefiMode,
};
use hostagent_protocol::DiskDevice;
use std::fmt::Write;

/// Minimal indenting XML writer.
struct XmlWriter {
    out: String,
    depth: usize,
}

impl XmlWriter {
    fn new() -> Self {
        Self {
            out: String::with_capacity(4096),
            depth: 0,
        }
    }

    fn start_line(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
    }

    fn write_tag(&mut self, name: &str, attrs: &[(&str, &str)]) {
        self.out.push('<');
        self.out.push_str(name);
        for (k, v) in attrs {
            let _ = write!(self.out, " {}='{}'", k, escape(v));
        }
    }

    fn open(&mut self, name: &str, attrs: &[(&str, &str)]) {
        self.start_line();
        self.write_tag(name, attrs);
        self.out.push_str(">\n");
        self.depth += 1;
    }

    fn close(&mut self, name: &str) {
        self.depth = self.depth.saturating_sub(1);
        self.start_line();
        let _ = writeln!(self.out, "</{}>", name);
    }

    fn empty(&mut self, name: &str, attrs: &[(&str, &str)]) {
        self.start_line();
        self.write_tag(name, attrs);
        self.out.push_str("/>\n");
    }

    fn text(&mut self, name: &str, attrs: &[(&str, &str)], text: &str) {
        self.start_line();
        self.write_tag(name, attrs);
        let _ = writeln!(self.out, ">{}</{}>", escape(text), name);
    }

    fn finish(self) -> String {
        self.out
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\'' => out.push_str("&apos;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

pub(super) fn domain_xml(d: &DomainDescriptor) -> String {
    let mut w = XmlWriter::new();
    w.open("domain", &[("type", d.guest.as_str())]);
    w.text("name", &[], &d.name);
    w.text("uuid", &[], &d.uuid.to_string());
    w.text("description", &[], &d.description);

    write_os(&mut w, d);

    w.text("memory", &[("unit", "KiB")], &d.memory.max_kib.to_string());
    w.text(
        "currentMemory",
        &[("unit", "KiB")],
        &d.memory.current_kib.to_string(),
    );
    w.text(
        "vcpu",
        &[("current", &d.vcpu.current.to_string())],
        &d.vcpu.max.to_string(),
    );

    w.open("cputune", &[]);
    w.text("shares", &[], &d.cputune.shares.to_string());
    if d.cputune.is_limited() {
        w.text("quota", &[], &d.cputune.quota.to_string());
        w.text("period", &[], &d.cputune.period.to_string());
    }
    w.close("cputune");

    match (&d.cpu.model, &d.cpu.topology) {
        (None, None) => w.empty("cpu", &[("mode", &d.cpu.mode)]),
        (model, topology) => {
            w.open("cpu", &[("mode", &d.cpu.mode)]);
            if let Some(model) = model {
                w.text("model", &[("fallback", "allow")], model);
            }
            if let Some(t) = topology {
                w.empty(
                    "topology",
                    &[
                        ("sockets", &t.sockets.to_string()),
                        ("cores", &t.cores.to_string()),
                        ("threads", &t.threads.to_string()),
                    ],
                );
            }
            w.close("cpu");
        }
    }

    write_features(&mut w, d);

    let offset = match d.clock.offset {
        ClockOffset::Utc => "utc",
        ClockOffset::Localtime => "localtime",
    };
    if d.clock.timers.is_empty() {
        w.empty("clock", &[("offset", offset)]);
    } else {
        w.open("clock", &[("offset", offset)]);
        for timer in &d.clock.timers {
            w.empty("timer", &[("name", timer), ("present", "yes")]);
        }
        w.close("clock");
    }

    w.text("on_poweroff", &[], d.lifecycle.on_poweroff.as_str());
    w.text("on_reboot", &[], d.lifecycle.on_reboot.as_str());
    w.text("on_crash", &[], d.lifecycle.on_crash.as_str());

    w.open("devices", &[]);
    for device in &d.devices {
        write_device(&mut w, device);
    }
    w.close("devices");

    w.close("domain");
    w.finish()
}

fn write_os(w: &mut XmlWriter, d: &DomainDescriptor) {
    w.open("os", &[]);
    w.text(
        "type",
        &[("arch", &d.os.arch), ("machine", &d.os.machine)],
        "hvm",
    );
    if let Firmware::Uefi {
        mode,
        loader,
        nvram,
        nvram_template,
    } = &d.os.firmware
    {
        let secure = match mode {
            UefiMode::Secure => "yes",
            UefiMode::Legacy => "no",
        };
        if let Some(loader) = loader {
            w.text(
                "loader",
                &[("readonly", "yes"), ("secure", secure), ("type", "pflash")],
                loader,
            );
        }
        if let Some(nvram) = nvram {
            match nvram_template {
                Some(template) => w.text("nvram", &[("template", template)], nvram),
                None => w.text("nvram", &[], nvram),
            }
        }
    }
    w.empty("boot", &[("dev", "cdrom")]);
    w.empty("boot", &[("dev", "hd")]);
    w.close("os");
}

fn write_features(w: &mut XmlWriter, d: &DomainDescriptor) {
    let f = &d.features;
    if !(f.acpi || f.apic || f.pae || f.smm || f.hyperv.is_some()) {
        return;
    }
    w.open("features", &[]);
    if f.acpi {
        w.empty("acpi", &[]);
    }
    if f.apic {
        w.empty("apic", &[]);
    }
    if f.pae {
        w.empty("pae", &[]);
    }
    if f.smm {
        w.empty("smm", &[("state", "on")]);
    }
    if let Some(hv) = &f.hyperv {
        w.open("hyperv", &[]);
        w.empty("relaxed", &[("state", if hv.relaxed { "on" } else { "off" })]);
        w.empty("vapic", &[("state", if hv.vapic { "on" } else { "off" })]);
        w.empty(
            "spinlocks",
            &[("state", "on"), ("retries", &hv.spinlock_retries.to_string())],
        );
        w.close("hyperv");
    }
    w.close("features");
}

fn write_disk(w: &mut XmlWriter, disk: &DiskDef) {
    let (disk_type, source_attr, source_path) = match &disk.source {
        DiskSource::File(p) => ("file", "file", p.as_str()),
        DiskSource::Block(p) => ("block", "dev", p.as_str()),
    };
    let device = match disk.device {
        DiskDevice::Disk => "disk",
        DiskDevice::Cdrom => "cdrom",
    };
    w.open("disk", &[("type", disk_type), ("device", device)]);

    let mut driver: Vec<(&str, &str)> = vec![
        ("name", "qemu"),
        ("type", disk.format.as_str()),
        ("cache", "none"),
    ];
    if let Some(io) = &disk.io {
        driver.push(("io", io.as_str()));
    }
    w.empty("driver", &driver);
    w.empty("source", &[(source_attr, source_path)]);
    w.empty("target", &[("dev", &disk.target), ("bus", disk.bus.as_str())]);
    if disk.readonly {
        w.empty("readonly", &[]);
    }
    if let Some(serial) = &disk.serial {
        w.text("serial", &[], serial);
    }
    if let Some(iotune) = disk.iotune.filter(|t| !t.is_empty()) {
        w.open("iotune", &[]);
        let limits = [
            ("read_iops_sec", iotune.read_iops),
            ("write_iops_sec", iotune.write_iops),
            ("read_bytes_sec", iotune.read_bytes_sec),
            ("write_bytes_sec", iotune.write_bytes_sec),
        ];
        for (name, value) in limits {
            if value > 0 {
                w.text(name, &[], &value.to_string());
            }
        }
        w.close("iotune");
    }
    if let Some(secret) = &disk.encryption_secret {
        w.open("encryption", &[("format", "luks")]);
        w.empty(
            "secret",
            &[("type", "passphrase"), ("uuid", &secret.to_string())],
        );
        w.close("encryption");
    }
    w.close("disk");
}

fn write_interface(w: &mut XmlWriter, nic: &InterfaceDef) {
    match &nic.kind {
        InterfaceKind::Bridge { bridge } => {
            w.open("interface", &[("type", "bridge")]);
            w.empty("source", &[("bridge", bridge)]);
        }
        InterfaceKind::Direct { device, mode } => {
            w.open("interface", &[("type", "direct")]);
            w.empty("source", &[("dev", device), ("mode", mode)]);
        }
    }
    w.empty("mac", &[("address", &nic.mac)]);
    w.empty("model", &[("type", nic.model.as_str())]);
    if let Some(target) = &nic.target_dev {
        w.empty("target", &[("dev", target)]);
    }
    if let Some(port) = &nic.virtualport {
        w.empty("virtualport", &[("type", port)]);
    }
    if let Some(vlan) = nic.vlan {
        w.open("vlan", &[]);
        w.empty("tag", &[("id", &vlan.to_string())]);
        w.close("vlan");
    }
    if let Some(rate) = nic.bandwidth_kbps {
        let rate = rate.to_string();
        w.open("bandwidth", &[]);
        w.empty("inbound", &[("average", &rate), ("peak", &rate)]);
        w.empty("outbound", &[("average", &rate), ("peak", &rate)]);
        w.close("bandwidth");
    }
    w.close("interface");
}

fn write_device(w: &mut XmlWriter, device: &Device) {
    match device {
        Device::Emulator(path) => w.text("emulator", &[], path),
        Device::Disk(disk) => write_disk(w, disk),
        Device::Controller(c) => match c.queues {
            Some(queues) => {
                w.open("controller", &[("type", &c.kind), ("model", &c.model)]);
                w.empty("driver", &[("queues", &queues.to_string())]);
                w.close("controller");
            }
            None => w.empty("controller", &[("type", &c.kind), ("model", &c.model)]),
        },
        Device::Input { kind, bus } => w.empty("input", &[("type", kind), ("bus", bus)]),
        Device::Interface(nic) => write_interface(w, nic),
        Device::Serial => {
            w.open("serial", &[("type", "pty")]);
            w.empty("target", &[("port", "0")]);
            w.close("serial");
        }
        Device::Console => {
            w.open("console", &[("type", "pty")]);
            w.empty("target", &[("type", "serial"), ("port", "0")]);
            w.close("console");
        }
        Device::Channel(ch) => {
            w.open("channel", &[("type", "unix")]);
            w.empty("source", &[("mode", "bind"), ("path", &ch.path)]);
            w.empty("target", &[("type", "virtio"), ("name", &ch.target_name)]);
            w.close("channel");
        }
        Device::Graphics(g) => {
            let mut attrs: Vec<(&str, &str)> = vec![
                ("type", "vnc"),
                ("autoport", "yes"),
                ("listen", g.listen.as_str()),
            ];
            if let Some(pw) = &g.password {
                attrs.push(("passwd", pw.as_str()));
            }
            w.open("graphics", &attrs);
            w.empty("listen", &[("type", "address"), ("address", &g.listen)]);
            w.close("graphics");
        }
        Device::Watchdog(wd) => w.empty("watchdog", &[("model", &wd.model), ("action", &wd.action)]),
        Device::Rng(rng) => {
            w.open("rng", &[("model", "virtio")]);
            w.empty(
                "rate",
                &[
                    ("period", &rng.rate_period_ms.to_string()),
                    ("bytes", &rng.rate_bytes.to_string()),
                ],
            );
            w.text("backend", &[("model", "random")], &rng.backend);
            w.close("rng");
        }
        Device::MemBalloon(b) => {
            if b.model != "none" && b.stats_period_secs > 0 {
                w.open("memballoon", &[("model", &b.model)]);
                w.empty("stats", &[("period", &b.stats_period_secs.to_string())]);
                w.close("memballoon");
            } else {
                w.empty("memballoon", &[("model", &b.model)]);
            }
        }
    }
}

/// Serialize a single device, as used by hot-plug calls.
pub fn device_xml(device: &Device) -> String {
    let mut w = XmlWriter::new();
    write_device(&mut w, device);
    w.finish()
}
