//! `virsh` command-line backend.

use super::Hypervisor;
use crate::domain::HypervisorVersions;
use crate::error::{Error, Result};
use crate::migration::{MigrateFlags, MigrateParameterSet, PARAM_DEST_NAME, PARAM_DEST_XML, PARAM_URI};
use hostagent_protocol::{DomainState, DomainStats, HostStats};
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::OnceLock;

/// Hypervisor backend driving the `virsh` binary.
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    binary: String,
    uri: String,
}

impl VirshHypervisor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            binary: "virsh".to_string(),
            uri: uri.into(),
        }
    }

    /// Use a different `virsh` executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn run(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        tracing::debug!(uri = %self.uri, args = ?args, "running virsh");
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-c")
            .arg(&self.uri)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::hypervisor(format!("failed to run {}: {}", self.binary, e)))?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::hypervisor(format!(
                "virsh {} failed: {}",
                args.first().copied().unwrap_or(""),
                stderr
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a command against one domain, mapping lookup failures.
    fn run_domain(&self, args: &[&str], name: &str, stdin: Option<&str>) -> Result<String> {
        self.run(args, stdin).map_err(|e| match e {
            Error::Hypervisor(msg) if is_not_found(&msg) => Error::domain_not_found(name),
            other => other,
        })
    }
}

fn is_not_found(msg: &str) -> bool {
    msg.contains("Domain not found") || msg.contains("failed to get domain")
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^(Using library|Running hypervisor):\s+\S+\s+([0-9.]+)")
            .expect("valid regex")
    })
}

fn key_value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z0-9_.]+)=(.*)$").expect("valid regex"))
}

fn node_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([A-Za-z() ]+?)\s*:\s+(\d+)").expect("valid regex"))
}

/// Parse `virsh version` output.
pub fn parse_version(output: &str) -> Result<HypervisorVersions> {
    let mut library = None;
    let mut hypervisor = None;
    for caps in version_re().captures_iter(output) {
        let encoded = HypervisorVersions::encode(&caps[2]);
        match &caps[1] {
            "Using library" => library = encoded,
            _ => hypervisor = encoded,
        }
    }
    match (library, hypervisor) {
        (Some(library), Some(hypervisor)) => Ok(HypervisorVersions::new(library, hypervisor)),
        _ => Err(Error::hypervisor(format!(
            "unrecognised version output: {}",
            output.trim()
        ))),
    }
}

/// Parse `virsh domstate` output.
pub fn parse_state(output: &str) -> DomainState {
    match output.trim() {
        "running" | "idle" => DomainState::Running,
        "paused" | "pmsuspended" => DomainState::Paused,
        "in shutdown" => DomainState::Shutdown,
        "shut off" => DomainState::Shutoff,
        "crashed" => DomainState::Crashed,
        _ => DomainState::Unknown,
    }
}

/// Parse `virsh domstats --raw` output for one domain.
pub fn parse_domstats(name: &str, output: &str) -> DomainStats {
    let values: BTreeMap<&str, u64> = output
        .lines()
        .filter_map(|line| key_value_re().captures(line))
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str();
            let value = caps.get(2)?.as_str().trim().parse().ok()?;
            Some((key, value))
        })
        .collect();

    // Sum `<prefix>.<n>.<suffix>` over all device indexes.
    let sum = |prefix: &str, suffix: &str| -> u64 {
        values
            .iter()
            .filter(|(k, _)| {
                k.strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix('.'))
                    .and_then(|rest| rest.split_once('.'))
                    .is_some_and(|(idx, rest)| idx.parse::<u32>().is_ok() && rest == suffix)
            })
            .map(|(_, v)| *v)
            .sum()
    };

    DomainStats {
        name: name.to_string(),
        vcpus: values.get("vcpu.current").copied().unwrap_or(0) as u32,
        cpu_time_ns: values.get("cpu.time").copied().unwrap_or(0),
        memory_kib: values.get("balloon.current").copied().unwrap_or(0),
        memory_unused_kib: values.get("balloon.unused").copied(),
        disk_read_bytes: sum("block", "rd.bytes"),
        disk_write_bytes: sum("block", "wr.bytes"),
        net_rx_bytes: sum("net", "rx.bytes"),
        net_tx_bytes: sum("net", "tx.bytes"),
    }
}

/// Parse `virsh nodeinfo` and `virsh nodememstats` output.
pub fn parse_host_stats(nodeinfo: &str, memstats: &str) -> HostStats {
    let fields = |text: &str| -> BTreeMap<String, u64> {
        text.lines()
            .filter_map(|line| node_line_re().captures(line))
            .filter_map(|caps| Some((caps[1].trim().to_string(), caps[2].parse().ok()?)))
            .collect()
    };
    let info = fields(nodeinfo);
    let mem = fields(memstats);

    HostStats {
        cpus: info.get("CPU(s)").copied().unwrap_or(0) as u32,
        cpu_mhz: info.get("CPU frequency").copied().unwrap_or(0) as u32,
        total_memory_kib: mem
            .get("total")
            .or_else(|| info.get("Memory size"))
            .copied()
            .unwrap_or(0),
        free_memory_kib: mem.get("free").copied().unwrap_or(0),
    }
}

impl Hypervisor for VirshHypervisor {
    fn versions(&self) -> Result<HypervisorVersions> {
        parse_version(&self.run(&["version"], None)?)
    }

    fn define_domain(&self, xml: &str) -> Result<()> {
        self.run(&["define", "/dev/stdin"], Some(xml))?;
        Ok(())
    }

    fn start_domain(&self, name: &str) -> Result<()> {
        self.run_domain(&["start", name], name, None)?;
        Ok(())
    }

    fn stop_domain(&self, name: &str, force: bool) -> Result<()> {
        let verb = if force { "destroy" } else { "shutdown" };
        self.run_domain(&[verb, name], name, None)?;
        Ok(())
    }

    fn reboot_domain(&self, name: &str) -> Result<()> {
        self.run_domain(&["reboot", name], name, None)?;
        Ok(())
    }

    fn suspend_domain(&self, name: &str) -> Result<()> {
        self.run_domain(&["suspend", name], name, None)?;
        Ok(())
    }

    fn resume_domain(&self, name: &str) -> Result<()> {
        self.run_domain(&["resume", name], name, None)?;
        Ok(())
    }

    fn domain_state(&self, name: &str) -> Result<Option<DomainState>> {
        match self.run_domain(&["domstate", name], name, None) {
            Ok(out) => Ok(Some(parse_state(&out))),
            Err(Error::DomainNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn domain_xml(&self, name: &str) -> Result<String> {
        self.run_domain(&["dumpxml", name], name, None)
    }

    fn attach_device(&self, name: &str, xml: &str) -> Result<()> {
        self.run_domain(
            &["attach-device", name, "/dev/stdin", "--live", "--config"],
            name,
            Some(xml),
        )?;
        Ok(())
    }

    fn detach_device(&self, name: &str, xml: &str) -> Result<()> {
        self.run_domain(
            &["detach-device", name, "/dev/stdin", "--live", "--config"],
            name,
            Some(xml),
        )?;
        Ok(())
    }

    fn migrate(
        &self,
        name: &str,
        dest_uri: &str,
        params: &MigrateParameterSet,
        flags: &MigrateFlags,
    ) -> Result<()> {
        // `--xml` only takes a file. Created 0600 and removed on drop.
        let xml_file = match params.get_str(PARAM_DEST_XML) {
            Some(xml) => {
                let mut file = tempfile::Builder::new()
                    .prefix("hostagent-migrate-")
                    .suffix(".xml")
                    .tempfile()?;
                file.write_all(xml.as_bytes())?;
                file.flush()?;
                Some(file)
            }
            None => None,
        };
        let xml_arg = xml_file
            .as_ref()
            .map(|f| f.path().display().to_string());

        let bandwidth = params.bandwidth().to_string();
        let disks = params.migrate_disks().join(",");

        let mut args: Vec<&str> = vec!["migrate"];
        if flags.live {
            args.push("--live");
        }
        if flags.persist_destination {
            args.push("--persistent");
        }
        if flags.undefine_source {
            args.push("--undefinesource");
        }
        if flags.auto_converge {
            args.push("--auto-converge");
        }
        if flags.non_shared_disk {
            args.push("--copy-storage-all");
        }
        args.extend([name, dest_uri]);
        if let Some(uri) = params.get_str(PARAM_URI) {
            args.extend(["--migrateuri", uri]);
        }
        if let Some(dname) = params.get_str(PARAM_DEST_NAME) {
            args.extend(["--dname", dname]);
        }
        if let Some(path) = xml_arg.as_deref() {
            args.extend(["--xml", path]);
        }
        if params.bandwidth() > 0 {
            args.extend(["--bandwidth", bandwidth.as_str()]);
        }
        if !disks.is_empty() {
            args.extend(["--migrate-disks", disks.as_str()]);
        }

        let result = self.run_domain(&args, name, None);
        drop(xml_file);
        result.map(|_| ()).map_err(|e| match e {
            Error::Hypervisor(msg) => Error::migration(msg),
            other => other,
        })
    }

    fn abort_job(&self, name: &str) -> Result<()> {
        self.run_domain(&["domjobabort", name], name, None)?;
        Ok(())
    }

    fn domain_stats(&self, name: &str) -> Result<DomainStats> {
        let out = self.run_domain(&["domstats", "--raw", name], name, None)?;
        Ok(parse_domstats(name, &out))
    }

    fn host_stats(&self) -> Result<HostStats> {
        let info = self.run(&["nodeinfo"], None)?;
        let mem = self.run(&["nodememstats"], None)?;
        Ok(parse_host_stats(&info, &mem))
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        let out = self.run(&["list", "--name"], None)?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}
