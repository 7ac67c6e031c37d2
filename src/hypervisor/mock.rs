//! In-memory hypervisor.
//!
//! Keeps domains in a map, records every call, and can be told to fail any
//! operation by name. Used by handler tests and by `hostagent render`-style
//! tooling that must not touch a real host.

use super::Hypervisor;
use crate::domain::HypervisorVersions;
use crate::error::{Error, Result};
use crate::migration::{MigrateFlags, MigrateParameterSet};
use hostagent_protocol::{DomainState, DomainStats, HostStats};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct MockDomain {
    xml: String,
    state: DomainState,
    devices: Vec<String>,
}

/// A recorded migration call.
#[derive(Debug, Clone)]
pub struct MigrationCall {
    pub name: String,
    pub dest_uri: String,
    pub params: MigrateParameterSet,
    pub flags: MigrateFlags,
}

#[derive(Debug, Default)]
struct Inner {
    domains: BTreeMap<String, MockDomain>,
    failures: HashMap<&'static str, String>,
    calls: Vec<String>,
    migrations: Vec<MigrationCall>,
    migrate_duration: Duration,
}

#[derive(Debug)]
pub struct MockHypervisor {
    versions: Mutex<HypervisorVersions>,
    inner: Mutex<Inner>,
    abort: AtomicBool,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new(HypervisorVersions::new(8_000_000, 6_002_000))
    }
}

impl MockHypervisor {
    pub fn new(versions: HypervisorVersions) -> Self {
        Self {
            versions: Mutex::new(versions),
            inner: Mutex::new(Inner::default()),
            abort: AtomicBool::new(false),
        }
    }

    /// Make every call to `op` fail with `message` until cleared.
    pub fn fail_on(&self, op: &'static str, message: impl Into<String>) {
        self.inner.lock().failures.insert(op, message.into());
    }

    pub fn clear_failure(&self, op: &'static str) {
        self.inner.lock().failures.remove(op);
    }

    /// How long `migrate` blocks before completing.
    pub fn set_migrate_duration(&self, duration: Duration) {
        self.inner.lock().migrate_duration = duration;
    }

    pub fn set_versions(&self, versions: HypervisorVersions) {
        *self.versions.lock() = versions;
    }

    /// Insert a domain directly.
    pub fn add_domain(&self, name: &str, state: DomainState) {
        self.inner.lock().domains.insert(
            name.to_string(),
            MockDomain {
                xml: format!("<domain type='kvm'>\n  <name>{}</name>\n</domain>\n", name),
                state,
                devices: Vec::new(),
            },
        );
    }

    pub fn state_of(&self, name: &str) -> Option<DomainState> {
        self.inner.lock().domains.get(name).map(|d| d.state)
    }

    pub fn devices_of(&self, name: &str) -> Vec<String> {
        self.inner
            .lock()
            .domains
            .get(name)
            .map(|d| d.devices.clone())
            .unwrap_or_default()
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().calls.clone()
    }

    pub fn migrations(&self) -> Vec<MigrationCall> {
        self.inner.lock().migrations.clone()
    }

    fn enter(&self, op: &'static str) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let mut inner = self.inner.lock();
        inner.calls.push(op.to_string());
        match inner.failures.get(op) {
            Some(msg) => Err(Error::hypervisor(msg.clone())),
            None => Ok(inner),
        }
    }

    fn with_domain<T>(
        &self,
        op: &'static str,
        name: &str,
        f: impl FnOnce(&mut MockDomain) -> Result<T>,
    ) -> Result<T> {
        let mut inner = self.enter(op)?;
        let domain = inner
            .domains
            .get_mut(name)
            .ok_or_else(|| Error::domain_not_found(name))?;
        f(domain)
    }
}

fn name_from_xml(xml: &str) -> Option<&str> {
    let start = xml.find("<name>")? + "<name>".len();
    let end = xml[start..].find("</name>")? + start;
    Some(xml[start..end].trim())
}

impl Hypervisor for MockHypervisor {
    fn versions(&self) -> Result<HypervisorVersions> {
        drop(self.enter("versions")?);
        Ok(*self.versions.lock())
    }

    fn define_domain(&self, xml: &str) -> Result<()> {
        let mut inner = self.enter("define_domain")?;
        let name = name_from_xml(xml)
            .ok_or_else(|| Error::invalid_request("domain xml has no name"))?
            .to_string();
        let state = inner
            .domains
            .get(&name)
            .map(|d| d.state)
            .unwrap_or(DomainState::Shutoff);
        inner.domains.insert(
            name,
            MockDomain {
                xml: xml.to_string(),
                state,
                devices: Vec::new(),
            },
        );
        Ok(())
    }

    fn start_domain(&self, name: &str) -> Result<()> {
        self.with_domain("start_domain", name, |d| {
            d.state = DomainState::Running;
            Ok(())
        })
    }

    fn stop_domain(&self, name: &str, _force: bool) -> Result<()> {
        self.with_domain("stop_domain", name, |d| {
            d.state = DomainState::Shutoff;
            Ok(())
        })
    }

    fn reboot_domain(&self, name: &str) -> Result<()> {
        self.with_domain("reboot_domain", name, |d| match d.state {
            DomainState::Running => Ok(()),
            other => Err(Error::hypervisor(format!("domain is not running ({:?})", other))),
        })
    }

    fn suspend_domain(&self, name: &str) -> Result<()> {
        self.with_domain("suspend_domain", name, |d| {
            d.state = DomainState::Paused;
            Ok(())
        })
    }

    fn resume_domain(&self, name: &str) -> Result<()> {
        self.with_domain("resume_domain", name, |d| match d.state {
            DomainState::Paused => {
                d.state = DomainState::Running;
                Ok(())
            }
            other => Err(Error::hypervisor(format!("domain is not paused ({:?})", other))),
        })
    }

    fn domain_state(&self, name: &str) -> Result<Option<DomainState>> {
        let inner = self.enter("domain_state")?;
        Ok(inner.domains.get(name).map(|d| d.state))
    }

    fn domain_xml(&self, name: &str) -> Result<String> {
        self.with_domain("domain_xml", name, |d| Ok(d.xml.clone()))
    }

    fn attach_device(&self, name: &str, xml: &str) -> Result<()> {
        self.with_domain("attach_device", name, |d| {
            d.devices.push(xml.to_string());
            Ok(())
        })
    }

    fn detach_device(&self, name: &str, xml: &str) -> Result<()> {
        self.with_domain("detach_device", name, |d| {
            match d.devices.iter().position(|dev| dev == xml) {
                Some(idx) => {
                    d.devices.remove(idx);
                    Ok(())
                }
                None => Err(Error::hypervisor("device not attached")),
            }
        })
    }

    fn migrate(
        &self,
        name: &str,
        dest_uri: &str,
        params: &MigrateParameterSet,
        flags: &MigrateFlags,
    ) -> Result<()> {
        let duration = {
            let mut inner = self.enter("migrate")?;
            if !inner.domains.contains_key(name) {
                return Err(Error::domain_not_found(name));
            }
            self.abort.store(false, Ordering::SeqCst);
            inner.migrations.push(MigrationCall {
                name: name.to_string(),
                dest_uri: dest_uri.to_string(),
                params: params.clone(),
                flags: *flags,
            });
            inner.migrate_duration
        };

        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.abort.swap(false, Ordering::SeqCst) {
                return Err(Error::migration("job aborted"));
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        let mut inner = self.inner.lock();
        if flags.undefine_source {
            inner.domains.remove(name);
        } else if let Some(d) = inner.domains.get_mut(name) {
            d.state = DomainState::Shutoff;
        }
        Ok(())
    }

    fn abort_job(&self, _name: &str) -> Result<()> {
        drop(self.enter("abort_job")?);
        self.abort.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn domain_stats(&self, name: &str) -> Result<DomainStats> {
        self.with_domain("domain_stats", name, |d| {
            let running = d.state == DomainState::Running;
            Ok(DomainStats {
                name: name.to_string(),
                vcpus: 1,
                cpu_time_ns: if running { 1_000_000 } else { 0 },
                memory_kib: 1024 * 1024,
                ..Default::default()
            })
        })
    }

    fn host_stats(&self) -> Result<HostStats> {
        drop(self.enter("host_stats")?);
        Ok(HostStats {
            cpus: 8,
            cpu_mhz: 2400,
            total_memory_kib: 32 * 1024 * 1024,
            free_memory_kib: 16 * 1024 * 1024,
        })
    }

    fn list_domains(&self) -> Result<Vec<String>> {
        let inner = self.enter("list_domains")?;
        Ok(inner
            .domains
            .iter()
            .filter(|(_, d)| d.state == DomainState::Running)
            .map(|(name, _)| name.clone())
            .collect())
    }
}
