//! Hypervisor control-library abstraction.
//!
//! Handlers talk to the hypervisor only through [`Hypervisor`]. The
//! production backend shells out to `virsh`; tests use
//! [`mock::MockHypervisor`].

pub mod mock;
pub mod virsh;

pub use virsh::VirshHypervisor;

use crate::domain::HypervisorVersions;
use crate::error::Result;
use crate::migration::{MigrateFlags, MigrateParameterSet};
use hostagent_protocol::{DomainState, DomainStats, HostStats};

/// Operations the agent needs from the hypervisor control library.
///
/// All calls are synchronous and may block for as long as the underlying
/// library takes.
pub trait Hypervisor: Send + Sync {
    /// Library and hypervisor versions; also used as a connection probe.
    fn versions(&self) -> Result<HypervisorVersions>;

    /// Define (or redefine) a persistent domain from its XML.
    fn define_domain(&self, xml: &str) -> Result<()>;

    fn start_domain(&self, name: &str) -> Result<()>;

    /// Shut a domain down; `force` pulls the plug instead of asking the guest.
    fn stop_domain(&self, name: &str, force: bool) -> Result<()>;

    fn reboot_domain(&self, name: &str) -> Result<()>;

    fn suspend_domain(&self, name: &str) -> Result<()>;

    fn resume_domain(&self, name: &str) -> Result<()>;

    /// Current state, or `None` when no such domain exists.
    fn domain_state(&self, name: &str) -> Result<Option<DomainState>>;

    fn domain_xml(&self, name: &str) -> Result<String>;

    fn attach_device(&self, name: &str, xml: &str) -> Result<()>;

    fn detach_device(&self, name: &str, xml: &str) -> Result<()>;

    /// Live-migrate `name` to `dest_uri`. Blocks until the job ends.
    fn migrate(
        &self,
        name: &str,
        dest_uri: &str,
        params: &MigrateParameterSet,
        flags: &MigrateFlags,
    ) -> Result<()>;

    /// Abort the domain's running job (migration).
    fn abort_job(&self, name: &str) -> Result<()>;

    fn domain_stats(&self, name: &str) -> Result<DomainStats>;

    fn host_stats(&self) -> Result<HostStats>;

    /// Names of running domains.
    fn list_domains(&self) -> Result<Vec<String>>;
}

/// Connection URI of the destination host's hypervisor.
pub fn destination_uri(destination_ip: &str) -> String {
    format!("qemu+tcp://{}/system", destination_ip)
}
