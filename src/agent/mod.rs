//! Agent state and request execution.
//!
//! [`AgentContext`] owns everything that outlives a single request: the
//! configuration, detected capabilities, the VIF table, the disconnect-hook
//! registry and the hypervisor handle. The [`Dispatcher`] runs requests
//! against it.

pub mod dispatcher;
pub mod handlers;

pub use dispatcher::{Dispatcher, Handler};

use crate::config::AgentConfig;
use crate::domain::{Capabilities, DomainBuilder, DomainDescriptor};
use crate::error::Result;
use crate::ha::{FileHeartbeatStore, HaMonitor, HaPool, HaSettings, HeartbeatStore};
use crate::hooks::HookRegistry;
use crate::hypervisor::Hypervisor;
use crate::vif::VifRegistry;
use hostagent_protocol::{HostHealth, VmSpec};
use parking_lot::RwLock;
use std::sync::Arc;

/// Long-lived agent state shared by all connections.
pub struct AgentContext {
    config: AgentConfig,
    ha_settings: HaSettings,
    capabilities: RwLock<Capabilities>,
    vifs: RwLock<Arc<VifRegistry>>,
    hooks: HookRegistry,
    hypervisor: Arc<dyn Hypervisor>,
    heartbeats: Arc<dyn HeartbeatStore>,
    pools: Vec<HaPool>,
    ha: Option<HaMonitor>,
}

impl AgentContext {
    /// Build the context, probing the hypervisor once for its versions.
    pub fn new(config: AgentConfig, hypervisor: Arc<dyn Hypervisor>) -> Result<Self> {
        let vifs = VifRegistry::configure(&config)?;
        let versions = hypervisor.versions()?;
        let capabilities = Capabilities::from_versions(versions);
        tracing::info!(
            library = versions.library,
            hypervisor = versions.hypervisor,
            default_vif = vifs.default_driver().name(),
            "agent context ready"
        );

        let pools = config.local_storage().iter().map(HaPool::from).collect();
        Ok(Self {
            ha_settings: HaSettings::from_config(&config),
            config,
            capabilities: RwLock::new(capabilities),
            vifs: RwLock::new(Arc::new(vifs)),
            hooks: HookRegistry::new(),
            hypervisor,
            heartbeats: Arc::new(FileHeartbeatStore),
            pools,
            ha: None,
        })
    }

    /// Replace the heartbeat store and pool list used for fencing.
    pub fn with_heartbeats(mut self, store: Arc<dyn HeartbeatStore>, pools: Vec<HaPool>) -> Self {
        self.heartbeats = store;
        self.pools = pools;
        self
    }

    /// Start the HA monitor for this host's pools.
    ///
    /// Does nothing when no host IP or no pools are configured.
    pub fn start_ha(&mut self) -> Result<()> {
        let Some(host_ip) = self.config.host_ip() else {
            tracing::info!("no host ip configured, ha monitor disabled");
            return Ok(());
        };
        if self.pools.is_empty() {
            tracing::info!("no storage pools configured, ha monitor disabled");
            return Ok(());
        }
        let monitor = HaMonitor::spawn(
            self.ha_settings,
            host_ip,
            self.pools.clone(),
            self.heartbeats.clone(),
        )?;
        self.ha = Some(monitor);
        Ok(())
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn ha_settings(&self) -> &HaSettings {
        &self.ha_settings
    }

    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.read()
    }

    /// Re-read versions after a reconnect.
    pub fn refresh_capabilities(&self) -> Result<Capabilities> {
        let caps = Capabilities::from_versions(self.hypervisor.versions()?);
        *self.capabilities.write() = caps;
        Ok(caps)
    }

    pub fn vifs(&self) -> Arc<VifRegistry> {
        self.vifs.read().clone()
    }

    /// Swap in a VIF table built from `config`. In-flight requests keep
    /// the table they started with.
    pub fn reconfigure_vifs(&self, config: &AgentConfig) -> Result<()> {
        let registry = Arc::new(VifRegistry::configure(config)?);
        *self.vifs.write() = registry;
        tracing::info!("vif drivers reconfigured");
        Ok(())
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn hypervisor(&self) -> &dyn Hypervisor {
        self.hypervisor.as_ref()
    }

    /// Owned hypervisor handle for work that outlives the borrow of `self`.
    pub fn hypervisor_handle(&self) -> Arc<dyn Hypervisor> {
        self.hypervisor.clone()
    }

    pub fn heartbeats(&self) -> &dyn HeartbeatStore {
        self.heartbeats.as_ref()
    }

    pub fn pools(&self) -> &[HaPool] {
        &self.pools
    }

    /// Current HA snapshot, if the monitor is running.
    pub fn health(&self) -> Option<HostHealth> {
        self.ha.as_ref().map(HaMonitor::health)
    }

    /// Build the descriptor for `spec` with the current capabilities and VIF table.
    pub fn build_descriptor(&self, spec: &VmSpec) -> Result<DomainDescriptor> {
        let caps = self.capabilities();
        let vifs = self.vifs();
        DomainBuilder::new(&self.config, &caps, &vifs).build(spec)
    }
}
