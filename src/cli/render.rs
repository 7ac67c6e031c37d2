//! Offline domain XML rendering.

use clap::Parser;
use std::path::PathBuf;

use hostagent::domain::{Capabilities, DomainBuilder, HypervisorVersions};
use hostagent::vif::VifRegistry;
use hostagent::{Error, Result};
use hostagent_protocol::VmSpec;

/// Print the domain XML built from a JSON VM spec.
#[derive(Parser, Debug)]
pub struct RenderCmd {
    /// VM spec (JSON).
    #[arg(long, value_name = "FILE")]
    spec: PathBuf,

    /// Agent configuration file (TOML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Control library version to gate features on.
    #[arg(long, default_value = "8.0.0")]
    library_version: String,

    /// Hypervisor version to gate features on.
    #[arg(long, default_value = "6.2.0")]
    hypervisor_version: String,
}

impl RenderCmd {
    pub fn run(self) -> Result<()> {
        let config = super::load_config(self.config.as_deref())?;
        let text = std::fs::read_to_string(&self.spec)?;
        let spec: VmSpec = serde_json::from_str(&text)?;

        let encode = |v: &str| {
            HypervisorVersions::encode(v)
                .ok_or_else(|| Error::invalid_request(format!("malformed version '{}'", v)))
        };
        let versions = HypervisorVersions::new(
            encode(&self.library_version)?,
            encode(&self.hypervisor_version)?,
        );
        let caps = Capabilities::from_versions(versions);
        let vifs = VifRegistry::configure(&config)?;

        let descriptor = DomainBuilder::new(&config, &caps, &vifs).build(&spec)?;
        print!("{}", descriptor.to_xml());
        Ok(())
    }
}
