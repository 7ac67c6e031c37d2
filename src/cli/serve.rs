//! Agent server command.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use hostagent::agent::{AgentContext, Dispatcher};
use hostagent::config::keys;
use hostagent::hypervisor::VirshHypervisor;
use hostagent::server::{self, ConnectionWatcher};
use hostagent::Result;

/// Run the agent on its control socket.
#[derive(Parser, Debug)]
pub struct ServeCmd {
    /// Agent configuration file (TOML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Control socket path; overrides `agent.socket`.
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,
}

impl ServeCmd {
    pub fn run(self) -> Result<()> {
        let config = super::load_config(self.config.as_deref())?;
        let socket = self.socket.unwrap_or_else(|| config.socket_path());
        let check_interval =
            config.get_duration(keys::HYPERVISOR_CHECK_INTERVAL, Duration::from_secs(10));

        let hypervisor = Arc::new(VirshHypervisor::new(config.hypervisor_uri()));
        let mut ctx = AgentContext::new(config, hypervisor)?;
        ctx.start_ha()?;
        let ctx = Arc::new(ctx);

        let _watcher = ConnectionWatcher::spawn(ctx.clone(), check_interval)?;
        let listener = server::bind(&socket)?;
        println!("hostagent listening on {}", socket.display());

        server::serve(listener, ctx, Arc::new(Dispatcher::new()))
    }
}
