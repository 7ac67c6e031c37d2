//! hostagent CLI entry point.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

/// hostagent - host-side cloud agent
#[derive(Parser, Debug)]
#[command(name = "hostagent")]
#[command(about = "Host-side agent driving the local hypervisor")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent on its control socket.
    Serve(cli::serve::ServeCmd),

    /// Print the domain XML built from a VM spec.
    Render(cli::render::RenderCmd),

    /// Send one request to a running agent.
    Send(cli::send::SendCmd),
}

fn main() {
    let cli = Cli::parse();

    init_logging();

    tracing::debug!(version = hostagent::VERSION, "starting hostagent");

    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(),
        Commands::Render(cmd) => cmd.run(),
        Commands::Send(cmd) => cmd.run(),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hostagent=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
