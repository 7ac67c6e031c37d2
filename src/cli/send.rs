//! One-shot request client.

use clap::Parser;
use std::io::Read;
use std::path::PathBuf;

use hostagent::config::DEFAULT_SOCKET_PATH;
use hostagent::server;
use hostagent::Result;
use hostagent_protocol::AgentRequest;

/// Send one request to a running agent and print the result.
#[derive(Parser, Debug)]
pub struct SendCmd {
    /// Request (JSON); `-` reads standard input.
    #[arg(short, long, value_name = "FILE")]
    request: PathBuf,

    /// Agent control socket.
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_SOCKET_PATH)]
    socket: PathBuf,
}

impl SendCmd {
    pub fn run(self) -> Result<()> {
        let text = if self.request.as_os_str() == "-" {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        } else {
            std::fs::read_to_string(&self.request)?
        };
        let request: AgentRequest = serde_json::from_str(&text)?;

        let result = server::send_request(&self.socket, &request)?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        if !result.success {
            std::process::exit(2);
        }
        Ok(())
    }
}
