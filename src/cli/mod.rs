//! CLI command implementations.

pub mod render;
pub mod send;
pub mod serve;

use hostagent::config::AgentConfig;
use hostagent::Result;
use std::path::Path;

/// Load the configuration file if one was given, defaults otherwise.
fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    match path {
        Some(path) => AgentConfig::load(path),
        None => Ok(AgentConfig::default()),
    }
}
