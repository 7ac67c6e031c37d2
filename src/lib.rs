//! hostagent - host-side agent between a cloud control plane and the
//! local hypervisor.
//!
//! Requests arrive as [`hostagent_protocol::AgentRequest`] values and are
//! executed by an [`agent::Dispatcher`] against one long-lived
//! [`agent::AgentContext`]. VM definitions are produced by
//! [`domain::DomainBuilder`].

pub mod agent;
pub mod config;
pub mod domain;
pub mod error;
pub mod ha;
pub mod hooks;
pub mod hypervisor;
pub mod migration;
pub mod server;
pub mod topology;
pub mod vif;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
