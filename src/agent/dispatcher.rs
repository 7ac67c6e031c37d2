//! Request dispatch.
//!
//! The dispatcher maps each [`RequestKind`] to a handler function. Kinds
//! without an entry get an "unsupported" result. Handler errors and panics
//! are turned into failed results here, so callers always get a
//! [`CommandResult`] back.

use super::{handlers, AgentContext};
use crate::error::Result;
use hostagent_protocol::{AgentRequest, CommandResult, RequestKind};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

/// A request handler.
pub type Handler = fn(&AgentContext, AgentRequest) -> Result<CommandResult>;

/// Table from request kind to handler.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: BTreeMap<RequestKind, Handler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    /// Dispatcher with every built-in handler registered.
    pub fn new() -> Self {
        Self::empty()
            .with_handler(RequestKind::Ready, handlers::host::ready)
            .with_handler(RequestKind::Ping, handlers::host::ping)
            .with_handler(RequestKind::GetHostStats, handlers::host::host_stats)
            .with_handler(RequestKind::CheckHealth, handlers::host::check_health)
            .with_handler(RequestKind::Fence, handlers::host::fence)
            .with_handler(RequestKind::StartVm, handlers::vm::start)
            .with_handler(RequestKind::StopVm, handlers::vm::stop)
            .with_handler(RequestKind::RebootVm, handlers::vm::reboot)
            .with_handler(RequestKind::CheckVmState, handlers::vm::check_state)
            .with_handler(RequestKind::GetVmStats, handlers::vm::stats)
            .with_handler(RequestKind::PrepareForMigration, handlers::migrate::prepare)
            .with_handler(RequestKind::MigrateVm, handlers::migrate::migrate)
            .with_handler(RequestKind::AttachDisk, handlers::devices::attach_disk)
            .with_handler(RequestKind::DetachDisk, handlers::devices::detach_disk)
            .with_handler(RequestKind::PlugNic, handlers::devices::plug_nic)
            .with_handler(RequestKind::UnplugNic, handlers::devices::unplug_nic)
    }

    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn with_handler(mut self, kind: RequestKind, handler: Handler) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn without(mut self, kind: RequestKind) -> Self {
        self.handlers.remove(&kind);
        self
    }

    pub fn supports(&self, kind: RequestKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Execute one request. Never fails and never panics out.
    pub fn execute(&self, ctx: &AgentContext, request: AgentRequest) -> CommandResult {
        let kind = request.kind();
        let Some(handler) = self.handlers.get(&kind).copied() else {
            tracing::warn!(kind = %kind, "unsupported request");
            return CommandResult::unsupported(kind);
        };

        tracing::info!(kind = %kind, "handling request");
        tracing::debug!(request = ?request, "request payload");
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, request)));
        let result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(kind = %kind, error = %e, "request failed");
                CommandResult::failure(e.to_string())
            }
            Err(panic) => {
                let msg = panic_message(panic.as_ref());
                tracing::error!(kind = %kind, panic = %msg, "handler panicked");
                CommandResult::failure(format!("handler panicked: {}", msg))
            }
        };

        tracing::info!(
            kind = %kind,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request finished"
        );
        result
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
