//! VM lifecycle requests.

use super::unexpected;
use crate::agent::AgentContext;
use crate::error::{Error, Result};
use hostagent_protocol::{AgentRequest, CommandResult, DomainState, ResultPayload};

pub fn start(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::StartVm { vm } = request else {
        return Err(unexpected(kind));
    };
    let hv = ctx.hypervisor();

    if hv.domain_state(&vm.name)? == Some(DomainState::Running) {
        tracing::info!(vm = %vm.name, "domain already running");
        return Ok(CommandResult::success(format!("{} is already running", vm.name)));
    }

    let xml = ctx.build_descriptor(&vm)?.to_xml();
    tracing::debug!(vm = %vm.name, xml = %xml, "defining domain");
    hv.define_domain(&xml)?;
    hv.start_domain(&vm.name)?;

    tracing::info!(vm = %vm.name, vcpus = vm.vcpus, "domain started");
    Ok(CommandResult::success(format!("{} started", vm.name))
        .with_payload(ResultPayload::DomainXml { xml }))
}

/// Stopping a domain that is already gone succeeds.
pub fn stop(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::StopVm { name, force } = request else {
        return Err(unexpected(kind));
    };
    let hv = ctx.hypervisor();

    match hv.domain_state(&name)? {
        None => return Ok(CommandResult::success(format!("{} does not exist", name))),
        Some(DomainState::Shutoff) => {
            return Ok(CommandResult::success(format!("{} is already stopped", name)))
        }
        Some(_) => {}
    }

    hv.stop_domain(&name, force)?;
    tracing::info!(vm = %name, force, "domain stopped");
    Ok(CommandResult::success(format!("{} stopped", name)))
}

pub fn reboot(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::RebootVm { name } = request else {
        return Err(unexpected(kind));
    };
    ctx.hypervisor().reboot_domain(&name)?;
    tracing::info!(vm = %name, "domain rebooted");
    Ok(CommandResult::success(format!("{} rebooted", name)))
}

pub fn check_state(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::CheckVmState { name } = request else {
        return Err(unexpected(kind));
    };
    let state = ctx.hypervisor().domain_state(&name)?;
    let details = match state {
        Some(s) => format!("{} is {:?}", name, s).to_lowercase(),
        None => format!("{} does not exist", name),
    };
    Ok(CommandResult::success(details).with_payload(ResultPayload::State { state }))
}

/// Stats for each named domain; domains that no longer exist are skipped.
pub fn stats(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::GetVmStats { names } = request else {
        return Err(unexpected(kind));
    };

    let mut stats = Vec::with_capacity(names.len());
    for name in &names {
        match ctx.hypervisor().domain_stats(name) {
            Ok(s) => stats.push(s),
            Err(Error::DomainNotFound(_)) => {
                tracing::debug!(vm = %name, "skipping stats for missing domain");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(CommandResult::success(format!("stats for {} of {} domains", stats.len(), names.len()))
        .with_payload(ResultPayload::VmStats { stats }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::context;
    use crate::agent::Dispatcher;
    use hostagent_protocol::VmSpec;

    fn spec(name: &str) -> VmSpec {
        VmSpec::new(name, 2, 512 * 1024 * 1024, 1024 * 1024 * 1024)
    }

    #[test]
    fn test_start_defines_and_starts() {
        let (ctx, hv) = context();
        let result = Dispatcher::new().execute(&ctx, AgentRequest::StartVm { vm: spec("i-2-3-VM") });
        assert!(result.success, "{}", result.details);
        assert_eq!(hv.state_of("i-2-3-VM"), Some(DomainState::Running));
        assert!(matches!(
            result.payload,
            Some(ResultPayload::DomainXml { ref xml }) if xml.contains("<name>i-2-3-VM</name>")
        ));
    }

    #[test]
    fn test_start_running_domain_is_noop() {
        let (ctx, hv) = context();
        hv.add_domain("i-2-3-VM", DomainState::Running);
        let result = Dispatcher::new().execute(&ctx, AgentRequest::StartVm { vm: spec("i-2-3-VM") });
        assert!(result.success);
        assert!(!hv.calls().iter().any(|c| c == "define_domain"));
    }

    #[test]
    fn test_start_invalid_spec_fails() {
        let (ctx, _) = context();
        let mut vm = spec("i-2-3-VM");
        vm.vcpus = 0;
        let result = Dispatcher::new().execute(&ctx, AgentRequest::StartVm { vm });
        assert!(!result.success);
        assert!(result.details.contains("no vcpus"));
    }

    #[test]
    fn test_start_failure_reported() {
        let (ctx, hv) = context();
        hv.fail_on("start_domain", "unable to open tap device");
        let result = Dispatcher::new().execute(&ctx, AgentRequest::StartVm { vm: spec("v") });
        assert!(!result.success);
        assert!(result.details.contains("unable to open tap device"));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (ctx, hv) = context();
        let d = Dispatcher::new();
        let stop = |name: &str| AgentRequest::StopVm {
            name: name.into(),
            force: false,
        };

        assert!(d.execute(&ctx, stop("gone")).success);

        hv.add_domain("v", DomainState::Running);
        assert!(d.execute(&ctx, stop("v")).success);
        assert_eq!(hv.state_of("v"), Some(DomainState::Shutoff));
        assert!(d.execute(&ctx, stop("v")).success);
        assert_eq!(hv.calls().iter().filter(|c| *c == "stop_domain").count(), 1);
    }

    #[test]
    fn test_check_state() {
        let (ctx, hv) = context();
        hv.add_domain("v", DomainState::Paused);
        let result = Dispatcher::new().execute(&ctx, AgentRequest::CheckVmState { name: "v".into() });
        assert_eq!(
            result.payload,
            Some(ResultPayload::State {
                state: Some(DomainState::Paused)
            })
        );
    }

    #[test]
    fn test_stats_skip_missing() {
        let (ctx, hv) = context();
        hv.add_domain("a", DomainState::Running);
        let result = Dispatcher::new().execute(
            &ctx,
            AgentRequest::GetVmStats {
                names: vec!["a".into(), "missing".into()],
            },
        );
        assert!(result.success);
        match result.payload {
            Some(ResultPayload::VmStats { stats }) => {
                assert_eq!(stats.len(), 1);
                assert_eq!(stats[0].name, "a");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }
}
