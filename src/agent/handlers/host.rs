//! Host-level requests: readiness, liveness, stats, health and fencing.

use super::unexpected;
use crate::agent::AgentContext;
use crate::error::{Error, Result};
use crate::ha;
use hostagent_protocol::{AgentRequest, CommandResult, HostHealth, ResultPayload, PROTOCOL_VERSION};

pub fn ready(ctx: &AgentContext, _request: AgentRequest) -> Result<CommandResult> {
    let caps = ctx.refresh_capabilities()?;
    Ok(CommandResult::success("host ready").with_payload(ResultPayload::Ready {
        protocol_version: PROTOCOL_VERSION,
        host_ip: ctx.config().host_ip().map(String::from),
        library_version: caps.versions.library,
        hypervisor_version: caps.versions.hypervisor,
        capabilities: caps.as_map(),
    }))
}

pub fn ping(ctx: &AgentContext, _request: AgentRequest) -> Result<CommandResult> {
    let names = ctx.hypervisor().list_domains()?;
    Ok(CommandResult::success(format!("{} running domains", names.len()))
        .with_payload(ResultPayload::Domains { names }))
}

pub fn host_stats(ctx: &AgentContext, _request: AgentRequest) -> Result<CommandResult> {
    let stats = ctx.hypervisor().host_stats()?;
    Ok(CommandResult::success("host stats").with_payload(ResultPayload::HostStats { stats }))
}

pub fn check_health(ctx: &AgentContext, _request: AgentRequest) -> Result<CommandResult> {
    let Some(health) = ctx.health() else {
        return Ok(CommandResult::success("ha monitor not running").with_payload(
            ResultPayload::Health {
                health: HostHealth {
                    healthy: true,
                    pools: Vec::new(),
                },
            },
        ));
    };

    let result = if health.healthy {
        CommandResult::success("all pools reachable")
    } else {
        let down: Vec<&str> = health
            .pools
            .iter()
            .filter(|p| !p.reachable)
            .map(|p| p.uuid.as_str())
            .collect();
        CommandResult::failure(format!("unreachable pools: {}", down.join(", ")))
    };
    Ok(result.with_payload(ResultPayload::Health { health }))
}

/// Confirm a peer host is dead before its VMs are restarted elsewhere.
pub fn fence(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::Fence { host_ip, vms } = request else {
        return Err(unexpected(kind));
    };
    if host_ip.is_empty() {
        return Err(Error::invalid_request("fence request without host ip"));
    }
    if ctx.pools().is_empty() {
        return Err(Error::storage("no storage pools to check heartbeats on"));
    }

    let window = ctx.ha_settings().window;
    if ha::is_host_alive(ctx.heartbeats(), ctx.pools(), &host_ip, window) {
        tracing::warn!(host = %host_ip, "refusing to fence, host heartbeat is fresh");
        return Ok(CommandResult::failure(format!(
            "host {} is still alive, not fencing",
            host_ip
        )));
    }

    tracing::info!(host = %host_ip, vms = vms.len(), "host fenced");
    Ok(CommandResult::success(format!("host {} fenced", host_ip))
        .with_payload(ResultPayload::Fenced { vms }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{context, context_with};
    use crate::agent::Dispatcher;
    use crate::config::keys;
    use crate::ha::{FileHeartbeatStore, HaPool, HeartbeatStore};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_ready_reports_capabilities() {
        let (ctx, _) = context_with(&[(keys::HOST_IP, "10.0.0.5")]);
        let result = Dispatcher::new().execute(&ctx, AgentRequest::Ready);
        assert!(result.success);
        match result.payload {
            Some(ResultPayload::Ready {
                host_ip,
                capabilities,
                protocol_version,
                ..
            }) => {
                assert_eq!(host_ip.as_deref(), Some("10.0.0.5"));
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(capabilities.get("kvmclock"), Some(&true));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_ping_lists_running_domains() {
        let (ctx, hv) = context();
        hv.add_domain("r-4-VM", hostagent_protocol::DomainState::Running);
        hv.add_domain("i-2-9-VM", hostagent_protocol::DomainState::Shutoff);
        let result = Dispatcher::new().execute(&ctx, AgentRequest::Ping);
        assert_eq!(
            result.payload,
            Some(ResultPayload::Domains {
                names: vec!["r-4-VM".into()]
            })
        );
    }

    #[test]
    fn test_health_without_monitor() {
        let (ctx, _) = context();
        let result = Dispatcher::new().execute(&ctx, AgentRequest::CheckHealth);
        assert!(result.success);
    }

    fn fence_context(tmp: &TempDir) -> (AgentContext, HaPool) {
        let (ctx, _) = context();
        let pool = HaPool {
            uuid: "nfs-1".into(),
            path: tmp.path().to_path_buf(),
        };
        let ctx = ctx.with_heartbeats(Arc::new(FileHeartbeatStore), vec![pool.clone()]);
        (ctx, pool)
    }

    #[test]
    fn test_fence_refused_while_heartbeat_fresh() {
        let tmp = TempDir::new().unwrap();
        let (ctx, pool) = fence_context(&tmp);
        FileHeartbeatStore.write(&pool, "10.0.0.7").unwrap();

        let result = Dispatcher::new().execute(
            &ctx,
            AgentRequest::Fence {
                host_ip: "10.0.0.7".into(),
                vms: vec!["i-2-9-VM".into()],
            },
        );
        assert!(!result.success);
        assert!(result.details.contains("still alive"));
    }

    #[test]
    fn test_fence_dead_host() {
        let tmp = TempDir::new().unwrap();
        let (ctx, _) = fence_context(&tmp);
        let result = Dispatcher::new().execute(
            &ctx,
            AgentRequest::Fence {
                host_ip: "10.0.0.8".into(),
                vms: vec!["i-2-9-VM".into()],
            },
        );
        assert!(result.success);
        assert_eq!(
            result.payload,
            Some(ResultPayload::Fenced {
                vms: vec!["i-2-9-VM".into()]
            })
        );
    }

    #[test]
    fn test_fence_without_pools_fails() {
        let (ctx, _) = context();
        let result = Dispatcher::new().execute(
            &ctx,
            AgentRequest::Fence {
                host_ip: "10.0.0.8".into(),
                vms: vec![],
            },
        );
        assert!(!result.success);
        assert!(result.details.contains("no storage pools"));
    }
}
