//! Live migration.
//!
//! The hypervisor's migrate call blocks for the whole job, so it runs on a
//! scoped worker thread while this handler watches the clock. Past
//! `vm.migrate.pauseafter` the source domain is suspended so the remaining
//! dirty pages can converge; past `vm.migrate.wait` the job is aborted.
//! A source left suspended by a failed job is resumed. While the job runs a
//! disconnect hook is registered that aborts it if the hypervisor
//! connection drops.

use super::unexpected;
use crate::agent::AgentContext;
use crate::config::keys;
use crate::error::{Error, Result};
use crate::hooks::{DisconnectHook, HookId, HookRegistry};
use crate::hypervisor::{destination_uri, Hypervisor};
use crate::migration::{MigrateFlags, MigrateParameterSet};
use hostagent_protocol::{AgentRequest, CommandResult, ResultPayload};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const ABORT_HOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Define the incoming domain on this host so the migration can land.
pub fn prepare(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::PrepareForMigration { vm } = request else {
        return Err(unexpected(kind));
    };
    let xml = ctx.build_descriptor(&vm)?.to_xml();
    ctx.hypervisor().define_domain(&xml)?;
    tracing::info!(vm = %vm.name, "prepared for incoming migration");
    Ok(CommandResult::success(format!("{} ready for migration", vm.name))
        .with_payload(ResultPayload::DomainXml { xml }))
}

pub fn migrate(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::MigrateVm {
        name,
        destination_ip,
        destination_name,
        vm,
        migrate_disks,
    } = request
    else {
        return Err(unexpected(kind));
    };

    if destination_ip.is_empty() {
        return Err(Error::invalid_request("migration without destination ip"));
    }
    let hv = ctx.hypervisor();
    if hv.domain_state(&name)?.is_none() {
        return Err(Error::domain_not_found(&name));
    }

    let caps = ctx.capabilities();
    if !migrate_disks.is_empty() && !caps.selective_block_migration {
        return Err(Error::migration(format!(
            "selective block migration needs library version {} or newer, found {}",
            crate::domain::capabilities::MIGRATE_DISKS_MIN_LIBRARY,
            caps.versions.library
        )));
    }

    let xml = match &vm {
        Some(spec) => ctx.build_descriptor(spec)?.to_xml(),
        None => hv.domain_xml(&name)?,
    };

    let config = ctx.config();
    let params = MigrateParameterSet::build(
        destination_name.as_deref().unwrap_or(&name),
        &xml,
        &destination_ip,
        config.get_u64(keys::MIGRATE_SPEED, 0),
        &migrate_disks,
    );
    let flags = MigrateFlags {
        non_shared_disk: !migrate_disks.is_empty(),
        auto_converge: config.get_bool(keys::MIGRATE_AUTOCONVERGE, false),
        ..Default::default()
    };
    let timers = MigrationTimers {
        pause_after: nonzero(config.get_duration(keys::MIGRATE_PAUSE_AFTER, Duration::ZERO)),
        wait: nonzero(config.get_duration(keys::MIGRATE_WAIT, Duration::ZERO)),
    };

    tracing::info!(
        vm = %name,
        destination = %destination_ip,
        disks = migrate_disks.len(),
        bandwidth = params.bandwidth(),
        "starting migration"
    );
    let uri = destination_uri(&destination_ip);
    let abort_hook = abort_on_disconnect(ctx.hypervisor_handle(), &name);
    let _hook = RegisteredHook::new(ctx.hooks(), abort_hook);
    run_migration(hv, &name, &uri, &params, &flags, timers)?;

    tracing::info!(vm = %name, destination = %destination_ip, "migration complete");
    Ok(CommandResult::success(format!(
        "{} migrated to {}",
        name, destination_ip
    )))
}

/// Removes its hook from the registry when dropped.
struct RegisteredHook<'a> {
    hooks: &'a HookRegistry,
    id: HookId,
}

impl<'a> RegisteredHook<'a> {
    fn new(hooks: &'a HookRegistry, hook: DisconnectHook) -> Self {
        let id = hooks.register(hook);
        Self { hooks, id }
    }
}

impl Drop for RegisteredHook<'_> {
    fn drop(&mut self) {
        self.hooks.remove(self.id);
    }
}

fn abort_on_disconnect(hv: Arc<dyn Hypervisor>, name: &str) -> DisconnectHook {
    let vm = name.to_string();
    DisconnectHook::new(format!("migrate-abort-{}", name), move || {
        tracing::warn!(vm = %vm, "hypervisor connection lost, aborting migration");
        if let Err(e) = hv.abort_job(&vm) {
            tracing::warn!(vm = %vm, error = %e, "failed to abort migration job");
        }
    })
    .with_timeout(ABORT_HOOK_TIMEOUT)
}

fn nonzero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

#[derive(Debug, Clone, Copy)]
struct MigrationTimers {
    pause_after: Option<Duration>,
    wait: Option<Duration>,
}

fn run_migration(
    hv: &dyn Hypervisor,
    name: &str,
    uri: &str,
    params: &MigrateParameterSet,
    flags: &MigrateFlags,
    timers: MigrationTimers,
) -> Result<()> {
    let started = Instant::now();

    thread::scope(|scope| {
        let worker = thread::Builder::new()
            .name(format!("migrate-{}", name))
            .spawn_scoped(scope, || hv.migrate(name, uri, params, flags))?;

        let mut paused = false;
        let mut aborted = false;
        while !worker.is_finished() {
            let elapsed = started.elapsed();

            if let Some(pause_after) = timers.pause_after {
                if !paused && elapsed >= pause_after {
                    paused = true;
                    tracing::warn!(vm = %name, elapsed_ms = elapsed.as_millis() as u64, "migration not converging, suspending source");
                    if let Err(e) = hv.suspend_domain(name) {
                        tracing::warn!(vm = %name, error = %e, "failed to suspend domain");
                    }
                }
            }

            if let Some(wait) = timers.wait {
                if !aborted && elapsed >= wait {
                    aborted = true;
                    tracing::warn!(vm = %name, timeout = ?wait, "migration timed out, aborting job");
                    if let Err(e) = hv.abort_job(name) {
                        tracing::warn!(vm = %name, error = %e, "failed to abort migration job");
                    }
                }
            }

            thread::sleep(POLL_INTERVAL);
        }

        let result = match worker.join() {
            Err(_) => Err(Error::migration("migration worker panicked")),
            Ok(Ok(())) if aborted => Err(Error::migration(format!(
                "{} did not finish within {:?}",
                name,
                timers.wait.unwrap_or_default()
            ))),
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) if aborted => Err(Error::migration(format!(
                "aborted after {:?}",
                timers.wait.unwrap_or_default()
            ))),
            Ok(Err(e)) => Err(e),
        };

        if paused && result.is_err() {
            tracing::info!(vm = %name, "migration failed, resuming source");
            if let Err(e) = hv.resume_domain(name) {
                tracing::warn!(vm = %name, error = %e, "failed to resume domain");
            }
        }
        result
    })
}
