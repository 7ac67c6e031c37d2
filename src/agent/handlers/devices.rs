//! Disk and NIC hot-plug.

use super::unexpected;
use crate::agent::AgentContext;
use crate::domain::{device_xml, Device, DomainBuilder};
use crate::error::{Error, Result};
use hostagent_protocol::{AgentRequest, CommandResult, DiskSpec};

fn ensure_domain(ctx: &AgentContext, name: &str) -> Result<()> {
    match ctx.hypervisor().domain_state(name)? {
        Some(_) => Ok(()),
        None => Err(Error::domain_not_found(name)),
    }
}

fn disk_xml(ctx: &AgentContext, disk: &DiskSpec) -> String {
    let caps = ctx.capabilities();
    let vifs = ctx.vifs();
    let def = DomainBuilder::new(ctx.config(), &caps, &vifs).disk_def(disk);
    device_xml(&Device::Disk(def))
}

pub fn attach_disk(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::AttachDisk { name, disk } = request else {
        return Err(unexpected(kind));
    };
    ensure_domain(ctx, &name)?;
    ctx.hypervisor().attach_device(&name, &disk_xml(ctx, &disk))?;
    tracing::info!(vm = %name, disk = %disk.label, path = %disk.path, "disk attached");
    Ok(CommandResult::success(format!("attached {} to {}", disk.label, name)))
}

pub fn detach_disk(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::DetachDisk { name, disk } = request else {
        return Err(unexpected(kind));
    };
    ensure_domain(ctx, &name)?;
    ctx.hypervisor().detach_device(&name, &disk_xml(ctx, &disk))?;
    tracing::info!(vm = %name, disk = %disk.label, "disk detached");
    Ok(CommandResult::success(format!("detached {} from {}", disk.label, name)))
}

pub fn plug_nic(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::PlugNic { name, nic } = request else {
        return Err(unexpected(kind));
    };
    ensure_domain(ctx, &name)?;
    let iface = ctx.vifs().plug(&nic)?;
    ctx.hypervisor()
        .attach_device(&name, &device_xml(&Device::Interface(iface)))?;
    tracing::info!(vm = %name, mac = %nic.mac, traffic = %nic.traffic_type, "nic plugged");
    Ok(CommandResult::success(format!("plugged {} into {}", nic.mac, name)))
}

pub fn unplug_nic(ctx: &AgentContext, request: AgentRequest) -> Result<CommandResult> {
    let kind = request.kind();
    let AgentRequest::UnplugNic { name, nic } = request else {
        return Err(unexpected(kind));
    };
    ensure_domain(ctx, &name)?;
    let driver = ctx.vifs().lookup(nic.traffic_type);
    let iface = driver.plug(&nic)?;
    ctx.hypervisor()
        .detach_device(&name, &device_xml(&Device::Interface(iface)))?;
    tracing::info!(vm = %name, mac = %nic.mac, "nic unplugged");
    Ok(CommandResult::success(format!("unplugged {} from {}", nic.mac, name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{context, context_with};
    use crate::agent::Dispatcher;
    use hostagent_protocol::{DiskBus, DiskThrottle, DomainState, NicSpec, TrafficType};

    fn disk() -> DiskSpec {
        DiskSpec {
            label: "DATA-12".into(),
            device_id: 1,
            path: "/mnt/pool/data-12.qcow2".into(),
            bus: DiskBus::Virtio,
            device: Default::default(),
            format: Default::default(),
            readonly: false,
            throttle: Some(DiskThrottle {
                write_bytes_sec: 1_048_576,
                ..Default::default()
            }),
            encryption: None,
        }
    }

    fn nic() -> NicSpec {
        NicSpec {
            device_id: 1,
            mac: "02:00:4c:5e:00:02".into(),
            traffic_type: TrafficType::Guest,
            vlan: Some(101),
            network_rate_mbps: Some(200),
            model: None,
        }
    }

    #[test]
    fn test_attach_and_detach_disk() {
        let (ctx, hv) = context();
        hv.add_domain("v", DomainState::Running);
        let d = Dispatcher::new();

        let result = d.execute(&ctx, AgentRequest::AttachDisk { name: "v".into(), disk: disk() });
        assert!(result.success, "{}", result.details);
        let devices = hv.devices_of("v");
        assert_eq!(devices.len(), 1);
        assert!(devices[0].contains("<target dev='vdb' bus='virtio'/>"));
        assert!(devices[0].contains("<serial>DATA-12</serial>"));
        assert!(devices[0].contains("<write_bytes_sec>1048576</write_bytes_sec>"));

        let result = d.execute(&ctx, AgentRequest::DetachDisk { name: "v".into(), disk: disk() });
        assert!(result.success, "{}", result.details);
        assert!(hv.devices_of("v").is_empty());
    }

    #[test]
    fn test_attach_to_missing_domain() {
        let (ctx, _) = context();
        let result = Dispatcher::new()
            .execute(&ctx, AgentRequest::AttachDisk { name: "nope".into(), disk: disk() });
        assert!(!result.success);
        assert!(result.details.contains("domain not found"));
    }

    #[test]
    fn test_plug_and_unplug_nic() {
        let (ctx, hv) = context_with(&[("libvirt.vif.driver.Guest", "OvsVifDriver")]);
        hv.add_domain("v", DomainState::Running);
        let d = Dispatcher::new();

        let result = d.execute(&ctx, AgentRequest::PlugNic { name: "v".into(), nic: nic() });
        assert!(result.success, "{}", result.details);
        let devices = hv.devices_of("v");
        assert!(devices[0].contains("<virtualport type='openvswitch'/>"));
        assert!(devices[0].contains("<tag id='101'/>"));
        assert!(devices[0].contains("average='25000'"));

        let result = d.execute(&ctx, AgentRequest::UnplugNic { name: "v".into(), nic: nic() });
        assert!(result.success, "{}", result.details);
        assert!(hv.devices_of("v").is_empty());
    }

    #[test]
    fn test_direct_driver_rejects_vlan() {
        let (ctx, hv) = context_with(&[("libvirt.vif.driver", "DirectVifDriver")]);
        hv.add_domain("v", DomainState::Running);
        let result = Dispatcher::new().execute(&ctx, AgentRequest::PlugNic { name: "v".into(), nic: nic() });
        assert!(!result.success);
        assert!(result.details.starts_with("invalid request"));
    }
}
