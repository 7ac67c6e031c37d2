//! Virtual interface drivers.
//!
//! A [`VifDriver`] turns a [`NicSpec`] into the interface definition the
//! hypervisor attaches. The [`VifRegistry`] maps each traffic type to a
//! driver. It is built once from configuration and never patched; a new
//! configuration produces a new registry.

use crate::config::{keys, AgentConfig, BridgeType};
use crate::domain::{InterfaceDef, InterfaceKind};
use crate::error::{Error, Result};
use hostagent_protocol::{NicSpec, TrafficType};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub const BRIDGE_DRIVER: &str = "BridgeVifDriver";
pub const OVS_DRIVER: &str = "OvsVifDriver";
pub const DIRECT_DRIVER: &str = "DirectVifDriver";

/// Network attachment strategy for guest NICs.
pub trait VifDriver: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Build the interface definition for a NIC.
    fn plug(&self, nic: &NicSpec) -> Result<InterfaceDef>;
}

/// Convert a megabit rate to the KB/s figure the hypervisor expects.
fn bandwidth_kbps(nic: &NicSpec) -> Option<u32> {
    nic.network_rate_mbps
        .filter(|&r| r > 0)
        .map(|mbps| mbps.saturating_mul(125))
}

/// Linux bridge driver.
#[derive(Debug, Clone)]
pub struct BridgeVifDriver {
    public_device: String,
    guest_device: String,
    private_device: String,
}

impl BridgeVifDriver {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            public_device: config.get_or(keys::PUBLIC_DEVICE, "cloudbr0").to_string(),
            guest_device: config.get_or(keys::GUEST_DEVICE, "cloudbr0").to_string(),
            private_device: config.get_or(keys::PRIVATE_DEVICE, "cloudbr1").to_string(),
        }
    }

    fn device_for(&self, traffic: TrafficType) -> &str {
        match traffic {
            TrafficType::Public => &self.public_device,
            TrafficType::Guest => &self.guest_device,
            TrafficType::Management
            | TrafficType::Control
            | TrafficType::Storage
            | TrafficType::Vpn => &self.private_device,
        }
    }

    /// Bridge a NIC lands on: the physical bridge, or a per-VLAN bridge.
    pub fn bridge_name(&self, traffic: TrafficType, vlan: Option<u16>) -> String {
        let device = self.device_for(traffic);
        match vlan {
            Some(tag) => format!("br{}-{}", device, tag),
            None => device.to_string(),
        }
    }
}

impl VifDriver for BridgeVifDriver {
    fn name(&self) -> &'static str {
        BRIDGE_DRIVER
    }

    fn plug(&self, nic: &NicSpec) -> Result<InterfaceDef> {
        Ok(InterfaceDef {
            kind: InterfaceKind::Bridge {
                bridge: self.bridge_name(nic.traffic_type, nic.vlan),
            },
            mac: nic.mac.clone(),
            model: nic.model.unwrap_or_default(),
            virtualport: None,
            vlan: None,
            target_dev: None,
            bandwidth_kbps: bandwidth_kbps(nic),
        })
    }
}

/// Open vSwitch driver. VLANs are port tags on the shared switch.
#[derive(Debug, Clone)]
pub struct OvsVifDriver {
    bridges: BridgeVifDriver,
}

impl OvsVifDriver {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            bridges: BridgeVifDriver::new(config),
        }
    }
}

impl VifDriver for OvsVifDriver {
    fn name(&self) -> &'static str {
        OVS_DRIVER
    }

    fn plug(&self, nic: &NicSpec) -> Result<InterfaceDef> {
        Ok(InterfaceDef {
            kind: InterfaceKind::Bridge {
                bridge: self.bridges.bridge_name(nic.traffic_type, None),
            },
            mac: nic.mac.clone(),
            model: nic.model.unwrap_or_default(),
            virtualport: Some("openvswitch".to_string()),
            vlan: nic.vlan,
            target_dev: None,
            bandwidth_kbps: bandwidth_kbps(nic),
        })
    }
}

/// macvtap driver attaching guests directly to a physical device.
#[derive(Debug, Clone)]
pub struct DirectVifDriver {
    source_device: String,
}

impl DirectVifDriver {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            source_device: config.get_or(keys::DIRECT_DEVICE, "eth0").to_string(),
        }
    }
}

impl VifDriver for DirectVifDriver {
    fn name(&self) -> &'static str {
        DIRECT_DRIVER
    }

    fn plug(&self, nic: &NicSpec) -> Result<InterfaceDef> {
        if nic.vlan.is_some() {
            return Err(Error::invalid_request(format!(
                "{} cannot attach VLAN-tagged nic {}",
                DIRECT_DRIVER, nic.mac
            )));
        }
        Ok(InterfaceDef {
            kind: InterfaceKind::Direct {
                device: self.source_device.clone(),
                mode: "bridge".to_string(),
            },
            mac: nic.mac.clone(),
            model: nic.model.unwrap_or_default(),
            virtualport: None,
            vlan: None,
            target_dev: None,
            bandwidth_kbps: bandwidth_kbps(nic),
        })
    }
}

/// Instantiate a driver by name. Qualified names (`a.b.OvsVifDriver`) are
/// matched on their last segment.
pub fn create_driver(name: &str, config: &AgentConfig) -> Option<Arc<dyn VifDriver>> {
    let short = name.rsplit('.').next().unwrap_or(name).trim();
    match short {
        BRIDGE_DRIVER => Some(Arc::new(BridgeVifDriver::new(config))),
        OVS_DRIVER => Some(Arc::new(OvsVifDriver::new(config))),
        DIRECT_DRIVER => Some(Arc::new(DirectVifDriver::new(config))),
        _ => None,
    }
}

/// Traffic type to driver table.
#[derive(Debug, Clone)]
pub struct VifRegistry {
    default: Arc<dyn VifDriver>,
    bindings: BTreeMap<TrafficType, Arc<dyn VifDriver>>,
}

impl VifRegistry {
    /// Build the table from configuration.
    ///
    /// Unknown traffic-type keys are ignored; an unknown driver name is a
    /// configuration error.
    pub fn configure(config: &AgentConfig) -> Result<Self> {
        let mut instances: BTreeMap<&'static str, Arc<dyn VifDriver>> = BTreeMap::new();
        let mut instantiate = |name: &str| -> Result<Arc<dyn VifDriver>> {
            let driver = create_driver(name, config)
                .ok_or_else(|| Error::config(format!("cannot instantiate vif driver '{}'", name)))?;
            Ok(instances
                .entry(driver.name())
                .or_insert_with(|| driver.clone())
                .clone())
        };

        let default_name = match config.get(keys::VIF_DRIVER) {
            Some(name) => name,
            None => match config.bridge_type() {
                BridgeType::Native => BRIDGE_DRIVER,
                BridgeType::OpenVswitch => OVS_DRIVER,
            },
        };
        let default = instantiate(default_name)?;

        let mut bindings: BTreeMap<TrafficType, Arc<dyn VifDriver>> = TrafficType::ALL
            .into_iter()
            .map(|t| (t, default.clone()))
            .collect();

        for (type_name, driver_name) in config.with_prefix(keys::VIF_DRIVER_PREFIX) {
            let traffic = match type_name.parse::<TrafficType>() {
                Ok(t) => t,
                Err(e) => {
                    tracing::debug!(key = %format!("{}{}", keys::VIF_DRIVER_PREFIX, type_name), error = %e, "ignoring vif driver override");
                    continue;
                }
            };
            let driver = instantiate(driver_name)?;
            tracing::info!(traffic = %traffic, driver = driver.name(), "vif driver override");
            bindings.insert(traffic, driver);
        }

        Ok(Self { default, bindings })
    }

    /// Driver responsible for a traffic type.
    pub fn lookup(&self, traffic: TrafficType) -> Arc<dyn VifDriver> {
        self.bindings
            .get(&traffic)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }

    pub fn default_driver(&self) -> &Arc<dyn VifDriver> {
        &self.default
    }

    /// Plug a NIC through the driver of its traffic type.
    pub fn plug(&self, nic: &NicSpec) -> Result<InterfaceDef> {
        self.lookup(nic.traffic_type).plug(nic)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> AgentConfig {
        AgentConfig::from_params(pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())))
            .unwrap()
    }

    fn nic(traffic: TrafficType, vlan: Option<u16>) -> NicSpec {
        NicSpec {
            device_id: 0,
            mac: "02:00:4c:5a:00:01".into(),
            traffic_type: traffic,
            vlan,
            network_rate_mbps: Some(200),
            model: None,
        }
    }

    #[test]
    fn test_defaults_follow_bridge_type() {
        let native = VifRegistry::configure(&config(&[])).unwrap();
        let ovs = VifRegistry::configure(&config(&[(keys::BRIDGE_TYPE, "openvswitch")])).unwrap();
        for t in TrafficType::ALL {
            assert_eq!(native.lookup(t).name(), BRIDGE_DRIVER);
            assert_eq!(ovs.lookup(t).name(), OVS_DRIVER);
        }
    }

    #[test]
    fn test_single_override_changes_only_that_type() {
        let reg =
            VifRegistry::configure(&config(&[("libvirt.vif.driver.Guest", "OvsVifDriver")]))
                .unwrap();
        for t in TrafficType::ALL {
            let expected = if t == TrafficType::Guest {
                OVS_DRIVER
            } else {
                BRIDGE_DRIVER
            };
            assert_eq!(reg.lookup(t).name(), expected, "{}", t);
        }
    }

    #[test]
    fn test_unknown_or_empty_type_is_ignored() {
        let reg = VifRegistry::configure(&config(&[
            ("libvirt.vif.driver.", "OvsVifDriver"),
            ("libvirt.vif.driver.Bogus", "OvsVifDriver"),
        ]))
        .unwrap();
        for t in TrafficType::ALL {
            assert_eq!(reg.lookup(t).name(), BRIDGE_DRIVER);
        }
    }

    #[test]
    fn test_unknown_driver_is_config_error() {
        let err = VifRegistry::configure(&config(&[(
            "libvirt.vif.driver.Public",
            "com.example.MissingVifDriver",
        )]))
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_qualified_name_and_global_default() {
        let reg = VifRegistry::configure(&config(&[(
            keys::VIF_DRIVER,
            "com.cloud.hypervisor.kvm.resource.DirectVifDriver",
        )]))
        .unwrap();
        assert_eq!(reg.lookup(TrafficType::Public).name(), DIRECT_DRIVER);
    }

    #[test]
    fn test_shared_instances() {
        let reg = VifRegistry::configure(&config(&[])).unwrap();
        assert!(Arc::ptr_eq(
            &reg.lookup(TrafficType::Public),
            &reg.lookup(TrafficType::Vpn)
        ));
    }

    #[test]
    fn test_bridge_plug() {
        let driver = BridgeVifDriver::new(&config(&[(keys::GUEST_DEVICE, "cloudbr2")]));
        let iface = driver.plug(&nic(TrafficType::Guest, Some(100))).unwrap();
        assert_eq!(
            iface.kind,
            InterfaceKind::Bridge {
                bridge: "brcloudbr2-100".into()
            }
        );
        assert_eq!(iface.bandwidth_kbps, Some(25_000));

        let iface = driver.plug(&nic(TrafficType::Control, None)).unwrap();
        assert_eq!(
            iface.kind,
            InterfaceKind::Bridge {
                bridge: "cloudbr1".into()
            }
        );
    }

    #[test]
    fn test_ovs_plug_tags_vlan() {
        let driver = OvsVifDriver::new(&config(&[]));
        let iface = driver.plug(&nic(TrafficType::Guest, Some(42))).unwrap();
        assert_eq!(iface.virtualport.as_deref(), Some("openvswitch"));
        assert_eq!(iface.vlan, Some(42));
        assert_eq!(
            iface.kind,
            InterfaceKind::Bridge {
                bridge: "cloudbr0".into()
            }
        );
    }

    #[test]
    fn test_direct_rejects_vlan() {
        let driver = DirectVifDriver::new(&config(&[]));
        assert!(driver.plug(&nic(TrafficType::Guest, Some(5))).is_err());
        assert!(driver.plug(&nic(TrafficType::Guest, None)).is_ok());
    }
}
