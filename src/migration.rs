//! Live-migration parameters.

use serde::Serialize;
use std::fmt;

pub const PARAM_DEST_NAME: &str = "destination_name";
pub const PARAM_DEST_XML: &str = "destination_xml";
pub const PARAM_URI: &str = "migrate_uri";
pub const PARAM_BANDWIDTH: &str = "bandwidth";
pub const PARAM_MIGRATE_DISKS: &str = "migrate_disks";

/// Transport scheme prefixed to the destination address.
pub const TRANSPORT_SCHEME: &str = "tcp:";

/// Typed value of a migration parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    String(String),
    ULong(u64),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::String(s) => f.write_str(s),
            ParamValue::ULong(v) => write!(f, "{}", v),
        }
    }
}

/// Ordered parameter list consumed by the hypervisor's migrate call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct MigrateParameterSet {
    params: Vec<(&'static str, ParamValue)>,
}

impl MigrateParameterSet {
    /// Build the parameters for one migration.
    ///
    /// `bandwidth` is in MiB/s, zero meaning unlimited. Disk labels select
    /// block migration of just those disks; duplicates are dropped.
    pub fn build(
        destination_name: &str,
        descriptor_xml: &str,
        destination_ip: &str,
        bandwidth: u64,
        disk_labels: &[String],
    ) -> Self {
        let mut params = vec![
            (PARAM_DEST_NAME, ParamValue::String(destination_name.to_string())),
            (PARAM_DEST_XML, ParamValue::String(descriptor_xml.to_string())),
            (
                PARAM_URI,
                ParamValue::String(format!("{}{}", TRANSPORT_SCHEME, destination_ip)),
            ),
            (PARAM_BANDWIDTH, ParamValue::ULong(bandwidth)),
        ];

        let mut seen = std::collections::HashSet::new();
        for label in disk_labels {
            if seen.insert(label.as_str()) {
                params.push((PARAM_MIGRATE_DISKS, ParamValue::String(label.clone())));
            }
        }

        Self { params }
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &ParamValue)> {
        self.params.iter().map(|(k, v)| (*k, v))
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|(k, _)| *k == name).map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ParamValue::String(s) => Some(s),
            ParamValue::ULong(_) => None,
        }
    }

    /// Disks selected for block migration, in insertion order.
    pub fn migrate_disks(&self) -> Vec<&str> {
        self.params
            .iter()
            .filter(|(k, _)| *k == PARAM_MIGRATE_DISKS)
            .filter_map(|(_, v)| match v {
                ParamValue::String(s) => Some(s.as_str()),
                ParamValue::ULong(_) => None,
            })
            .collect()
    }

    pub fn bandwidth(&self) -> u64 {
        match self.get(PARAM_BANDWIDTH) {
            Some(ParamValue::ULong(v)) => *v,
            _ => 0,
        }
    }
}

/// Migration behaviour flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrateFlags {
    pub live: bool,
    pub persist_destination: bool,
    pub undefine_source: bool,
    /// Copy the selected non-shared disks along with memory.
    pub non_shared_disk: bool,
    pub auto_converge: bool,
}

impl Default for MigrateFlags {
    fn default() -> Self {
        Self {
            live: true,
            persist_destination: true,
            undefine_source: true,
            non_shared_disk: false,
            auto_converge: false,
        }
    }
}
