//! Protocol types for communication between the control plane and hostagent.
//!
//! Messages are JSON documents framed with a 4-byte big-endian length
//! header. Requests are internally tagged by `kind`; a tag the agent does
//! not know decodes to [`AgentRequest::Unknown`] so it can be answered with
//! an "unsupported" result instead of a decode failure.

mod vm;

pub use vm::{
    BootMode, DiskBus, DiskDevice, DiskEncryption, DiskFormat, DiskSpec, DiskThrottle, NicModel,
    NicSpec, TrafficType, UnknownTrafficType, VmKind, VmSpec,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

/// Protocol version reported by `Ready`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum accepted frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Request sent by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Host readiness check after (re)connect.
    Ready,
    /// Liveness probe.
    Ping,
    StartVm {
        vm: VmSpec,
    },
    StopVm {
        name: String,
        #[serde(default)]
        force: bool,
    },
    RebootVm {
        name: String,
    },
    CheckVmState {
        name: String,
    },
    /// Define the incoming VM on this (destination) host.
    PrepareForMigration {
        vm: VmSpec,
    },
    MigrateVm {
        name: String,
        destination_ip: String,
        /// Name of the domain on the destination; defaults to `name`.
        #[serde(default)]
        destination_name: Option<String>,
        /// Spec to rebuild the destination descriptor from; when absent the
        /// running domain's descriptor is sent unchanged.
        #[serde(default)]
        vm: Option<VmSpec>,
        /// Disk labels for selective block migration.
        #[serde(default)]
        migrate_disks: Vec<String>,
    },
    GetVmStats {
        names: Vec<String>,
    },
    GetHostStats,
    AttachDisk {
        name: String,
        disk: DiskSpec,
    },
    DetachDisk {
        name: String,
        disk: DiskSpec,
    },
    PlugNic {
        name: String,
        nic: NicSpec,
    },
    UnplugNic {
        name: String,
        nic: NicSpec,
    },
    CheckHealth,
    /// Fence the VMs of a host that stopped reporting.
    Fence {
        host_ip: String,
        #[serde(default)]
        vms: Vec<String>,
    },
    /// Any request kind this agent does not recognise.
    #[serde(other)]
    Unknown,
}

/// Discriminant of an [`AgentRequest`], used as the dispatch-table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    Ready,
    Ping,
    StartVm,
    StopVm,
    RebootVm,
    CheckVmState,
    PrepareForMigration,
    MigrateVm,
    GetVmStats,
    GetHostStats,
    AttachDisk,
    DetachDisk,
    PlugNic,
    UnplugNic,
    CheckHealth,
    Fence,
    Unknown,
}

impl AgentRequest {
    pub fn kind(&self) -> RequestKind {
        match self {
            AgentRequest::Ready => RequestKind::Ready,
            AgentRequest::Ping => RequestKind::Ping,
            AgentRequest::StartVm { .. } => RequestKind::StartVm,
            AgentRequest::StopVm { .. } => RequestKind::StopVm,
            AgentRequest::RebootVm { .. } => RequestKind::RebootVm,
            AgentRequest::CheckVmState { .. } => RequestKind::CheckVmState,
            AgentRequest::PrepareForMigration { .. } => RequestKind::PrepareForMigration,
            AgentRequest::MigrateVm { .. } => RequestKind::MigrateVm,
            AgentRequest::GetVmStats { .. } => RequestKind::GetVmStats,
            AgentRequest::GetHostStats => RequestKind::GetHostStats,
            AgentRequest::AttachDisk { .. } => RequestKind::AttachDisk,
            AgentRequest::DetachDisk { .. } => RequestKind::DetachDisk,
            AgentRequest::PlugNic { .. } => RequestKind::PlugNic,
            AgentRequest::UnplugNic { .. } => RequestKind::UnplugNic,
            AgentRequest::CheckHealth => RequestKind::CheckHealth,
            AgentRequest::Fence { .. } => RequestKind::Fence,
            AgentRequest::Unknown => RequestKind::Unknown,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Lifecycle state of a domain as reported by the hypervisor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Running,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Unknown,
}

/// Per-domain statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DomainStats {
    pub name: String,
    pub vcpus: u32,
    /// Cumulative CPU time in nanoseconds.
    pub cpu_time_ns: u64,
    pub memory_kib: u64,
    /// Guest-reported free memory when a balloon driver is present.
    pub memory_unused_kib: Option<u64>,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
}

/// Host-wide statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostStats {
    pub cpus: u32,
    pub cpu_mhz: u32,
    pub total_memory_kib: u64,
    pub free_memory_kib: u64,
}

/// Reachability of one storage pool as seen by the HA monitor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolHealth {
    pub uuid: String,
    pub path: String,
    pub reachable: bool,
    pub consecutive_failures: u32,
}

/// Snapshot of host health.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostHealth {
    pub healthy: bool,
    pub pools: Vec<PoolHealth>,
}

/// Optional structured payload attached to a result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultPayload {
    Ready {
        protocol_version: u32,
        host_ip: Option<String>,
        library_version: u64,
        hypervisor_version: u64,
        capabilities: BTreeMap<String, bool>,
    },
    Domains {
        names: Vec<String>,
    },
    DomainXml {
        xml: String,
    },
    State {
        state: Option<DomainState>,
    },
    VmStats {
        stats: Vec<DomainStats>,
    },
    HostStats {
        stats: HostStats,
    },
    Health {
        health: HostHealth,
    },
    Fenced {
        vms: Vec<String>,
    },
}

/// Outcome of one request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub success: bool,
    pub details: String,
    /// Set when the agent does not implement the request kind.
    #[serde(default)]
    pub unsupported: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<ResultPayload>,
}

impl CommandResult {
    pub fn success(details: impl Into<String>) -> Self {
        Self {
            success: true,
            details: details.into(),
            unsupported: false,
            payload: None,
        }
    }

    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            success: false,
            details: details.into(),
            unsupported: false,
            payload: None,
        }
    }

    pub fn unsupported(kind: RequestKind) -> Self {
        Self {
            success: false,
            details: format!("unsupported request: {}", kind),
            unsupported: true,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: ResultPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn is_unsupported(&self) -> bool {
        self.unsupported
    }
}

/// Frame encoding or decoding error.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Encode a message as a length-prefixed JSON frame.
///
/// Messages the reading side would reject are refused here.
pub fn encode_message<T: Serialize>(msg: &T) -> Result<Vec<u8>, DecodeError> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(DecodeError::FrameTooLarge(json.len()));
    }
    let mut buf = Vec::with_capacity(4 + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Write one framed message.
pub fn write_message<T: Serialize>(stream: &mut impl Write, msg: &T) -> Result<(), DecodeError> {
    let data = encode_message(msg)?;
    stream.write_all(&data)?;
    stream.flush()?;
    Ok(())
}

/// Read one raw frame payload.
///
/// Returns `Ok(None)` on a clean end of stream before a header.
pub fn read_frame(stream: &mut impl Read) -> Result<Option<Vec<u8>>, DecodeError> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(DecodeError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf)?;
    tracing::trace!(len, "read frame");
    Ok(Some(buf))
}

/// Read and decode one framed message.
pub fn read_message<T: serde::de::DeserializeOwned>(
    stream: &mut impl Read,
) -> Result<Option<T>, DecodeError> {
    match read_frame(stream)? {
        Some(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_unknown_kind_decodes_to_unknown() {
        let req: AgentRequest =
            serde_json::from_str(r#"{"kind": "resize_volume", "size": 10}"#).unwrap();
        assert_eq!(req, AgentRequest::Unknown);
        assert_eq!(req.kind(), RequestKind::Unknown);
    }

    #[test]
    fn test_request_tagging() {
        let req = AgentRequest::StopVm {
            name: "r-4-VM".into(),
            force: true,
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["kind"], "stop_vm");
        assert_eq!(json["force"], true);

        let req: AgentRequest = serde_json::from_str(r#"{"kind":"stop_vm","name":"x"}"#).unwrap();
        assert!(matches!(req, AgentRequest::StopVm { force: false, .. }));
    }

    #[test]
    fn test_framing() {
        let mut buf = Vec::new();
        write_message(&mut buf, &AgentRequest::Ping).unwrap();
        write_message(&mut buf, &AgentRequest::GetHostStats).unwrap();
        let ping_len = serde_json::to_vec(&AgentRequest::Ping).unwrap().len() as u32;
        assert_eq!(&buf[..4], &ping_len.to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let first: Option<AgentRequest> = read_message(&mut cursor).unwrap();
        let second: Option<AgentRequest> = read_message(&mut cursor).unwrap();
        let eof: Option<AgentRequest> = read_message(&mut cursor).unwrap();
        assert_eq!(first, Some(AgentRequest::Ping));
        assert_eq!(second, Some(AgentRequest::GetHostStats));
        assert_eq!(eof, None);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes();
        let mut cursor = Cursor::new(header.to_vec());
        assert!(matches!(
            read_frame(&mut cursor),
            Err(DecodeError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_oversized_message_is_not_written() {
        let huge = CommandResult::success("x".repeat(MAX_FRAME_SIZE));
        assert!(matches!(
            encode_message(&huge),
            Err(DecodeError::FrameTooLarge(len)) if len > MAX_FRAME_SIZE
        ));

        let mut buf = Vec::new();
        assert!(write_message(&mut buf, &huge).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unsupported_result_is_distinct() {
        let unsupported = CommandResult::unsupported(RequestKind::Unknown);
        let failed = CommandResult::failure("boom");
        assert!(unsupported.is_unsupported());
        assert!(!failed.is_unsupported());
        assert!(!unsupported.success);
    }
}
