//! CSI protocol messages carried over the driver socket.
//!
//! [`CsiMessage`] is the envelope for every request and response variant
//! exchanged between a CSI client (the orchestrator's sidecar) and this
//! driver.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

/// Top-level message envelope.
///
/// Each connection carries exactly one request followed by one response.
/// The client sends a *request* variant and the server replies with the
/// corresponding *response* variant (or [`CsiMessage::Error`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // ----- Requests --------------------------------------------------------
    /// Health probe (Identity).
    Probe,
    /// Query plugin info (Identity).
    GetPluginInfo,
    /// Query plugin capabilities (Identity).
    GetPluginCapabilities,

    CreateVolume(CreateVolumeRequest),
    DeleteVolume(VolumeId),
    /// Attach a disk to a node (Controller).
    ControllerPublishVolume(ControllerPublishVolumeRequest),
    /// Detach a disk from a node (Controller).
    ControllerUnpublishVolume(ControllerUnpublishVolumeRequest),
    ControllerExpandVolume(ControllerExpandVolumeRequest),
    ListVolumes(ListVolumesRequest),
    GetCapacity(GetCapacityRequest),
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },
    ControllerGetCapabilities,

    /// Format and mount a device at its staging path (Node).
    NodeStageVolume(NodeStageVolumeRequest),
    NodeUnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    /// Bind-mount a staged volume into a workload (Node).
    NodePublishVolume(NodePublishVolumeRequest),
    NodeUnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    NodeExpandVolume(NodeExpandVolumeRequest),
    NodeGetVolumeStats {
        volume_id: VolumeId,
        volume_path: String,
    },
    NodeGetCapabilities,
    NodeGetInfo,

    // ----- Responses -------------------------------------------------------
    ProbeResult(bool),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    VolumeCreated(Volume),
    /// Publish context for the node, carrying the WWN.
    PublishContext(HashMap<String, String>),
    ControllerExpanded(ControllerExpandVolumeResponse),
    VolumeList(ListVolumesResponse),
    /// Available capacity in bytes.
    Capacity(u64),
    CapabilitiesValidated(ValidateVolumeCapabilitiesResponse),
    ControllerCapabilities(Vec<ControllerCapability>),
    NodeExpanded(NodeExpandVolumeResponse),
    VolumeStatsResponse(VolumeStats),
    NodeCapabilities(Vec<NodeCapability>),
    NodeInfoResponse(NodeInfo),

    /// Generic success acknowledgement (no payload).
    Ok,
    /// An error occurred.
    Error(CsiError),
}

impl CsiMessage {
    pub fn is_request(&self) -> bool {
        !self.is_response()
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::ProbeResult(_)
                | Self::PluginInfoResponse(_)
                | Self::PluginCapabilitiesResponse(_)
                | Self::VolumeCreated(_)
                | Self::PublishContext(_)
                | Self::ControllerExpanded(_)
                | Self::VolumeList(_)
                | Self::Capacity(_)
                | Self::CapabilitiesValidated(_)
                | Self::ControllerCapabilities(_)
                | Self::NodeExpanded(_)
                | Self::VolumeStatsResponse(_)
                | Self::NodeCapabilities(_)
                | Self::NodeInfoResponse(_)
                | Self::Ok
                | Self::Error(_)
        )
    }

    /// Turn an [`Error`](Self::Error) response into `Err`.
    pub fn into_result(self) -> Result<Self, CsiError> {
        match self {
            Self::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

impl std::fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Probe => f.write_str("Probe"),
            Self::GetPluginInfo => f.write_str("GetPluginInfo"),
            Self::GetPluginCapabilities => f.write_str("GetPluginCapabilities"),
            Self::CreateVolume(req) => write!(f, "CreateVolume(name={})", req.name),
            Self::DeleteVolume(id) => write!(f, "DeleteVolume({id})"),
            Self::ControllerPublishVolume(req) => write!(
                f,
                "ControllerPublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerUnpublishVolume(req) => write!(
                f,
                "ControllerUnpublishVolume({}, node={})",
                req.volume_id, req.node_id
            ),
            Self::ControllerExpandVolume(req) => {
                write!(f, "ControllerExpandVolume({})", req.volume_id)
            }
            Self::ListVolumes(_) => f.write_str("ListVolumes"),
            Self::GetCapacity(_) => f.write_str("GetCapacity"),
            Self::ValidateVolumeCapabilities { volume_id, .. } => {
                write!(f, "ValidateVolumeCapabilities({volume_id})")
            }
            Self::ControllerGetCapabilities => f.write_str("ControllerGetCapabilities"),
            Self::NodeStageVolume(req) => write!(f, "NodeStageVolume({})", req.volume_id),
            Self::NodeUnstageVolume { volume_id, .. } => {
                write!(f, "NodeUnstageVolume({volume_id})")
            }
            Self::NodePublishVolume(req) => write!(f, "NodePublishVolume({})", req.volume_id),
            Self::NodeUnpublishVolume { volume_id, .. } => {
                write!(f, "NodeUnpublishVolume({volume_id})")
            }
            Self::NodeExpandVolume(req) => write!(f, "NodeExpandVolume({})", req.volume_id),
            Self::NodeGetVolumeStats { volume_id, .. } => {
                write!(f, "NodeGetVolumeStats({volume_id})")
            }
            Self::NodeGetCapabilities => f.write_str("NodeGetCapabilities"),
            Self::NodeGetInfo => f.write_str("NodeGetInfo"),
            Self::ProbeResult(ok) => write!(f, "ProbeResult({ok})"),
            Self::PluginInfoResponse(info) => write!(f, "PluginInfo(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => {
                write!(f, "PluginCapabilities(count={})", caps.len())
            }
            Self::VolumeCreated(v) => write!(f, "VolumeCreated({})", v.volume_id),
            Self::PublishContext(ctx) => write!(f, "PublishContext(keys={})", ctx.len()),
            Self::ControllerExpanded(r) => write!(f, "ControllerExpanded({})", r.capacity_bytes),
            Self::VolumeList(list) => write!(f, "VolumeList(count={})", list.entries.len()),
            Self::Capacity(c) => write!(f, "Capacity({c})"),
            Self::CapabilitiesValidated(r) => {
                write!(f, "CapabilitiesValidated({})", r.confirmed.is_some())
            }
            Self::ControllerCapabilities(caps) => {
                write!(f, "ControllerCapabilities(count={})", caps.len())
            }
            Self::NodeExpanded(r) => write!(f, "NodeExpanded({})", r.capacity_bytes),
            Self::VolumeStatsResponse(s) => write!(f, "VolumeStats(count={})", s.usage.len()),
            Self::NodeCapabilities(caps) => write!(f, "NodeCapabilities(count={})", caps.len()),
            Self::NodeInfoResponse(info) => write!(f, "NodeInfo({})", info.node_id),
            Self::Ok => f.write_str("Ok"),
            Self::Error(e) => write!(f, "Error({e})"),
        }
    }
}
