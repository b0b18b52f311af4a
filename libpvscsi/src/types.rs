//! Core CSI types: volumes, capabilities, requests, and topology.
//!
//! These types form the data model shared by the CSI traits, the socket
//! transport, and the controller / node services.  They are all
//! [`Serialize`]/[`Deserialize`] so they can be carried as JSON.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Opaque, unique identifier for a volume.  For PowerVS this is the
/// backend-assigned volume UUID.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub String);

impl VolumeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Read-write on a single node.
    SingleNodeWriter,
    /// Read-only on a single node.
    SingleNodeReaderOnly,
    /// Read-only on many nodes.
    MultiNodeReaderOnly,
    /// Read-only on many nodes, writable on one.
    MultiNodeSingleWriter,
    /// Read-write on many nodes.
    MultiNodeMultiWriter,
}

/// Whether the volume is consumed as a filesystem or as a raw block device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// Filesystem mount.  An empty `fs_type` selects the driver default.
    Mount {
        #[serde(default)]
        fs_type: String,
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// Raw block device.
    Block,
}

/// Describes the capabilities required from a volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeCapability {
    /// Requested access mode.
    pub access_mode: AccessMode,
    /// Filesystem or block access.
    pub access_type: AccessType,
}

impl VolumeCapability {
    /// A filesystem capability with the given type and flags.
    pub fn mount(fs_type: impl Into<String>, mount_flags: Vec<String>) -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Mount {
                fs_type: fs_type.into(),
                mount_flags,
            },
        }
    }

    /// A raw block capability.
    pub fn block() -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Block,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.access_type, AccessType::Block)
    }
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self::mount("", Vec::new())
    }
}

/// Requested size bounds, in bytes.  A zero field means "unset".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapacityRange {
    pub required_bytes: u64,
    pub limit_bytes: u64,
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// Full metadata for a provisioned volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Unique volume identifier.
    pub volume_id: VolumeId,
    /// Provisioned capacity in bytes (always a whole number of GiB).
    pub capacity_bytes: u64,
    /// Opaque context passed from Controller to Node operations.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
    /// Topology constraints (disk tier).
    #[serde(default)]
    pub accessible_topology: Vec<Topology>,
}

/// Topology constraint expressed as key-value segments.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Topology {
    /// Topology segments, e.g. `{"topology.powervs.csi.ibm.com/disk-type": "tier3"}`.
    #[serde(default)]
    pub segments: HashMap<String, String>,
}

/// Where a new volume must (requisite) or should (preferred) be accessible.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyRequirement {
    #[serde(default)]
    pub requisite: Vec<Topology>,
    #[serde(default)]
    pub preferred: Vec<Topology>,
}

// ---------------------------------------------------------------------------
// Controller requests / responses
// ---------------------------------------------------------------------------

/// Request to create a new volume.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Orchestrator-chosen name; the idempotency key for creation.
    pub name: String,
    /// Desired size bounds; `None` selects the default size.
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    /// Required capabilities.
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage-class parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// Topology the volume has to be reachable from.
    #[serde(default)]
    pub accessibility_requirements: Option<TopologyRequirement>,
}

/// Attach a volume to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerPublishVolumeRequest {
    pub volume_id: VolumeId,
    /// PowerVS instance ID of the target node.
    pub node_id: String,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Detach a volume from a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerUnpublishVolumeRequest {
    pub volume_id: VolumeId,
    pub node_id: String,
}

/// Grow a volume on the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerExpandVolumeRequest {
    pub volume_id: VolumeId,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerExpandVolumeResponse {
    pub capacity_bytes: u64,
    /// Whether the node still has to grow the filesystem.
    pub node_expansion_required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListVolumesRequest {
    /// Zero means "no limit".
    #[serde(default)]
    pub max_entries: usize,
    #[serde(default)]
    pub starting_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVolumesResponse {
    pub entries: Vec<Volume>,
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetCapacityRequest {
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateVolumeCapabilitiesResponse {
    /// The confirmed capabilities, or `None` when any was unsupported.
    pub confirmed: Option<Vec<VolumeCapability>>,
    #[serde(default)]
    pub message: String,
}

/// Capabilities advertised by the controller service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControllerCapability {
    CreateDeleteVolume,
    PublishUnpublishVolume,
    ExpandVolume,
    ListVolumes,
    GetCapacity,
}

// ---------------------------------------------------------------------------
// Node requests / responses
// ---------------------------------------------------------------------------

/// Request to stage (format and globally mount) a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    /// Volume to stage.
    pub volume_id: VolumeId,
    /// Global staging mount point.
    pub staging_target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Context returned by `ControllerPublishVolume`; carries the WWN.
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
    /// Opaque context carried from `CreateVolume`.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume into a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    /// Volume to publish.
    pub volume_id: VolumeId,
    /// The global staging mount point (source of the bind mount).
    pub staging_target_path: String,
    /// Per-workload target path.
    pub target_path: String,
    /// Requested capability.
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
    /// Whether the bind mount should be read-only.
    #[serde(default)]
    pub read_only: bool,
    /// Context returned by `ControllerPublishVolume`.
    #[serde(default)]
    pub publish_context: HashMap<String, String>,
}

/// Grow the filesystem of a published volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExpandVolumeRequest {
    pub volume_id: VolumeId,
    pub volume_path: String,
    #[serde(default)]
    pub staging_target_path: Option<String>,
    #[serde(default)]
    pub capacity_range: Option<CapacityRange>,
    #[serde(default)]
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeExpandVolumeResponse {
    pub capacity_bytes: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsageUnit {
    Bytes,
    Inodes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeUsage {
    pub unit: UsageUnit,
    pub total: u64,
    pub used: u64,
    pub available: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeStats {
    pub usage: Vec<VolumeUsage>,
}

/// Capabilities advertised by the node service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    StageUnstageVolume,
    ExpandVolume,
    GetVolumeStats,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

/// Information about the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name, e.g. `"powervs.csi.ibm.com"`.
    pub name: String,
    /// Vendor-provided version string.
    pub vendor_version: String,
}

/// Capabilities advertised by the CSI plugin.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    /// Plugin provides a Controller service.
    ControllerService,
    /// Plugin supports volume topology constraints.
    VolumeAccessibilityConstraints,
}

/// Information about the node on which the CSI Node service runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// PowerVS instance ID of this node.
    pub node_id: String,
    /// Maximum number of volumes the node can host.
    pub max_volumes: u64,
    /// Optional topology of this node.
    #[serde(default)]
    pub accessible_topology: Option<Topology>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_id_display() {
        let id = VolumeId("vol-abc".into());
        assert_eq!(id.to_string(), "vol-abc");
    }

    #[test]
    fn create_volume_request_default() {
        let req = CreateVolumeRequest::default();
        assert!(req.name.is_empty());
        assert!(req.capacity_range.is_none());
    }

    #[test]
    fn volume_capability_default() {
        let cap = VolumeCapability::default();
        assert_eq!(cap.access_mode, AccessMode::SingleNodeWriter);
        assert!(!cap.is_block());
        assert!(VolumeCapability::block().is_block());
    }

    #[test]
    fn publish_request_fields_default_when_absent() {
        let json = r#"{
            "volume_id": "v1",
            "staging_target_path": "/staging",
            "target_path": "/mnt/p1"
        }"#;
        let req: NodePublishVolumeRequest = serde_json::from_str(json).expect("deserialize");
        assert!(!req.read_only);
        assert!(req.volume_capability.is_none());
        assert!(req.publish_context.is_empty());
    }
}
