//! CSI Controller service trait.
//!
//! The Controller service owns the cluster-wide side of the volume
//! lifecycle: provisioning and deleting disks on the cloud backend,
//! attaching them to and detaching them from compute instances, and growing
//! them.  It never touches a node's filesystem.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    ControllerCapability, ControllerExpandVolumeRequest, ControllerExpandVolumeResponse,
    ControllerPublishVolumeRequest, ControllerUnpublishVolumeRequest, CreateVolumeRequest,
    GetCapacityRequest, ListVolumesRequest, ListVolumesResponse,
    ValidateVolumeCapabilitiesResponse, Volume, VolumeCapability, VolumeId,
};

/// Volume management against the cloud backend.
#[async_trait]
pub trait CsiController: Send + Sync {
    /// Provision a new volume, or return the one already provisioned under
    /// `req.name`.
    ///
    /// The returned [`Volume`] carries the `volume_context` that is forwarded
    /// to subsequent Node operations.
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    /// Delete a volume.  Deleting a volume that does not exist succeeds.
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// Attach a volume to a node and wait until the attachment is visible.
    ///
    /// Returns the publish context the node needs to find the device.
    async fn publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError>;

    /// Detach a volume from a node.  Missing volumes or attachments succeed.
    async fn unpublish_volume(&self, req: ControllerUnpublishVolumeRequest)
    -> Result<(), CsiError>;

    /// Grow a volume on the backend.
    async fn expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError>;

    /// Check whether the given capabilities are compatible with the volume.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError>;

    /// List volumes, one page at a time.
    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, CsiError>;

    /// Capacity in bytes available for new volumes.
    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<u64, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError>;
}
