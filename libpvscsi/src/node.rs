//! CSI Node service trait.
//!
//! The Node service runs on each worker and makes an attached disk usable
//! by workloads:
//!
//! 1. **Stage**: find the device, format it if blank and mount it at the
//!    per-volume staging path (raw block volumes are bound to a file).
//! 2. **Publish**: bind-mount the staged volume into the workload's path.
//! 3. **Unpublish**: remove that bind-mount.
//! 4. **Unstage**: unmount the staging path once nothing else uses it.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeInfo,
    NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId, VolumeStats,
};

/// Local device, format and mount operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at its staging path.
    ///
    /// Staging an already-staged volume succeeds.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unmount the staging path.
    ///
    /// Unstaging an unstaged volume succeeds.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Bind-mount the staged volume at the workload's target path.
    ///
    /// Idempotent for an identical request.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Remove the workload's bind-mount.
    async fn unpublish_volume(&self, volume_id: &VolumeId, target_path: &str)
    -> Result<(), CsiError>;

    /// Grow the filesystem after the controller grew the disk.
    async fn expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, CsiError>;

    /// Space and inode usage of a published volume.
    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError>;

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;
}
