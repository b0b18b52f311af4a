//! [`CsiNode`] on top of a [`Mounter`].
//!
//! # Paths
//!
//! ```text
//! <staging>/               # filesystem volume: the device's mount
//! <staging>/<volume-id>    # block volume: file the device is bound onto
//! <target>                 # directory (filesystem) or file (block) bound
//!                          # from the staging path
//! ```
//!
//! Every verb re-reads the mount table; nothing is remembered between calls.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::cloud::{Cloud, PvmInstance};
use crate::driver::{DEFAULT_FS_TYPE, DEFAULT_MAX_VOLUMES, DISK_TYPE_KEY, FS_TYPE_KEY, WWN_KEY};
use crate::error::CsiError;
use crate::locks::VolumeLocks;
use crate::mounter::{MountError, MountPoint, Mounter, is_corrupted_mount};
use crate::node::CsiNode;
use crate::types::*;

use super::{require_capability, require_field, require_id};

/// How long to look for a freshly attached device before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceScanPolicy {
    pub attempts: u32,
    /// Pause after each SCSI rescan.
    pub interval: Duration,
}

impl Default for DeviceScanPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

pub struct NodeService {
    mounter: Arc<dyn Mounter>,
    /// Used only for the node's topology.
    cloud: Option<Arc<dyn Cloud>>,
    locks: Arc<VolumeLocks>,
    instance_id: String,
    max_volumes: u64,
    device_scan: DeviceScanPolicy,
}

impl NodeService {
    pub fn new(mounter: Arc<dyn Mounter>, instance_id: impl Into<String>) -> Self {
        Self {
            mounter,
            cloud: None,
            locks: Arc::new(VolumeLocks::new()),
            instance_id: instance_id.into(),
            max_volumes: DEFAULT_MAX_VOLUMES,
            device_scan: DeviceScanPolicy::default(),
        }
    }

    pub fn with_cloud(mut self, cloud: Arc<dyn Cloud>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    pub fn with_locks(mut self, locks: Arc<VolumeLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Attach limit reported to the orchestrator; zero keeps the default.
    pub fn with_max_volumes(mut self, max_volumes: u64) -> Self {
        if max_volumes > 0 {
            self.max_volumes = max_volumes;
        }
        self
    }

    pub fn with_device_scan(mut self, policy: DeviceScanPolicy) -> Self {
        self.device_scan = policy;
        self
    }

    /// The instance this node runs on.  The configured identity may be the
    /// instance's server name rather than its ID.
    async fn resolve_instance(&self, cloud: &dyn Cloud) -> Result<PvmInstance, CsiError> {
        match cloud.get_pvm_instance_by_id(&self.instance_id).await {
            Ok(instance) => Ok(instance),
            Err(e) if e.is_not_found() => {
                debug!(name = %self.instance_id, "no instance with that ID, looking up by name");
                Ok(cloud.get_pvm_instance_by_name(&self.instance_id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the device for `wwn`, rescanning the SCSI bus between tries.
    async fn find_device(&self, wwn: &str) -> Result<PathBuf, CsiError> {
        for attempt in 1..=self.device_scan.attempts {
            if let Some(device) = self.mounter.find_device_by_wwn(wwn).await? {
                return Ok(device);
            }
            debug!(wwn, attempt, "device not visible yet, rescanning SCSI hosts");
            self.mounter.rescan_scsi_bus().await?;
            tokio::time::sleep(self.device_scan.interval).await;
        }
        Err(CsiError::DeviceNotFound(wwn.to_owned()))
    }

    /// Make sure `path` exists and is usable as a mount target.
    ///
    /// Returns the mount already covering it, if any.  A corrupted mount is
    /// force-unmounted first and reported as no mount.
    async fn prepare_target(
        &self,
        path: &Path,
        is_file: bool,
    ) -> Result<Option<MountPoint>, CsiError> {
        match self.mounter.path_exists(path).await {
            Ok(true) => return Ok(self.mounter.mount_at(path).await?),
            Ok(false) => {}
            Err(e) if is_corrupted_mount(&e) => {
                warn!(path = %path.display(), error = %e, "corrupted mount, force unmounting");
                self.mounter
                    .force_unmount(path)
                    .await
                    .map_err(|e| unmount_failed(path, e))?;
                if self.mounter.path_exists(path).await? {
                    return Ok(None);
                }
            }
            Err(e) => return Err(e.into()),
        }
        if is_file {
            self.mounter.make_file(path).await?;
        } else {
            self.mounter.make_dir(path).await?;
        }
        Ok(None)
    }

    async fn stage_filesystem(
        &self,
        device: &Path,
        staging: &Path,
        fs_type: &str,
        mount_flags: &[String],
    ) -> Result<(), CsiError> {
        if let Some(existing) = self.prepare_target(staging, false).await? {
            if self
                .mounter
                .same_device(Path::new(&existing.device), device)
                .await?
            {
                debug!(device = %device.display(), "volume already staged");
                return Ok(());
            }
            return Err(CsiError::FailedPrecondition(format!(
                "staging path {} is mounted from {}, not {}",
                staging.display(),
                existing.device,
                device.display()
            )));
        }

        match self.mounter.disk_format(device).await? {
            None => {
                info!(device = %device.display(), fs_type, "formatting blank device");
                self.mounter
                    .format(device, fs_type)
                    .await
                    .map_err(|e| CsiError::FormatFailed {
                        device: device.display().to_string(),
                        reason: e.to_string(),
                    })?;
            }
            Some(existing) if existing == fs_type => {}
            Some(existing) => {
                return Err(CsiError::FailedPrecondition(format!(
                    "device {} holds {existing}, {fs_type} requested",
                    device.display()
                )));
            }
        }

        self.mounter
            .mount(device, staging, fs_type, mount_flags)
            .await
            .map_err(|e| mount_failed(staging, e))?;

        self.grow_if_needed(device, staging, fs_type).await?;
        Ok(())
    }

    async fn stage_block(&self, device: &Path, target: &Path) -> Result<(), CsiError> {
        if self.prepare_target(target, true).await?.is_some() {
            debug!(target = %target.display(), "block device already staged");
            return Ok(());
        }
        self.mounter
            .mount(device, target, "", &["bind".to_owned()])
            .await
            .map_err(|e| mount_failed(target, e))
    }

    /// Grow the filesystem when the device under it is larger.  Returns the
    /// device size.
    async fn grow_if_needed(
        &self,
        device: &Path,
        mount_path: &Path,
        fs_type: &str,
    ) -> Result<u64, CsiError> {
        let device_size = self.mounter.device_size(device).await?;
        let fs_size = self
            .mounter
            .filesystem_size(device, mount_path, fs_type)
            .await?;
        if fs_size < device_size {
            info!(device = %device.display(), fs_size, device_size, "growing filesystem");
            self.mounter
                .resize_filesystem(device, mount_path, fs_type)
                .await
                .map_err(|e| CsiError::ResizeFailed {
                    path: mount_path.display().to_string(),
                    reason: e.to_string(),
                })?;
        }
        Ok(device_size)
    }
}

fn mount_failed(path: &Path, e: MountError) -> CsiError {
    CsiError::MountFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn unmount_failed(path: &Path, e: MountError) -> CsiError {
    CsiError::UnmountFailed {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn block_path(staging: &Path, volume_id: &VolumeId) -> PathBuf {
    staging.join(volume_id.as_str())
}

#[async_trait]
impl CsiNode for NodeService {
    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError> {
        require_id(&req.volume_id)?;
        require_field("staging target path", &req.staging_target_path)?;
        let cap = require_capability(req.volume_capability.as_ref())?;
        let wwn = req
            .publish_context
            .get(WWN_KEY)
            .filter(|w| !w.is_empty())
            .ok_or_else(|| CsiError::InvalidArgument("WWN missing from publish context".into()))?;

        let _guard = self.locks.lock(req.volume_id.as_str())?;
        let device = self.find_device(wwn).await?;
        let staging = Path::new(&req.staging_target_path);

        match &cap.access_type {
            AccessType::Block => {
                self.stage_block(&device, &block_path(staging, &req.volume_id))
                    .await?;
            }
            AccessType::Mount {
                fs_type,
                mount_flags,
            } => {
                let fs_type = if !fs_type.is_empty() {
                    fs_type.as_str()
                } else {
                    req.volume_context
                        .get(FS_TYPE_KEY)
                        .map(String::as_str)
                        .unwrap_or(DEFAULT_FS_TYPE)
                };
                self.stage_filesystem(&device, staging, fs_type, mount_flags)
                    .await?;
            }
        }

        info!(device = %device.display(), staging = %staging.display(), "volume staged");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError> {
        require_id(volume_id)?;
        require_field("staging target path", staging_target_path)?;
        let _guard = self.locks.lock(volume_id.as_str())?;
        let staging = Path::new(staging_target_path);

        let corrupted = match self.mounter.path_exists(staging).await {
            Ok(_) => false,
            Err(e) if is_corrupted_mount(&e) => {
                warn!(error = %e, "corrupted staging mount");
                true
            }
            Err(e) => return Err(e.into()),
        };

        let block = block_path(staging, volume_id);
        let mount = match self.mounter.mount_at(&block).await? {
            Some(m) => Some(m),
            None => self.mounter.mount_at(staging).await?,
        };
        let Some(mount) = mount else {
            if corrupted {
                self.mounter
                    .force_unmount(staging)
                    .await
                    .map_err(|e| unmount_failed(staging, e))?;
                return Ok(());
            }
            debug!("volume not staged");
            self.mounter.remove_path(&block).await?;
            return Ok(());
        };

        let refs = self.mounter.mount_refs(&mount).await.map_err(|e| {
            CsiError::FailedPrecondition(format!(
                "cannot check whether {} is still in use: {e}",
                mount.path.display()
            ))
        })?;
        if !refs.is_empty() {
            let refs: Vec<_> = refs.iter().map(|p| p.display().to_string()).collect();
            return Err(CsiError::FailedPrecondition(format!(
                "{} is still mounted at {}",
                mount.device,
                refs.join(", ")
            )));
        }

        if corrupted {
            warn!(path = %mount.path.display(), "force unmounting corrupted staging mount");
            self.mounter
                .force_unmount(&mount.path)
                .await
                .map_err(|e| unmount_failed(&mount.path, e))?;
        } else {
            self.mounter
                .unmount(&mount.path)
                .await
                .map_err(|e| unmount_failed(&mount.path, e))?;
        }
        if mount.path == block {
            self.mounter.remove_path(&block).await?;
        }
        info!(device = %mount.device, "volume unstaged");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, target = %req.target_path))]
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError> {
        require_id(&req.volume_id)?;
        require_field("staging target path", &req.staging_target_path)?;
        require_field("target path", &req.target_path)?;
        let cap = require_capability(req.volume_capability.as_ref())?;

        let _guard = self.locks.lock(req.volume_id.as_str())?;
        let staging = Path::new(&req.staging_target_path);
        let target = Path::new(&req.target_path);
        let is_block = cap.is_block();
        let source = if is_block {
            block_path(staging, &req.volume_id)
        } else {
            staging.to_path_buf()
        };

        if !self.mounter.is_mount_point(&source).await? {
            return Err(CsiError::FailedPrecondition(format!(
                "volume {} is not staged at {}",
                req.volume_id,
                source.display()
            )));
        }

        if let Some(existing) = self.prepare_target(target, is_block).await? {
            if existing.is_read_only() == req.read_only {
                debug!("volume already published");
                return Ok(());
            }
            return Err(CsiError::AlreadyExists(format!(
                "{} is already published with read_only={}",
                target.display(),
                existing.is_read_only()
            )));
        }

        let mut options = vec!["bind".to_owned()];
        if req.read_only {
            options.push("ro".to_owned());
        }
        self.mounter
            .mount(&source, target, "", &options)
            .await
            .map_err(|e| mount_failed(target, e))?;

        info!(read_only = req.read_only, "volume published");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError> {
        require_id(volume_id)?;
        require_field("target path", target_path)?;
        let _guard = self.locks.lock(volume_id.as_str())?;
        let target = Path::new(target_path);

        match self.mounter.path_exists(target).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("target gone, nothing to unpublish");
                return Ok(());
            }
            Err(e) if is_corrupted_mount(&e) => {
                warn!(error = %e, "corrupted target mount, force unmounting");
                self.mounter
                    .force_unmount(target)
                    .await
                    .map_err(|e| unmount_failed(target, e))?;
            }
            Err(e) => return Err(e.into()),
        }

        while self.mounter.is_mount_point(target).await? {
            self.mounter
                .unmount(target)
                .await
                .map_err(|e| unmount_failed(target, e))?;
        }
        self.mounter.remove_path(target).await?;
        info!("volume unpublished");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn expand_volume(
        &self,
        req: NodeExpandVolumeRequest,
    ) -> Result<NodeExpandVolumeResponse, CsiError> {
        require_id(&req.volume_id)?;
        require_field("volume path", &req.volume_path)?;
        let _guard = self.locks.lock(req.volume_id.as_str())?;

        if req.volume_capability.as_ref().is_some_and(|c| c.is_block()) {
            debug!("block volume, nothing to grow");
            return Ok(NodeExpandVolumeResponse {
                capacity_bytes: req.capacity_range.map_or(0, |r| r.required_bytes),
            });
        }

        let volume_path = Path::new(&req.volume_path);
        let mount = self
            .mounter
            .mount_at(volume_path)
            .await?
            .ok_or_else(|| CsiError::VolumeNotFound(req.volume_id.to_string()))?;
        let device = PathBuf::from(&mount.device);
        let capacity_bytes = self
            .grow_if_needed(&device, volume_path, &mount.fs_type)
            .await?;
        Ok(NodeExpandVolumeResponse { capacity_bytes })
    }

    async fn get_volume_stats(
        &self,
        volume_id: &VolumeId,
        volume_path: &str,
    ) -> Result<VolumeStats, CsiError> {
        require_id(volume_id)?;
        require_field("volume path", volume_path)?;
        let path = Path::new(volume_path);
        if !self.mounter.path_exists(path).await? {
            return Err(CsiError::VolumeNotFound(volume_id.to_string()));
        }

        if self.mounter.is_block_device(path).await? {
            let size = self.mounter.device_size(path).await?;
            return Ok(VolumeStats {
                usage: vec![VolumeUsage {
                    unit: UsageUnit::Bytes,
                    total: size,
                    used: 0,
                    available: 0,
                }],
            });
        }

        let stats = self.mounter.filesystem_stats(path).await?;
        Ok(VolumeStats {
            usage: vec![
                VolumeUsage {
                    unit: UsageUnit::Bytes,
                    total: stats.total_bytes,
                    used: stats.used_bytes,
                    available: stats.available_bytes,
                },
                VolumeUsage {
                    unit: UsageUnit::Inodes,
                    total: stats.total_inodes,
                    used: stats.used_inodes,
                    available: stats.free_inodes,
                },
            ],
        })
    }

    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError> {
        Ok(vec![
            NodeCapability::StageUnstageVolume,
            NodeCapability::ExpandVolume,
            NodeCapability::GetVolumeStats,
        ])
    }

    async fn get_info(&self) -> Result<NodeInfo, CsiError> {
        let (node_id, accessible_topology) = match &self.cloud {
            Some(cloud) => {
                let instance = self.resolve_instance(cloud.as_ref()).await?;
                let image = cloud.get_image_by_id(&instance.image_id).await?;
                let topology = Topology {
                    segments: [(DISK_TYPE_KEY.to_owned(), image.disk_type)].into(),
                };
                (instance.id, Some(topology))
            }
            None => (self.instance_id.clone(), None),
        };
        Ok(NodeInfo {
            node_id,
            max_volumes: self.max_volumes,
            accessible_topology,
        })
    }
}
