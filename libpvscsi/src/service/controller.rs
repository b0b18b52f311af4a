//! [`CsiController`] on top of a [`Cloud`] backend.
//!
//! Every mutating verb takes the per-key lock first (the request name for
//! creation, the volume ID otherwise) and fails fast with `Aborted` when
//! another call holds it.  All state lives in the backend; nothing about a
//! volume is cached here, so a restart loses nothing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::cloud::{Cloud, Disk, DiskOptions, DiskState};
use crate::controller::CsiController;
use crate::driver::{
    DEFAULT_VOLUME_SIZE, DISK_TYPE_KEY, DISK_TYPE_PARAM, FS_TYPE_KEY, WWN_KEY,
};
use crate::error::CsiError;
use crate::locks::VolumeLocks;
use crate::mounter::SUPPORTED_FS_TYPES;
use crate::types::*;
use crate::util::{bytes_to_gib, gib_to_bytes, round_up_bytes};

use super::{all_supported, require_capability, require_field, require_id};

pub struct ControllerService {
    cloud: Arc<dyn Cloud>,
    locks: Arc<VolumeLocks>,
}

impl ControllerService {
    pub fn new(cloud: Arc<dyn Cloud>) -> Self {
        Self::with_locks(cloud, Arc::new(VolumeLocks::new()))
    }

    pub fn with_locks(cloud: Arc<dyn Cloud>, locks: Arc<VolumeLocks>) -> Self {
        Self { cloud, locks }
    }
}

/// Size in bytes to provision, whole GiB.
fn requested_size(range: Option<&CapacityRange>) -> Result<u64, CsiError> {
    let Some(range) = range else {
        return Ok(DEFAULT_VOLUME_SIZE);
    };
    if range.limit_bytes > 0 && range.required_bytes > range.limit_bytes {
        return Err(CsiError::InvalidArgument(format!(
            "required bytes {} exceed limit bytes {}",
            range.required_bytes, range.limit_bytes
        )));
    }
    let size = match range.required_bytes {
        0 => DEFAULT_VOLUME_SIZE,
        bytes => round_up_bytes(bytes),
    };
    if range.limit_bytes > 0 && size > range.limit_bytes {
        return Err(CsiError::OutOfRange(format!(
            "rounded size {size} exceeds limit bytes {}",
            range.limit_bytes
        )));
    }
    Ok(size)
}

struct CreateParams {
    disk_type: Option<String>,
    fs_type: Option<String>,
}

fn parse_parameters(parameters: &HashMap<String, String>) -> Result<CreateParams, CsiError> {
    let mut params = CreateParams {
        disk_type: None,
        fs_type: None,
    };
    for (key, value) in parameters {
        match key.as_str() {
            DISK_TYPE_PARAM => params.disk_type = Some(value.clone()),
            FS_TYPE_KEY => {
                if !SUPPORTED_FS_TYPES.contains(&value.as_str()) {
                    return Err(CsiError::InvalidArgument(format!(
                        "unsupported filesystem type {value:?}"
                    )));
                }
                params.fs_type = Some(value.clone());
            }
            other => {
                return Err(CsiError::InvalidArgument(format!(
                    "invalid parameter key {other:?}"
                )));
            }
        }
    }
    Ok(params)
}

/// Disk type named by the preferred, then the requisite topology.
fn topology_disk_type(req: Option<&TopologyRequirement>) -> Option<String> {
    let req = req?;
    req.preferred
        .iter()
        .chain(&req.requisite)
        .find_map(|t| t.segments.get(DISK_TYPE_KEY).cloned())
}

fn volume_from_disk(disk: &Disk, fs_type: Option<&str>) -> Volume {
    let mut volume_context = HashMap::new();
    if let Some(fs_type) = fs_type {
        volume_context.insert(FS_TYPE_KEY.to_owned(), fs_type.to_owned());
    }
    let accessible_topology = if disk.disk_type.is_empty() {
        Vec::new()
    } else {
        vec![Topology {
            segments: HashMap::from([(DISK_TYPE_KEY.to_owned(), disk.disk_type.clone())]),
        }]
    };
    Volume {
        volume_id: VolumeId(disk.volume_id.clone()),
        capacity_bytes: gib_to_bytes(disk.capacity_gib),
        volume_context,
        accessible_topology,
    }
}

#[async_trait]
impl CsiController for ControllerService {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::InvalidArgument("volume name missing".into()));
        }
        if req.volume_capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities missing".into(),
            ));
        }
        if !all_supported(&req.volume_capabilities) {
            return Err(CsiError::InvalidArgument(
                "volume capabilities not supported".into(),
            ));
        }
        let size = requested_size(req.capacity_range.as_ref())?;
        let params = parse_parameters(&req.parameters)?;
        let disk_type = params
            .disk_type
            .or_else(|| topology_disk_type(req.accessibility_requirements.as_ref()));

        let _guard = self.locks.lock(&req.name)?;

        match self.cloud.get_disk_by_name(&req.name).await {
            Ok(disk) => {
                if disk.capacity_gib != bytes_to_gib(size) {
                    return Err(CsiError::AlreadyExists(format!(
                        "volume {} exists with {} GiB, {} GiB requested",
                        req.name,
                        disk.capacity_gib,
                        bytes_to_gib(size)
                    )));
                }
                if disk.state == DiskState::Creating {
                    self.cloud
                        .wait_for_volume_state(&disk.volume_id, DiskState::Available)
                        .await?;
                }
                debug!(volume_id = %disk.volume_id, "returning existing volume for idempotent create");
                return Ok(volume_from_disk(&disk, params.fs_type.as_deref()));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }

        let options = DiskOptions {
            capacity_bytes: size,
            disk_type,
            shareable: false,
        };
        let disk = self.cloud.create_disk(&req.name, &options).await?;
        self.cloud
            .wait_for_volume_state(&disk.volume_id, DiskState::Available)
            .await?;
        // The create response may predate the tier and WWN assignment.
        let disk = self.cloud.get_disk_by_id(&disk.volume_id).await?;

        info!(volume_id = %disk.volume_id, size_gib = disk.capacity_gib, disk_type = %disk.disk_type, "volume created");
        Ok(volume_from_disk(&disk, params.fs_type.as_deref()))
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        require_id(volume_id)?;
        let _guard = self.locks.lock(volume_id.as_str())?;

        match self.cloud.delete_disk(volume_id.as_str()).await {
            Ok(()) => {
                info!(%volume_id, "volume deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(%volume_id, "volume already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn publish_volume(
        &self,
        req: ControllerPublishVolumeRequest,
    ) -> Result<HashMap<String, String>, CsiError> {
        require_id(&req.volume_id)?;
        require_field("node ID", &req.node_id)?;
        require_capability(req.volume_capability.as_ref())?;

        let volume_id = req.volume_id.as_str();
        let node_id = req.node_id.as_str();
        let _guard = self.locks.lock(volume_id)?;

        if !self.cloud.instance_exists(node_id).await? {
            return Err(CsiError::InstanceNotFound(node_id.to_owned()));
        }
        let mut disk = self.cloud.get_disk_by_id(volume_id).await?;

        if disk.attached_instances.iter().any(|i| i == node_id) {
            debug!("volume already attached to node");
        } else {
            if let Some(other) = disk.attached_instances.first() {
                return Err(CsiError::FailedPrecondition(format!(
                    "volume {volume_id} is attached to another node {other}"
                )));
            }
            self.cloud.attach_disk(volume_id, node_id).await?;
            self.cloud
                .wait_for_attachment(volume_id, node_id, true)
                .await?;
            self.cloud
                .wait_for_volume_state(volume_id, DiskState::InUse)
                .await?;
            info!("volume attached");
            if disk.wwn.is_empty() {
                disk = self.cloud.get_disk_by_id(volume_id).await?;
            }
        }

        Ok(HashMap::from([(WWN_KEY.to_owned(), disk.wwn)]))
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id, node_id = %req.node_id))]
    async fn unpublish_volume(
        &self,
        req: ControllerUnpublishVolumeRequest,
    ) -> Result<(), CsiError> {
        require_id(&req.volume_id)?;
        require_field("node ID", &req.node_id)?;
        let volume_id = req.volume_id.as_str();
        let node_id = req.node_id.as_str();
        let _guard = self.locks.lock(volume_id)?;

        match self.cloud.is_attached(volume_id, node_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!("volume not attached to node");
                return Ok(());
            }
            Err(e) if e.is_not_found() => {
                debug!(error = %e, "nothing to detach");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        match self.cloud.detach_disk(volume_id, node_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        self.cloud
            .wait_for_attachment(volume_id, node_id, false)
            .await?;
        info!("volume detached");
        Ok(())
    }

    #[instrument(skip(self, req), fields(volume_id = %req.volume_id))]
    async fn expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, CsiError> {
        require_id(&req.volume_id)?;
        let range = req
            .capacity_range
            .as_ref()
            .filter(|r| r.required_bytes > 0)
            .ok_or_else(|| CsiError::InvalidArgument("capacity range missing".into()))?;
        let size = requested_size(Some(range))?;
        let node_expansion_required = !req
            .volume_capability
            .as_ref()
            .is_some_and(VolumeCapability::is_block);

        let volume_id = req.volume_id.as_str();
        let _guard = self.locks.lock(volume_id)?;

        let disk = self.cloud.get_disk_by_id(volume_id).await?;
        let new_gib = bytes_to_gib(size);
        if new_gib <= disk.capacity_gib {
            debug!(current_gib = disk.capacity_gib, requested_gib = new_gib, "volume already large enough");
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: gib_to_bytes(disk.capacity_gib),
                node_expansion_required,
            });
        }

        let gib = self.cloud.resize_disk(volume_id, size).await?;
        self.cloud.wait_for_capacity(volume_id, gib).await?;
        info!(from_gib = disk.capacity_gib, to_gib = gib, "volume expanded");
        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: gib_to_bytes(gib),
            node_expansion_required,
        })
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<ValidateVolumeCapabilitiesResponse, CsiError> {
        require_id(volume_id)?;
        if capabilities.is_empty() {
            return Err(CsiError::InvalidArgument(
                "volume capabilities missing".into(),
            ));
        }
        self.cloud.get_disk_by_id(volume_id.as_str()).await?;

        Ok(if all_supported(capabilities) {
            ValidateVolumeCapabilitiesResponse {
                confirmed: Some(capabilities.to_vec()),
                message: String::new(),
            }
        } else {
            ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: "only single-node access modes are supported".into(),
            }
        })
    }

    async fn list_volumes(&self, req: ListVolumesRequest) -> Result<ListVolumesResponse, CsiError> {
        let mut disks = self.cloud.list_disks().await?;
        disks.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));

        let start = match req.starting_token.as_deref() {
            None | Some("") => 0,
            Some(token) => token
                .parse::<usize>()
                .ok()
                .filter(|i| *i <= disks.len())
                .ok_or_else(|| CsiError::Aborted(format!("invalid starting token {token:?}")))?,
        };
        let end = match req.max_entries {
            0 => disks.len(),
            n => start.saturating_add(n).min(disks.len()),
        };

        Ok(ListVolumesResponse {
            entries: disks[start..end]
                .iter()
                .map(|d| volume_from_disk(d, None))
                .collect(),
            next_token: (end < disks.len()).then(|| end.to_string()),
        })
    }

    async fn get_capacity(&self, req: GetCapacityRequest) -> Result<u64, CsiError> {
        let disk_type = req.parameters.get(DISK_TYPE_PARAM).cloned().or_else(|| {
            req.accessible_topology
                .as_ref()
                .and_then(|t| t.segments.get(DISK_TYPE_KEY).cloned())
        });
        let gib = self
            .cloud
            .available_capacity_gib(disk_type.as_deref())
            .await?;
        Ok(gib_to_bytes(gib))
    }

    async fn get_capabilities(&self) -> Result<Vec<ControllerCapability>, CsiError> {
        Ok(vec![
            ControllerCapability::CreateDeleteVolume,
            ControllerCapability::PublishUnpublishVolume,
            ControllerCapability::ExpandVolume,
            ControllerCapability::ListVolumes,
            ControllerCapability::GetCapacity,
        ])
    }
}
