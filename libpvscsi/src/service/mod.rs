//! Controller and node services for PowerVS block volumes.
//!
//! [`ControllerService`] drives the cloud backend, [`NodeService`] drives the
//! host it runs on.  Both take an owned lock registry and reject a second
//! concurrent call on the same volume.

pub mod controller;
pub mod node;

pub use controller::ControllerService;
pub use node::{DeviceScanPolicy, NodeService};

use crate::error::CsiError;
use crate::mounter::SUPPORTED_FS_TYPES;
use crate::types::{AccessMode, AccessType, VolumeCapability, VolumeId};

/// Access modes a single-attach PowerVS disk can satisfy.
const SUPPORTED_ACCESS_MODES: &[AccessMode] =
    &[AccessMode::SingleNodeWriter, AccessMode::SingleNodeReaderOnly];

pub(crate) fn is_supported(cap: &VolumeCapability) -> bool {
    if !SUPPORTED_ACCESS_MODES.contains(&cap.access_mode) {
        return false;
    }
    match &cap.access_type {
        AccessType::Block => true,
        AccessType::Mount { fs_type, .. } => {
            fs_type.is_empty() || SUPPORTED_FS_TYPES.contains(&fs_type.as_str())
        }
    }
}

pub(crate) fn all_supported(caps: &[VolumeCapability]) -> bool {
    !caps.is_empty() && caps.iter().all(is_supported)
}

pub(crate) fn require_id(volume_id: &VolumeId) -> Result<(), CsiError> {
    if volume_id.is_empty() {
        return Err(CsiError::InvalidArgument("volume ID missing".into()));
    }
    Ok(())
}

pub(crate) fn require_field(what: &str, value: &str) -> Result<(), CsiError> {
    if value.is_empty() {
        return Err(CsiError::InvalidArgument(format!("{what} missing")));
    }
    Ok(())
}

/// A present and supported capability.
pub(crate) fn require_capability(
    cap: Option<&VolumeCapability>,
) -> Result<&VolumeCapability, CsiError> {
    let cap = cap.ok_or_else(|| CsiError::InvalidArgument("volume capability missing".into()))?;
    if !is_supported(cap) {
        return Err(CsiError::InvalidArgument(
            "volume capability not supported".into(),
        ));
    }
    Ok(cap)
}
