//! Cloud provider abstraction.
//!
//! [`Cloud`] is the capability set the controller and node services need
//! from the remote disk service.  [`powervs::PowerVsCloud`] implements it
//! against the IBM Power Virtual Server API; tests use an in-memory fake.
//!
//! The backend is eventually consistent: mutating calls return before the
//! disk reaches its new state.  The `wait_for_*` methods hide that behind
//! [`poll::poll_until`] and are shared by every implementation.

pub mod poll;
pub mod powervs;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use poll::{PollPolicy, RetryPolicy};

/// Failure modes of the remote disk service.
#[derive(Debug, Error)]
pub enum CloudError {
    #[error("{resource} {id} not found")]
    NotFound { resource: &'static str, id: String },

    #[error("{resource} {id} already exists")]
    AlreadyExists { resource: &'static str, id: String },

    /// Quota or capacity limits rejected the request.
    #[error("request exceeds backend capacity limits: {0}")]
    ExceedsLimits(String),

    #[error("timed out after {elapsed:?} waiting for {what}")]
    Timeout { what: String, elapsed: Duration },

    /// Throttling, 5xx or connection failures.  Retried with backoff.
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("backend request failed: {0}")]
    Http(String),

    #[error("backend returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed backend response: {0}")]
    Decode(String),
}

impl CloudError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Lifecycle state of a disk as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskState {
    Creating,
    Available,
    InUse,
    Resizing,
    Error,
    Other(String),
}

impl DiskState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::InUse => "in-use",
            Self::Resizing => "resizing",
            Self::Error => "error",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for DiskState {
    fn from(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "creating" => Self::Creating,
            "available" => Self::Available,
            "in-use" => Self::InUse,
            "resizing" => Self::Resizing,
            "error" => Self::Error,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for DiskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A backend disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disk {
    pub volume_id: String,
    pub name: String,
    /// Always whole GiB.
    pub capacity_gib: u64,
    /// World-wide name used by the node to find the attached device.
    pub wwn: String,
    /// Storage tier, e.g. `tier1` or `tier3`.
    pub disk_type: String,
    pub state: DiskState,
    pub shareable: bool,
    /// IDs of the instances the disk is attached to.
    pub attached_instances: Vec<String>,
}

/// Parameters for a new disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskOptions {
    /// Requested size; rounded up to whole GiB before it reaches the backend.
    pub capacity_bytes: u64,
    /// Storage tier; `None` lets the backend pick its default.
    pub disk_type: Option<String>,
    pub shareable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvmInstance {
    pub id: String,
    pub name: String,
    pub image_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvmImage {
    pub id: String,
    pub name: String,
    /// Storage tier of the boot image; the default tier for volumes on
    /// instances created from it.
    pub disk_type: String,
}

/// Capability set of the remote disk service.
#[async_trait]
pub trait Cloud: Send + Sync {
    async fn create_disk(&self, name: &str, options: &DiskOptions) -> Result<Disk, CloudError>;

    async fn delete_disk(&self, volume_id: &str) -> Result<(), CloudError>;

    /// Issue an attach.  Returns before the attachment is visible.
    async fn attach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError>;

    /// Issue a detach.  Returns before the detachment is visible.
    async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<(), CloudError>;

    /// Request a new size.  Returns the size in GiB the disk will have,
    /// which is the current size if it is already at least as large.
    async fn resize_disk(&self, volume_id: &str, new_size_bytes: u64) -> Result<u64, CloudError>;

    async fn get_disk_by_id(&self, volume_id: &str) -> Result<Disk, CloudError>;

    async fn get_disk_by_name(&self, name: &str) -> Result<Disk, CloudError>;

    async fn list_disks(&self) -> Result<Vec<Disk>, CloudError>;

    async fn get_pvm_instance_by_id(&self, instance_id: &str) -> Result<PvmInstance, CloudError>;

    async fn get_pvm_instance_by_name(&self, name: &str) -> Result<PvmInstance, CloudError>;

    async fn get_image_by_id(&self, image_id: &str) -> Result<PvmImage, CloudError>;

    /// Largest disk, in GiB, that can currently be allocated for the tier.
    async fn available_capacity_gib(&self, disk_type: Option<&str>) -> Result<u64, CloudError>;

    fn poll_policy(&self) -> PollPolicy {
        PollPolicy::default()
    }

    async fn instance_exists(&self, instance_id: &str) -> Result<bool, CloudError> {
        match self.get_pvm_instance_by_id(instance_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_attached(&self, volume_id: &str, instance_id: &str) -> Result<bool, CloudError> {
        let disk = self.get_disk_by_id(volume_id).await?;
        Ok(disk.attached_instances.iter().any(|id| id == instance_id))
    }

    async fn wait_for_volume_state(
        &self,
        volume_id: &str,
        expected: DiskState,
    ) -> Result<(), CloudError> {
        let what = format!("volume {volume_id} to be {expected}");
        let expected = &expected;
        poll::poll_until(&what, self.poll_policy(), || async move {
            let disk = self.get_disk_by_id(volume_id).await?;
            if disk.state == DiskState::Error {
                return Err(CloudError::Api {
                    status: 0,
                    message: format!("volume {volume_id} entered error state"),
                });
            }
            Ok(disk.state == *expected)
        })
        .await
    }

    async fn wait_for_attachment(
        &self,
        volume_id: &str,
        instance_id: &str,
        attached: bool,
    ) -> Result<(), CloudError> {
        let what = if attached {
            format!("volume {volume_id} to attach to {instance_id}")
        } else {
            format!("volume {volume_id} to detach from {instance_id}")
        };
        poll::poll_until(&what, self.poll_policy(), || async move {
            Ok(self.is_attached(volume_id, instance_id).await? == attached)
        })
        .await
    }

    async fn wait_for_capacity(&self, volume_id: &str, capacity_gib: u64) -> Result<(), CloudError> {
        let what = format!("volume {volume_id} to reach {capacity_gib} GiB");
        poll::poll_until(&what, self.poll_policy(), || async move {
            Ok(self.get_disk_by_id(volume_id).await?.capacity_gib >= capacity_gib)
        })
        .await
    }
}
