//! CSI error types.
//!
//! Every failure that leaves the lifecycle engine is a [`CsiError`].  Each
//! variant maps onto exactly one status [`Code`], which is what the calling
//! orchestrator's retry policy keys on, so backend-specific conditions are
//! classified here rather than at the transport.  The enum stays
//! [`Serialize`]/[`Deserialize`] so errors can travel over the socket
//! transport unchanged.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud::CloudError;
use crate::mounter::MountError;

/// Status code attached to every [`CsiError`], mirroring the standard CSI
/// status codes a client retries on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Code {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    OutOfRange,
    Aborted,
    Unavailable,
    DeadlineExceeded,
    Unimplemented,
    Internal,
}

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A requested size falls outside what the request's own limits allow.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// The requested volume was not found.
    #[error("volume {0} not found")]
    VolumeNotFound(String),

    /// The target compute instance was not found.
    #[error("instance {0} not found")]
    InstanceNotFound(String),

    /// The boot image of this node's instance was not found.
    #[error("image {0} not found")]
    ImageNotFound(String),

    /// A resource exists with parameters incompatible with the request.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The volume is in a state that forbids the operation, e.g. attached to
    /// another node or still referenced by a workload mount.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Another lifecycle operation holds the lock for this key.
    #[error("an operation with the given volume {0} already exists")]
    OperationInProgress(String),

    /// The request cannot proceed as sent, e.g. a stale pagination token.
    #[error("aborted: {0}")]
    Aborted(String),

    /// The attached device never showed up on this node.
    #[error("device with WWN {0} not found")]
    DeviceNotFound(String),

    /// Backend or local state did not converge in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The backend kept failing transiently after retries.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The storage backend returned a final error.
    #[error("backend error: {0}")]
    BackendError(String),

    /// A mount operation failed.
    #[error("mount failed at {path}: {reason}")]
    MountFailed {
        /// Filesystem path where the mount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// An unmount operation failed.
    #[error("unmount failed at {path}: {reason}")]
    UnmountFailed {
        /// Filesystem path where the unmount was attempted.
        path: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// Creating a filesystem on a device failed.
    #[error("format of {device} failed: {reason}")]
    FormatFailed { device: String, reason: String },

    /// Growing a filesystem failed.
    #[error("resize of {path} failed: {reason}")]
    ResizeFailed { path: String, reason: String },

    /// The verb belongs to a service this driver instance does not serve.
    #[error("{0} is not served in this driver mode")]
    Unimplemented(String),

    /// A socket / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::BackendError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::BackendError(e.to_string())
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// The status code a client sees for this error.
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::OutOfRange(_) => Code::OutOfRange,
            Self::VolumeNotFound(_) | Self::InstanceNotFound(_) | Self::ImageNotFound(_) => {
                Code::NotFound
            }
            Self::AlreadyExists(_) => Code::AlreadyExists,
            Self::FailedPrecondition(_) => Code::FailedPrecondition,
            Self::OperationInProgress(_) | Self::Aborted(_) => Code::Aborted,
            Self::DeviceNotFound(_) | Self::Unavailable(_) | Self::TransportError(_) => {
                Code::Unavailable
            }
            Self::Timeout(_) => Code::DeadlineExceeded,
            Self::Unimplemented(_) => Code::Unimplemented,
            Self::BackendError(_)
            | Self::MountFailed { .. }
            | Self::UnmountFailed { .. }
            | Self::FormatFailed { .. }
            | Self::ResizeFailed { .. }
            | Self::Internal(_) => Code::Internal,
        }
    }

    /// Whether the caller may retry the identical request later and expect a
    /// different outcome without changing anything first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.code(),
            Code::Aborted | Code::Unavailable | Code::DeadlineExceeded
        )
    }
}

impl From<CloudError> for CsiError {
    fn from(e: CloudError) -> Self {
        match e {
            CloudError::NotFound { resource, id } if resource == "volume" => {
                Self::VolumeNotFound(id)
            }
            CloudError::NotFound { resource, id } if resource == "instance" => {
                Self::InstanceNotFound(id)
            }
            CloudError::NotFound { resource, id } if resource == "image" => {
                Self::ImageNotFound(id)
            }
            e @ CloudError::AlreadyExists { .. } => Self::AlreadyExists(e.to_string()),
            e @ CloudError::ExceedsLimits(_) => Self::OutOfRange(e.to_string()),
            e @ CloudError::Timeout { .. } => Self::Timeout(e.to_string()),
            e @ (CloudError::Transient(_) | CloudError::Http(_)) => {
                Self::Unavailable(e.to_string())
            }
            e => Self::BackendError(e.to_string()),
        }
    }
}

impl From<MountError> for CsiError {
    fn from(e: MountError) -> Self {
        Self::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn error_display() {
        let err = CsiError::VolumeNotFound("vol-123".into());
        assert_eq!(err.to_string(), "volume vol-123 not found");
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::MountFailed {
            path: "/mnt/test".into(),
            reason: "permission denied".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
        assert_eq!(de.code(), Code::Internal);
    }

    #[test]
    fn busy_and_timeouts_are_retryable() {
        assert!(CsiError::OperationInProgress("v".into()).is_retryable());
        assert!(CsiError::Timeout("attach".into()).is_retryable());
        assert!(CsiError::DeviceNotFound("6005".into()).is_retryable());
        assert!(!CsiError::AlreadyExists("v".into()).is_retryable());
        assert!(!CsiError::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn cloud_errors_are_classified() {
        let not_found: CsiError = CloudError::NotFound {
            resource: "volume",
            id: "vol-1".into(),
        }
        .into();
        assert_eq!(not_found.code(), Code::NotFound);

        let missing_instance: CsiError = CloudError::NotFound {
            resource: "instance",
            id: "pvm-1".into(),
        }
        .into();
        assert!(matches!(missing_instance, CsiError::InstanceNotFound(_)));

        let missing_image: CsiError = CloudError::NotFound {
            resource: "image",
            id: "img-1".into(),
        }
        .into();
        assert!(matches!(missing_image, CsiError::ImageNotFound(_)));
        assert_eq!(missing_image.code(), Code::NotFound);

        let quota: CsiError = CloudError::ExceedsLimits("quota".into()).into();
        assert_eq!(quota.code(), Code::OutOfRange);

        let timeout: CsiError = CloudError::Timeout {
            what: "volume vol-1 to be in-use".into(),
            elapsed: Duration::from_secs(1),
        }
        .into();
        assert_eq!(timeout.code(), Code::DeadlineExceeded);

        let flaky: CsiError = CloudError::Transient("503".into()).into();
        assert!(flaky.is_retryable());

        let api: CsiError = CloudError::Api {
            status: 400,
            message: "bad".into(),
        }
        .into();
        assert_eq!(api.code(), Code::Internal);
    }
}
