//! OS-facing storage operations used by the node service.
//!
//! [`Mounter`] covers everything the node service does to the host: device
//! discovery by WWN, filesystem probing, formatting and growing, mounting and
//! unmounting, and the handful of path operations around them.
//! [`linux::LinuxMounter`] is the production implementation.

pub mod linux;

#[cfg(test)]
pub(crate) mod fake;

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::errno::Errno;
use thiserror::Error;

pub use linux::LinuxMounter;

/// Filesystem types the node knows how to create and grow.
pub const SUPPORTED_FS_TYPES: &[&str] = &["ext2", "ext3", "ext4", "xfs"];

#[derive(Debug, Error)]
pub enum MountError {
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("`{cmd}` failed ({status}): {stderr}")]
    CommandFailed {
        cmd: String,
        status: String,
        stderr: String,
    },

    #[error("unsupported filesystem type {0:?}")]
    UnsupportedFs(String),

    #[error("cannot parse {0}")]
    Parse(String),
}

impl MountError {
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn errno(op: &'static str, path: impl Into<PathBuf>, errno: Errno) -> Self {
        Self::io(op, path, io::Error::from_raw_os_error(errno as i32))
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Whether `err` says the mountpoint exists but its backing filesystem is
/// gone or unreachable. Such a path must be force-unmounted before reuse.
pub fn is_corrupted_mount(err: &MountError) -> bool {
    const CORRUPTED: [Errno; 6] = [
        Errno::ENOTCONN,
        Errno::ESTALE,
        Errno::EIO,
        Errno::EACCES,
        Errno::EHOSTDOWN,
        Errno::ECONNREFUSED,
    ];
    err.raw_os_error()
        .is_some_and(|code| CORRUPTED.iter().any(|e| *e as i32 == code))
}

/// One row of the mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    /// Mount source, e.g. `/dev/sdb`.
    pub device: String,
    pub path: PathBuf,
    pub fs_type: String,
    pub options: Vec<String>,
    /// `major:minor` of the mounted filesystem.
    pub dev_id: String,
    /// Path inside the filesystem that is mounted here; `/` unless bound.
    pub root: String,
}

impl MountPoint {
    /// Whether both rows expose the same filesystem subtree.
    pub fn same_source(&self, other: &MountPoint) -> bool {
        self.dev_id == other.dev_id && self.root == other.root
    }

    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Usage numbers of a mounted filesystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsStats {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub used_inodes: u64,
}

#[async_trait]
pub trait Mounter: Send + Sync {
    /// Current mount table, read fresh on every call.
    async fn list_mounts(&self) -> Result<Vec<MountPoint>, MountError>;

    /// Mount `source` on `target`. An empty `fs_type` together with a
    /// `bind` option makes a bind mount; `ro` is honored for both.
    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError>;

    async fn unmount(&self, target: &Path) -> Result<(), MountError>;

    /// Lazy, forced unmount for targets whose backing store is unreachable.
    async fn force_unmount(&self, target: &Path) -> Result<(), MountError>;

    async fn format(&self, device: &Path, fs_type: &str) -> Result<(), MountError>;

    /// Filesystem type found on `device`, `None` for a blank disk.
    async fn disk_format(&self, device: &Path) -> Result<Option<String>, MountError>;

    async fn find_device_by_wwn(&self, wwn: &str) -> Result<Option<PathBuf>, MountError>;

    /// Ask every SCSI host to look for new LUNs.
    async fn rescan_scsi_bus(&self) -> Result<(), MountError>;

    async fn device_size(&self, device: &Path) -> Result<u64, MountError>;

    /// Size of the filesystem on `device`, which is mounted at `mount_path`.
    async fn filesystem_size(
        &self,
        device: &Path,
        mount_path: &Path,
        fs_type: &str,
    ) -> Result<u64, MountError>;

    /// Grow the filesystem to fill its device.
    async fn resize_filesystem(
        &self,
        device: &Path,
        mount_path: &Path,
        fs_type: &str,
    ) -> Result<(), MountError>;

    async fn filesystem_stats(&self, path: &Path) -> Result<FsStats, MountError>;

    /// Whether `path` is a block device node, or a file bound onto one.
    async fn is_block_device(&self, path: &Path) -> Result<bool, MountError>;

    /// `Ok(false)` when the path does not exist. Any other stat failure,
    /// including a corrupted mountpoint, is an error.
    async fn path_exists(&self, path: &Path) -> Result<bool, MountError>;

    async fn make_dir(&self, path: &Path) -> Result<(), MountError>;

    /// Create an empty regular file, and its parent directories.
    async fn make_file(&self, path: &Path) -> Result<(), MountError>;

    /// Remove a file or empty directory. Missing paths are not an error.
    async fn remove_path(&self, path: &Path) -> Result<(), MountError>;

    /// The mount covering exactly `path`. With stacked mounts the topmost wins.
    async fn mount_at(&self, path: &Path) -> Result<Option<MountPoint>, MountError> {
        Ok(self
            .list_mounts()
            .await?
            .into_iter()
            .rev()
            .find(|m| m.path == path))
    }

    /// Whether two device paths name the same device.
    async fn same_device(&self, a: &Path, b: &Path) -> Result<bool, MountError> {
        Ok(a == b)
    }

    async fn is_mount_point(&self, path: &Path) -> Result<bool, MountError> {
        Ok(self.mount_at(path).await?.is_some())
    }

    /// Other mountpoints exposing the same filesystem subtree as `mount`.
    async fn mount_refs(&self, mount: &MountPoint) -> Result<Vec<PathBuf>, MountError> {
        Ok(self
            .list_mounts()
            .await?
            .into_iter()
            .filter(|m| m.path != mount.path && m.same_source(mount))
            .map(|m| m.path)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupted_errnos_are_detected() {
        for errno in [Errno::ENOTCONN, Errno::ESTALE, Errno::EIO, Errno::EACCES] {
            assert!(is_corrupted_mount(&MountError::errno("stat", "/mnt/x", errno)));
        }
        assert!(!is_corrupted_mount(&MountError::errno(
            "stat",
            "/mnt/x",
            Errno::ENOENT
        )));
        assert!(!is_corrupted_mount(&MountError::Parse("x".into())));
    }

    #[test]
    fn bind_mounts_share_their_source() {
        let staged = MountPoint {
            device: "/dev/sdb".into(),
            path: "/staging/v1".into(),
            fs_type: "ext4".into(),
            options: vec!["rw".into()],
            dev_id: "8:16".into(),
            root: "/".into(),
        };
        let published = MountPoint {
            path: "/pods/p1".into(),
            options: vec!["ro".into()],
            ..staged.clone()
        };
        assert!(staged.same_source(&published));
        assert!(published.is_read_only());
        assert!(!staged.is_read_only());
    }
}
