//! In-memory [`Mounter`] for node service tests.
//!
//! Keeps a fake mount table, a set of existing paths and a set of block
//! devices. Mounting requires the target path to exist, and unmounting
//! something that is not mounted fails with `EINVAL`, like the kernel.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use nix::errno::Errno;

use super::{FsStats, MountError, MountPoint, Mounter, SUPPORTED_FS_TYPES};

#[derive(Default)]
struct State {
    mounts: Vec<MountPoint>,
    paths: HashSet<PathBuf>,
    /// WWN (lowercase) to device path.
    devices: HashMap<String, PathBuf>,
    /// Devices that only show up after a SCSI rescan.
    late_devices: HashMap<String, PathBuf>,
    device_sizes: HashMap<PathBuf, u64>,
    formats: HashMap<PathBuf, String>,
    fs_sizes: HashMap<PathBuf, u64>,
    corrupted: HashSet<PathBuf>,
}

#[derive(Default)]
pub(crate) struct FakeMounter {
    state: Mutex<State>,
    /// Make [`Mounter::mount_refs`] fail.
    pub(crate) fail_refs: AtomicBool,
    pub(crate) format_calls: AtomicUsize,
    pub(crate) resize_calls: AtomicUsize,
    pub(crate) rescan_calls: AtomicUsize,
    pub(crate) force_unmount_calls: AtomicUsize,
}

impl FakeMounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_device(&self, wwn: &str, device: &str, size_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .devices
            .insert(wwn.to_ascii_lowercase(), PathBuf::from(device));
        state.device_sizes.insert(PathBuf::from(device), size_bytes);
        state.paths.insert(PathBuf::from(device));
    }

    /// A device that is only discovered once the SCSI bus is rescanned.
    pub(crate) fn add_late_device(&self, wwn: &str, device: &str, size_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .late_devices
            .insert(wwn.to_ascii_lowercase(), PathBuf::from(device));
        state.device_sizes.insert(PathBuf::from(device), size_bytes);
        state.paths.insert(PathBuf::from(device));
    }

    pub(crate) fn set_device_size(&self, device: &str, size_bytes: u64) {
        self.state
            .lock()
            .unwrap()
            .device_sizes
            .insert(PathBuf::from(device), size_bytes);
    }

    pub(crate) fn set_format(&self, device: &str, fs_type: &str, fs_size: u64) {
        let mut state = self.state.lock().unwrap();
        state
            .formats
            .insert(PathBuf::from(device), fs_type.to_owned());
        state.fs_sizes.insert(PathBuf::from(device), fs_size);
    }

    pub(crate) fn format_of(&self, device: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .formats
            .get(Path::new(device))
            .cloned()
    }

    pub(crate) fn fs_size_of(&self, device: &str) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .fs_sizes
            .get(Path::new(device))
            .copied()
    }

    /// Make `path` look like a mountpoint whose backing store went away.
    pub(crate) fn corrupt(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .corrupted
            .insert(PathBuf::from(path));
    }

    pub(crate) fn mounts(&self) -> Vec<MountPoint> {
        self.state.lock().unwrap().mounts.clone()
    }

    pub(crate) fn exists(&self, path: &str) -> bool {
        self.state.lock().unwrap().paths.contains(Path::new(path))
    }

    /// Record a mount directly, bypassing the target checks.
    pub(crate) fn insert_mount(&self, device: &str, path: &str, fs_type: &str) {
        let mut state = self.state.lock().unwrap();
        state.paths.insert(PathBuf::from(path));
        state.mounts.push(MountPoint {
            device: device.to_owned(),
            path: PathBuf::from(path),
            fs_type: fs_type.to_owned(),
            options: vec!["rw".into()],
            dev_id: device.to_owned(),
            root: "/".into(),
        });
    }
}

fn missing(op: &'static str, path: &Path) -> MountError {
    MountError::errno(op, path, Errno::ENOENT)
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn list_mounts(&self) -> Result<Vec<MountPoint>, MountError> {
        Ok(self.mounts())
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let mut state = self.state.lock().unwrap();
        if !state.paths.contains(target) {
            return Err(missing("mount", target));
        }
        if !state.paths.contains(source) {
            return Err(missing("mount", source));
        }
        let read_only = options.iter().any(|o| o == "ro");
        let mut mount = match state.mounts.iter().rev().find(|m| m.path == source) {
            Some(bound) => MountPoint {
                path: target.to_path_buf(),
                ..bound.clone()
            },
            None => MountPoint {
                device: source.display().to_string(),
                path: target.to_path_buf(),
                fs_type: if fs_type.is_empty() {
                    "devtmpfs".into()
                } else {
                    fs_type.to_owned()
                },
                options: Vec::new(),
                dev_id: source.display().to_string(),
                root: "/".into(),
            },
        };
        mount.options = vec![if read_only { "ro" } else { "rw" }.to_owned()];
        mount
            .options
            .extend(options.iter().filter(|o| *o != "ro" && *o != "rw").cloned());
        state.mounts.push(mount);
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        let mut state = self.state.lock().unwrap();
        match state.mounts.iter().rposition(|m| m.path == target) {
            Some(i) => {
                state.mounts.remove(i);
                Ok(())
            }
            None => Err(MountError::errno("unmount", target, Errno::EINVAL)),
        }
    }

    async fn force_unmount(&self, target: &Path) -> Result<(), MountError> {
        self.force_unmount_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        state.mounts.retain(|m| m.path != target);
        state.corrupted.remove(target);
        Ok(())
    }

    async fn format(&self, device: &Path, fs_type: &str) -> Result<(), MountError> {
        self.format_calls.fetch_add(1, Ordering::SeqCst);
        if !SUPPORTED_FS_TYPES.contains(&fs_type) {
            return Err(MountError::UnsupportedFs(fs_type.to_owned()));
        }
        let mut state = self.state.lock().unwrap();
        let size = *state
            .device_sizes
            .get(device)
            .ok_or_else(|| missing("format", device))?;
        state.formats.insert(device.to_path_buf(), fs_type.to_owned());
        state.fs_sizes.insert(device.to_path_buf(), size);
        Ok(())
    }

    async fn disk_format(&self, device: &Path) -> Result<Option<String>, MountError> {
        Ok(self.state.lock().unwrap().formats.get(device).cloned())
    }

    async fn find_device_by_wwn(&self, wwn: &str) -> Result<Option<PathBuf>, MountError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .devices
            .get(&wwn.to_ascii_lowercase())
            .cloned())
    }

    async fn rescan_scsi_bus(&self) -> Result<(), MountError> {
        self.rescan_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let late: Vec<_> = state.late_devices.drain().collect();
        state.devices.extend(late);
        Ok(())
    }

    async fn device_size(&self, device: &Path) -> Result<u64, MountError> {
        let state = self.state.lock().unwrap();
        // A file bound onto a device reports the device's size.
        let resolved = state
            .mounts
            .iter()
            .rev()
            .find(|m| m.path == device)
            .map(|m| PathBuf::from(&m.device))
            .unwrap_or_else(|| device.to_path_buf());
        state
            .device_sizes
            .get(&resolved)
            .copied()
            .ok_or_else(|| missing("blockdev", device))
    }

    async fn filesystem_size(
        &self,
        device: &Path,
        _mount_path: &Path,
        _fs_type: &str,
    ) -> Result<u64, MountError> {
        self.state
            .lock()
            .unwrap()
            .fs_sizes
            .get(device)
            .copied()
            .ok_or_else(|| missing("dumpe2fs", device))
    }

    async fn resize_filesystem(
        &self,
        device: &Path,
        _mount_path: &Path,
        _fs_type: &str,
    ) -> Result<(), MountError> {
        self.resize_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock().unwrap();
        let size = *state
            .device_sizes
            .get(device)
            .ok_or_else(|| missing("resize2fs", device))?;
        state.fs_sizes.insert(device.to_path_buf(), size);
        Ok(())
    }

    async fn filesystem_stats(&self, path: &Path) -> Result<FsStats, MountError> {
        let state = self.state.lock().unwrap();
        let mount = state
            .mounts
            .iter()
            .rev()
            .find(|m| m.path == path)
            .ok_or_else(|| missing("statvfs", path))?;
        let total = state
            .fs_sizes
            .get(Path::new(&mount.device))
            .copied()
            .unwrap_or_default();
        Ok(FsStats {
            total_bytes: total,
            available_bytes: total / 2,
            used_bytes: total - total / 2,
            total_inodes: 1000,
            free_inodes: 900,
            used_inodes: 100,
        })
    }

    async fn is_block_device(&self, path: &Path) -> Result<bool, MountError> {
        let state = self.state.lock().unwrap();
        if state.device_sizes.contains_key(path) {
            return Ok(true);
        }
        Ok(state
            .mounts
            .iter()
            .rev()
            .find(|m| m.path == path)
            .is_some_and(|m| {
                m.fs_type == "devtmpfs" && state.device_sizes.contains_key(Path::new(&m.device))
            }))
    }

    async fn path_exists(&self, path: &Path) -> Result<bool, MountError> {
        let state = self.state.lock().unwrap();
        if state.corrupted.contains(path) {
            return Err(MountError::errno("stat", path, Errno::ENOTCONN));
        }
        Ok(state.paths.contains(path))
    }

    async fn make_dir(&self, path: &Path) -> Result<(), MountError> {
        self.state.lock().unwrap().paths.insert(path.to_path_buf());
        Ok(())
    }

    async fn make_file(&self, path: &Path) -> Result<(), MountError> {
        self.state.lock().unwrap().paths.insert(path.to_path_buf());
        Ok(())
    }

    async fn remove_path(&self, path: &Path) -> Result<(), MountError> {
        let mut state = self.state.lock().unwrap();
        if state.mounts.iter().any(|m| m.path == path) {
            return Err(MountError::errno("remove", path, Errno::EBUSY));
        }
        state.paths.remove(path);
        Ok(())
    }

    async fn mount_refs(&self, mount: &MountPoint) -> Result<Vec<PathBuf>, MountError> {
        if self.fail_refs.load(Ordering::SeqCst) {
            return Err(MountError::Parse("mount table unavailable".into()));
        }
        Ok(self
            .mounts()
            .into_iter()
            .filter(|m| m.path != mount.path && m.same_source(mount))
            .map(|m| m.path)
            .collect())
    }
}
