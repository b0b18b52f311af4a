//! [`Mounter`] for Linux hosts.
//!
//! Mount and unmount go straight to the syscalls through `nix`; probing,
//! formatting and growing filesystems shell out to the usual util-linux,
//! e2fsprogs and xfsprogs tools.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use nix::mount::{MntFlags, MsFlags};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{FsStats, MountError, MountPoint, Mounter};

const MOUNT_TABLE: &str = "/proc/self/mountinfo";
const DISK_BY_ID: &str = "/dev/disk/by-id";
const SCSI_HOSTS: &str = "/sys/class/scsi_host";

#[derive(Debug, Clone)]
pub struct LinuxMounter {
    mount_table: PathBuf,
    by_id_dir: PathBuf,
    scsi_host_dir: PathBuf,
}

impl Default for LinuxMounter {
    fn default() -> Self {
        Self {
            mount_table: PathBuf::from(MOUNT_TABLE),
            by_id_dir: PathBuf::from(DISK_BY_ID),
            scsi_host_dir: PathBuf::from(SCSI_HOSTS),
        }
    }
}

impl LinuxMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use alternative locations for the mount table, the by-id symlink
    /// directory and the SCSI host class directory.
    pub fn with_paths(
        mount_table: impl Into<PathBuf>,
        by_id_dir: impl Into<PathBuf>,
        scsi_host_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mount_table: mount_table.into(),
            by_id_dir: by_id_dir.into(),
            scsi_host_dir: scsi_host_dir.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Mount table
// ---------------------------------------------------------------------------

/// Undo the octal escaping (`\040` for space etc.) the kernel applies to
/// paths in the mount table.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b))
        {
            let value = (bytes[i + 1] - b'0') as u32 * 64
                + (bytes[i + 2] - b'0') as u32 * 8
                + (bytes[i + 3] - b'0') as u32;
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parse `/proc/self/mountinfo`.
///
/// ```text
/// 36 35 98:0 /mnt1 /mnt/parent rw,noatime master:1 - ext3 /dev/root rw,errors=continue
/// ```
fn parse_mountinfo(contents: &str) -> Result<Vec<MountPoint>, MountError> {
    let mut mounts = Vec::new();
    for line in contents.lines().filter(|l| !l.trim().is_empty()) {
        let fields: Vec<&str> = line.split(' ').collect();
        let sep = fields
            .iter()
            .position(|f| *f == "-")
            .ok_or_else(|| MountError::Parse(format!("mountinfo line {line:?}")))?;
        if sep < 6 || fields.len() < sep + 3 {
            return Err(MountError::Parse(format!("mountinfo line {line:?}")));
        }
        mounts.push(MountPoint {
            device: unescape(fields[sep + 2]),
            path: PathBuf::from(unescape(fields[4])),
            fs_type: fields[sep + 1].to_owned(),
            options: fields[5].split(',').map(str::to_owned).collect(),
            dev_id: fields[2].to_owned(),
            root: unescape(fields[3]),
        });
    }
    Ok(mounts)
}

/// Split mount options into kernel flags and filesystem-specific data.
fn mount_flags(options: &[String]) -> (MsFlags, String) {
    let mut flags = MsFlags::empty();
    let mut data = Vec::new();
    for option in options {
        match option.as_str() {
            "bind" => flags |= MsFlags::MS_BIND,
            "rbind" => flags |= MsFlags::MS_BIND | MsFlags::MS_REC,
            "ro" => flags |= MsFlags::MS_RDONLY,
            "rw" | "defaults" => {}
            "nosuid" => flags |= MsFlags::MS_NOSUID,
            "nodev" => flags |= MsFlags::MS_NODEV,
            "noexec" => flags |= MsFlags::MS_NOEXEC,
            "noatime" => flags |= MsFlags::MS_NOATIME,
            "nodiratime" => flags |= MsFlags::MS_NODIRATIME,
            "relatime" => flags |= MsFlags::MS_RELATIME,
            "sync" => flags |= MsFlags::MS_SYNCHRONOUS,
            "dirsync" => flags |= MsFlags::MS_DIRSYNC,
            other => data.push(other),
        }
    }
    (flags, data.join(","))
}

// ---------------------------------------------------------------------------
// External commands
// ---------------------------------------------------------------------------

fn describe(cmd: &Command) -> String {
    let cmd = cmd.as_std();
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn command_failed(cmd: &Command, output: &Output) -> MountError {
    MountError::CommandFailed {
        cmd: describe(cmd),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
    }
}

/// Run `cmd` to completion. Only a failure to start it is an error.
async fn run(cmd: &mut Command) -> Result<Output, MountError> {
    cmd.output().await.map_err(|e| MountError::CommandFailed {
        cmd: describe(cmd),
        status: "not started".to_owned(),
        stderr: e.to_string(),
    })
}

/// Run `cmd` and require a zero exit status.
async fn execute_cmd(cmd: &mut Command) -> Result<Output, MountError> {
    let output = run(cmd).await?;
    if output.status.success() {
        Ok(output)
    } else {
        Err(command_failed(cmd, &output))
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// `blkid -o export` output to a filesystem type. A partition table without
/// a filesystem still counts as formatted so it is never overwritten.
fn parse_blkid(output: &str) -> Option<String> {
    let mut fs_type = None;
    let mut pt_type = None;
    for line in output.lines() {
        if let Some(v) = line.strip_prefix("TYPE=") {
            fs_type = Some(v.trim().to_owned());
        } else if let Some(v) = line.strip_prefix("PTTYPE=") {
            pt_type = Some(v.trim().to_owned());
        }
    }
    fs_type
        .filter(|t| !t.is_empty())
        .or_else(|| pt_type.map(|p| format!("{p}-partitioned")))
}

fn field_u64(output: &str, key: &str, separator: char) -> Option<u64> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(separator)?;
        (k.trim() == key).then(|| v.trim().parse().ok()).flatten()
    })
}

/// Filesystem size from `dumpe2fs -h`.
fn parse_dumpe2fs(output: &str) -> Result<u64, MountError> {
    let count = field_u64(output, "Block count", ':');
    let size = field_u64(output, "Block size", ':');
    match (count, size) {
        (Some(c), Some(s)) => Ok(c * s),
        _ => Err(MountError::Parse("dumpe2fs output".into())),
    }
}

/// Filesystem size from `xfs_io -c statfs`.
fn parse_xfs_statfs(output: &str) -> Result<u64, MountError> {
    let blocks = field_u64(output, "geom.datablocks", '=');
    let size = field_u64(output, "geom.bsize", '=');
    match (blocks, size) {
        (Some(b), Some(s)) => Ok(b * s),
        _ => Err(MountError::Parse("xfs_io statfs output".into())),
    }
}

fn is_ext(fs_type: &str) -> bool {
    matches!(fs_type, "ext2" | "ext3" | "ext4")
}

#[async_trait]
impl Mounter for LinuxMounter {
    async fn list_mounts(&self) -> Result<Vec<MountPoint>, MountError> {
        let contents = tokio::fs::read_to_string(&self.mount_table)
            .await
            .map_err(|e| MountError::io("read", &self.mount_table, e))?;
        parse_mountinfo(&contents)
    }

    async fn mount(
        &self,
        source: &Path,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> Result<(), MountError> {
        let (flags, data) = mount_flags(options);
        let fs_type = (!fs_type.is_empty()).then_some(fs_type);
        let data = (!data.is_empty()).then_some(data.as_str());
        debug!(source = %source.display(), target = %target.display(), ?fs_type, ?flags, "mount");

        nix::mount::mount(Some(source), target, fs_type, flags, data)
            .map_err(|e| MountError::errno("mount", target, e))?;

        // MS_RDONLY is ignored on the initial bind; it needs a remount.
        if flags.contains(MsFlags::MS_BIND) && flags.contains(MsFlags::MS_RDONLY) {
            nix::mount::mount(
                None::<&Path>,
                target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )
            .map_err(|e| MountError::errno("remount read-only", target, e))?;
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), MountError> {
        nix::mount::umount(target).map_err(|e| MountError::errno("unmount", target, e))
    }

    async fn force_unmount(&self, target: &Path) -> Result<(), MountError> {
        nix::mount::umount2(target, MntFlags::MNT_FORCE | MntFlags::MNT_DETACH)
            .map_err(|e| MountError::errno("force unmount", target, e))
    }

    async fn format(&self, device: &Path, fs_type: &str) -> Result<(), MountError> {
        let args: &[&str] = match fs_type {
            t if is_ext(t) => &["-F", "-m0"],
            "xfs" => &["-f"],
            other => return Err(MountError::UnsupportedFs(other.to_owned())),
        };
        execute_cmd(Command::new(format!("mkfs.{fs_type}")).args(args).arg(device)).await?;
        info!(device = %device.display(), fs_type, "filesystem created");
        Ok(())
    }

    async fn disk_format(&self, device: &Path) -> Result<Option<String>, MountError> {
        let mut cmd = Command::new("blkid");
        cmd.args(["-p", "-s", "TYPE", "-s", "PTTYPE", "-o", "export"])
            .arg(device);
        let output = run(&mut cmd).await?;
        match output.status.code() {
            Some(0) => Ok(parse_blkid(&stdout(&output))),
            // Nothing recognisable on the device.
            Some(2) => Ok(None),
            _ => Err(command_failed(&cmd, &output)),
        }
    }

    async fn find_device_by_wwn(&self, wwn: &str) -> Result<Option<PathBuf>, MountError> {
        let wwn = wwn.to_ascii_lowercase();
        // Multipath first so a multipathed LUN is never used through one path.
        let candidates = [
            format!("dm-uuid-mpath-3{wwn}"),
            format!("wwn-0x{wwn}"),
            format!("scsi-3{wwn}"),
        ];
        for name in candidates {
            let link = self.by_id_dir.join(&name);
            match tokio::fs::canonicalize(&link).await {
                Ok(device) => {
                    debug!(wwn, link = %link.display(), device = %device.display(), "device resolved");
                    return Ok(Some(device));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(MountError::io("resolve", link, e)),
            }
        }
        Ok(None)
    }

    async fn rescan_scsi_bus(&self) -> Result<(), MountError> {
        let mut hosts = match tokio::fs::read_dir(&self.scsi_host_dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MountError::io("read_dir", &self.scsi_host_dir, e)),
        };
        while let Some(entry) = hosts
            .next_entry()
            .await
            .map_err(|e| MountError::io("read_dir", &self.scsi_host_dir, e))?
        {
            let scan = entry.path().join("scan");
            if let Err(e) = tokio::fs::write(&scan, b"- - -").await {
                warn!(path = %scan.display(), error = %e, "SCSI host rescan failed");
            }
        }
        Ok(())
    }

    async fn device_size(&self, device: &Path) -> Result<u64, MountError> {
        let output = execute_cmd(Command::new("blockdev").arg("--getsize64").arg(device)).await?;
        let text = stdout(&output);
        text.trim()
            .parse()
            .map_err(|_| MountError::Parse(format!("blockdev size {:?}", text.trim())))
    }

    async fn filesystem_size(
        &self,
        device: &Path,
        mount_path: &Path,
        fs_type: &str,
    ) -> Result<u64, MountError> {
        match fs_type {
            t if is_ext(t) => {
                let output = execute_cmd(Command::new("dumpe2fs").arg("-h").arg(device)).await?;
                parse_dumpe2fs(&stdout(&output))
            }
            "xfs" => {
                let output =
                    execute_cmd(Command::new("xfs_io").args(["-c", "statfs"]).arg(mount_path))
                        .await?;
                parse_xfs_statfs(&stdout(&output))
            }
            other => Err(MountError::UnsupportedFs(other.to_owned())),
        }
    }

    async fn resize_filesystem(
        &self,
        device: &Path,
        mount_path: &Path,
        fs_type: &str,
    ) -> Result<(), MountError> {
        match fs_type {
            t if is_ext(t) => {
                execute_cmd(Command::new("resize2fs").arg(device)).await?;
            }
            "xfs" => {
                execute_cmd(Command::new("xfs_growfs").arg("-d").arg(mount_path)).await?;
            }
            other => return Err(MountError::UnsupportedFs(other.to_owned())),
        }
        info!(device = %device.display(), mount_path = %mount_path.display(), "filesystem grown");
        Ok(())
    }

    async fn filesystem_stats(&self, path: &Path) -> Result<FsStats, MountError> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| MountError::errno("statvfs", path, e))?;
        let frsize = stat.fragment_size() as u64;
        let blocks = stat.blocks() as u64;
        let files = stat.files() as u64;
        let files_free = stat.files_free() as u64;
        Ok(FsStats {
            total_bytes: blocks * frsize,
            available_bytes: stat.blocks_available() as u64 * frsize,
            used_bytes: blocks.saturating_sub(stat.blocks_free() as u64) * frsize,
            total_inodes: files,
            free_inodes: files_free,
            used_inodes: files.saturating_sub(files_free),
        })
    }

    async fn is_block_device(&self, path: &Path) -> Result<bool, MountError> {
        use std::os::unix::fs::FileTypeExt;

        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| MountError::io("stat", path, e))?;
        Ok(meta.file_type().is_block_device())
    }

    /// Mountinfo lists `/dev/mapper/<name>` where by-id resolves to
    /// `/dev/dm-N`, so compare the resolved nodes.
    async fn same_device(&self, a: &Path, b: &Path) -> Result<bool, MountError> {
        if a == b {
            return Ok(true);
        }
        let a = tokio::fs::canonicalize(a)
            .await
            .map_err(|e| MountError::io("resolve", a, e))?;
        let b = tokio::fs::canonicalize(b)
            .await
            .map_err(|e| MountError::io("resolve", b, e))?;
        Ok(a == b)
    }

    async fn path_exists(&self, path: &Path) -> Result<bool, MountError> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(MountError::io("stat", path, e)),
        }
    }

    async fn make_dir(&self, path: &Path) -> Result<(), MountError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| MountError::io("mkdir", path, e))
    }

    async fn make_file(&self, path: &Path) -> Result<(), MountError> {
        if let Some(parent) = path.parent() {
            self.make_dir(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await
            .map_err(|e| MountError::io("create", path, e))?;
        Ok(())
    }

    async fn remove_path(&self, path: &Path) -> Result<(), MountError> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(MountError::io("stat", path, e)),
        };
        let result = if meta.is_dir() {
            tokio::fs::remove_dir(path).await
        } else {
            tokio::fs::remove_file(path).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MountError::io("remove", path, e)),
        }
    }
}
