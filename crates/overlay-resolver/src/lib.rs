//! Maps a container's rootfs mount to its overlayfs snapshot ID and
//! upperdir by parsing the host mount table.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read {0}: {1}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("no mount entry for rootfs {0}")]
    RootfsNotFound(PathBuf),
    #[error("mount entry for {0} has no upperdir option")]
    NoUpperdir(PathBuf),
    #[error("upperdir {0:?} has a non-decimal snapshot id")]
    BadSnapshotId(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A resolved overlay snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlaySnapshot {
    pub snapshot_id: u64,
    pub upper_dir: PathBuf,
}

/// Resolve `container_rootfs` against the PID-1 mount table
/// (`/proc/1/mountinfo`).
pub fn resolve(container_rootfs: &Path) -> Result<OverlaySnapshot> {
    resolve_from_file(container_rootfs, Path::new("/proc/1/mountinfo"))
}

/// Same as [`resolve`] but reading an arbitrary mountinfo-formatted file;
/// exposed for testing.
pub fn resolve_from_file(container_rootfs: &Path, mountinfo_path: &Path) -> Result<OverlaySnapshot> {
    let contents = std::fs::read_to_string(mountinfo_path)
        .map_err(|e| Error::Read(mountinfo_path.to_path_buf(), e))?;
    let target = container_rootfs.to_string_lossy();

    for line in contents.lines() {
        let Some((pre, post)) = line.split_once(" - ") else { continue };
        let pre_fields: Vec<&str> = pre.split_whitespace().collect();
        let Some(mount_point) = pre_fields.get(4) else { continue };
        if *mount_point != target {
            continue;
        }
        let post_fields: Vec<&str> = post.split_whitespace().collect();
        let Some(options) = post_fields.get(2) else {
            return Err(Error::NoUpperdir(container_rootfs.to_path_buf()));
        };
        let upper_dir = options
            .split(',')
            .find_map(|opt| opt.strip_prefix("upperdir="))
            .ok_or_else(|| Error::NoUpperdir(container_rootfs.to_path_buf()))?;
        return snapshot_from_upperdir(Path::new(upper_dir));
    }
    Err(Error::RootfsNotFound(container_rootfs.to_path_buf()))
}

/// The snapshot directory is the upperdir's parent when the upperdir ends
/// in `/fs`; the snapshot ID is that directory's basename, parsed as a
/// decimal integer.
fn snapshot_from_upperdir(upper_dir: &Path) -> Result<OverlaySnapshot> {
    let snapshot_dir = if upper_dir.file_name().map(|n| n == "fs").unwrap_or(false) {
        upper_dir.parent().unwrap_or(upper_dir)
    } else {
        upper_dir
    };
    let snapshot_id = snapshot_dir
        .file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse::<u64>().ok())
        .ok_or_else(|| Error::BadSnapshotId(upper_dir.to_path_buf()))?;
    Ok(OverlaySnapshot { snapshot_id, upper_dir: upper_dir.to_path_buf() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_mountinfo(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        f
    }

    #[test]
    fn resolves_snapshot_id_from_upperdir() {
        let rootfs = "/run/containerd/io.containerd.runtime.v2.task/k8s.io/abc/rootfs";
        let line = format!(
            "123 456 0:1 / {rootfs} rw,relatime shared:1 - overlay overlay rw,\
             upperdir=/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs/snapshots/42/fs,\
             workdir=/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs/snapshots/42/work"
        );
        let f = write_mountinfo(&[&line]);
        let snap = resolve_from_file(Path::new(rootfs), f.path()).unwrap();
        assert_eq!(snap.snapshot_id, 42);
        assert!(snap.upper_dir.ends_with("snapshots/42/fs"));
    }

    #[test]
    fn errors_when_rootfs_not_mounted() {
        let f = write_mountinfo(&["123 456 0:1 / / rw - ext4 /dev/sda1 rw"]);
        let err = resolve_from_file(Path::new("/no/such/rootfs"), f.path()).unwrap_err();
        assert!(matches!(err, Error::RootfsNotFound(_)));
    }

    #[test]
    fn errors_on_non_decimal_snapshot_basename() {
        let rootfs = "/run/containerd/task/rootfs";
        let line = format!(
            "1 2 0:1 / {rootfs} rw - overlay overlay rw,upperdir=/var/lib/containerd/snapshots/not-a-number/fs"
        );
        let f = write_mountinfo(&[&line]);
        let err = resolve_from_file(Path::new(rootfs), f.path()).unwrap_err();
        assert!(matches!(err, Error::BadSnapshotId(_)));
    }

    #[test]
    fn requires_exact_mount_point_match() {
        let rootfs = "/run/containerd/task/rootfs";
        let line = format!(
            "1 2 0:1 / {rootfs}-other rw - overlay overlay rw,upperdir=/snapshots/1/fs"
        );
        let f = write_mountinfo(&[&line]);
        assert!(resolve_from_file(Path::new(rootfs), f.path()).is_err());
    }
}
