//! Filesystem project-quota backends.
//!
//! A [`QuotaBackend`] binds a project ID to a directory subtree and enforces
//! a block hard-limit on it. Two variants exist, one per supported
//! filesystem; which one is active is decided once at startup by probing
//! the filesystem magic number of the containerd root.

mod ext4;
mod xfs;

use domain::{ProjectId, QuotaReport, ReportKind};
use log::{debug, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::thread;
use std::time::Duration;
use thiserror::Error;

pub use ext4::Ext4Backend;
pub use xfs::XfsBackend;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to run {0}: {1}")]
    Spawn(&'static str, #[source] io::Error),
    #[error("{0} exited with {1}: {2}")]
    CommandFailed(&'static str, std::process::ExitStatus, String),
    #[error("no mount entry covers {0}")]
    MountNotFound(PathBuf),
    #[error("unsupported filesystem magic {0:#x} at {1}")]
    UnsupportedFilesystem(i64, PathBuf),
    #[error("statfs({0:?}) failed: {1}")]
    Statfs(PathBuf, #[source] io::Error),
    #[error("could not parse quota report line {0:?}")]
    UnparseableReport(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which on-disk filesystem backs the containerd root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filesystem {
    Xfs,
    Ext4,
}

const EXT4_SUPER_MAGIC: i64 = 0xEF53;
const XFS_SUPER_MAGIC: i64 = 0x5846_5342;

/// Probe `path`'s filesystem magic number and return which backend applies.
pub fn detect_filesystem(path: &Path) -> Result<Filesystem> {
    let cpath = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|_| Error::Statfs(path.to_path_buf(), io::Error::from(io::ErrorKind::InvalidInput)))?;
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statfs(cpath.as_ptr(), &mut buf) };
    if rc != 0 {
        return Err(Error::Statfs(path.to_path_buf(), io::Error::last_os_error()));
    }
    match buf.f_type as i64 {
        EXT4_SUPER_MAGIC => Ok(Filesystem::Ext4),
        XFS_SUPER_MAGIC => Ok(Filesystem::Xfs),
        other => Err(Error::UnsupportedFilesystem(other, path.to_path_buf())),
    }
}

/// Construct the concrete backend for `path`, detecting the filesystem and
/// resolving the mount point it lives on.
pub fn new_backend(path: &Path) -> Result<Box<dyn QuotaBackend>> {
    let mount = find_mount_point(path)?;
    match detect_filesystem(path)? {
        Filesystem::Xfs => Ok(Box::new(XfsBackend::new(mount))),
        Filesystem::Ext4 => Ok(Box::new(Ext4Backend::new(mount))),
    }
}

/// Capability set shared by every quota backend.
pub trait QuotaBackend: Send + Sync {
    /// Stamp `path` (and everything under it) with `id` as its project ID.
    fn set_project_id(&self, path: &Path, id: ProjectId) -> Result<()>;
    /// Set the block hard limit for `id`, in bytes.
    fn set_quota(&self, id: ProjectId, bytes: u64) -> Result<()>;
    /// Clear the project limit and detach the project ID.
    fn remove_quota(&self, path: &Path, id: ProjectId) -> Result<()>;
    /// List current usage/limit for every active project ID of `kind`.
    fn fetch_all_reports(&self, kind: ReportKind) -> Result<Vec<QuotaReport>>;
}

/// Find the mount point (and whether `prjquota` is among its options)
/// covering `path`, by longest-prefix match over `/proc/self/mounts`.
pub fn find_mount_point(path: &Path) -> Result<PathBuf> {
    let (mount, _options) = find_mount_entry(path, "/proc/self/mounts")?;
    Ok(mount)
}

fn find_mount_entry(path: &Path, mounts_file: &str) -> Result<(PathBuf, Vec<String>)> {
    let contents = std::fs::read_to_string(mounts_file)
        .map_err(|e| Error::Spawn("read /proc/self/mounts", e))?;
    let target = path.to_string_lossy();
    let mut best: Option<(PathBuf, Vec<String>)> = None;
    for line in contents.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_device), Some(mount_point), Some(_fstype), Some(options)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !target.starts_with(mount_point) {
            continue;
        }
        let better = match &best {
            Some((current, _)) => mount_point.len() > current.to_string_lossy().len(),
            None => true,
        };
        if better {
            best = Some((
                PathBuf::from(mount_point),
                options.split(',').map(str::to_string).collect(),
            ));
        }
    }
    best.ok_or_else(|| Error::MountNotFound(path.to_path_buf()))
}

/// Block until the mount covering `containerd_path` advertises `prjquota`
/// among its options, polling every `interval`. Intended to be run from a
/// blocking context (e.g. `tokio::task::spawn_blocking`) before the agent
/// starts serving traffic.
pub fn wait_for_prjquota(containerd_path: &Path, interval: Duration) {
    loop {
        match find_mount_entry(containerd_path, "/proc/self/mounts") {
            Ok((mount, options)) if options.iter().any(|o| o == "prjquota") => {
                debug!("prjquota confirmed on {}", mount.display());
                return;
            }
            Ok((mount, _)) => warn!("waiting for prjquota on {}", mount.display()),
            Err(e) => warn!("waiting for containerd mount: {e}"),
        }
        thread::sleep(interval);
    }
}

/// Run `cmd` to completion, returning its captured output or a structured
/// error if it could not be spawned or exited non-zero.
fn run(name: &'static str, cmd: &mut Command) -> Result<Output> {
    let output = cmd.output().map_err(|e| Error::Spawn(name, e))?;
    if !output.status.success() {
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        return Err(Error::CommandFailed(name, output.status, combined));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn find_mount_entry_picks_longest_prefix() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "overlay / overlay rw,relatime 0 0").unwrap();
        writeln!(f, "/dev/sda1 /var/lib/containerd xfs rw,prjquota 0 0").unwrap();
        let path = f.path().to_str().unwrap();

        let (mount, options) =
            find_mount_entry(Path::new("/var/lib/containerd/io.containerd.snapshotter.v1.overlayfs"), path)
                .unwrap();
        assert_eq!(mount, PathBuf::from("/var/lib/containerd"));
        assert!(options.iter().any(|o| o == "prjquota"));
    }

    #[test]
    fn find_mount_entry_falls_back_to_root() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "overlay / overlay rw,relatime 0 0").unwrap();
        let path = f.path().to_str().unwrap();
        let (mount, _) = find_mount_entry(Path::new("/no/such/mount"), path).unwrap();
        assert_eq!(mount, PathBuf::from("/"));
    }

    #[test]
    fn find_mount_entry_errors_with_empty_table() {
        let f = tempfile::NamedTempFile::new().unwrap();
        let path = f.path().to_str().unwrap();
        assert!(find_mount_entry(Path::new("/no/such/mount"), path).is_err());
    }
}
