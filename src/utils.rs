//! Utility functions shared by the launcher processes

use std::fs;
use std::os::fd::RawFd;
use std::path::{Component, Path, PathBuf};

use log::warn;
use nix::unistd::{Gid, Uid};

use crate::errors::{Result, TaskError};

/// Check if running as root
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Read `/proc/<pid>/status` as lines
pub fn proc_status_lines(pid: libc::pid_t) -> Result<Vec<String>> {
    let path = format!("/proc/{}/status", pid);
    let content = fs::read_to_string(&path)
        .map_err(|e| TaskError::unknown(format!("read {}: {}", path, e)))?;
    Ok(content.lines().map(str::to_string).collect())
}

/// Resolve symlinks in `path`, tolerating a nonexistent tail: components
/// are walked left to right, each existing prefix is canonicalized and
/// `..` applies to the resolved path. Bind-mount destinations are checked
/// against the container root before they exist.
pub fn resolve_path(path: &Path) -> PathBuf {
    let mut resolved = if path.is_absolute() {
        PathBuf::from("/")
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
    };

    for component in path.components() {
        match component {
            Component::RootDir | Component::Prefix(_) => resolved = PathBuf::from("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                resolved.pop();
            }
            Component::Normal(name) => {
                resolved.push(name);
                if let Ok(real) = resolved.canonicalize() {
                    resolved = real;
                }
            }
        }
    }

    resolved
}

/// Close every inherited fd at or above `first`, except the ones listed in
/// `keep`. Walks `/proc/self/fd` so only fds that actually exist are
/// touched.
pub fn close_fds_from(first: RawFd, keep: &[RawFd]) {
    let entries = match fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries,
        Err(e) => {
            warn!("read /proc/self/fd: {}", e);
            return;
        }
    };

    let mut fds = Vec::new();
    for entry in entries.flatten() {
        if let Ok(fd) = entry.file_name().to_string_lossy().parse::<RawFd>()
            && fd >= first
            && !keep.contains(&fd)
        {
            fds.push(fd);
        }
    }

    // the read_dir fd itself is in the list; closing it twice is harmless
    for fd in fds {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Directory created on behalf of a task and removed when the owning
/// handle is dropped. Cleanup only applies to directories this guard
/// itself created under the launcher's scratch area.
#[derive(Debug)]
pub struct ScopedDir {
    path: PathBuf,
    cleanup: bool,
}

impl ScopedDir {
    /// Create `path` (and missing parents) owned by `uid:gid`. `cleanup`
    /// marks the directory for removal on drop.
    pub fn create(path: &Path, uid: Uid, gid: Gid, cleanup: bool) -> Result<Self> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| {
                if e.raw_os_error() == Some(libc::ENOSPC) {
                    TaskError::no_space(libc::ENOSPC, format!("mkdir {}: {}", path.display(), e))
                } else {
                    TaskError::unknown(format!("mkdir {}: {}", path.display(), e))
                }
            })?;
            nix::unistd::chown(path, Some(uid), Some(gid))
                .map_err(|e| TaskError::from_nix(format!("chown {}", path.display()), e))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            cleanup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScopedDir {
    fn drop(&mut self) {
        if self.cleanup
            && let Err(e) = fs::remove_dir_all(&self.path)
        {
            warn!("remove scoped dir {}: {}", self.path.display(), e);
        }
    }
}
