//! Namespace handles for entering another process's namespaces
//!
//! The launcher enters namespaces from open fds rather than paths: the fds
//! are captured while the target is known to be alive and stay valid even
//! if it exits. The mount namespace is always entered last, since entering
//! it changes the view of `/proc` the remaining opens would need.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::Path;

use nix::sched::{CloneFlags, setns};
use nix::unistd::{Pid, fchdir};

use crate::errors::{Result, TaskError};

/// An open fd for one namespace of some process
#[derive(Debug, Default)]
pub struct NamespaceFd {
    fd: Option<OwnedFd>,
}

impl NamespaceFd {
    /// Open `/proc/<pid>/ns/<name>` (or `/proc/<pid>/root` for the root
    /// directory handle)
    pub fn open(pid: Pid, name: &str) -> Result<Self> {
        let path = format!("/proc/{}/{}", pid.as_raw(), name);
        Self::open_path(Path::new(&path))
    }

    pub fn open_path(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| TaskError::unknown(format!("open {}: {}", path.display(), e)))?;
        Ok(Self {
            fd: Some(file.into()),
        })
    }

    pub fn is_opened(&self) -> bool {
        self.fd.is_some()
    }

    /// Move the calling process into this namespace. No-op when the fd
    /// was never opened.
    pub fn set_ns(&self, nstype: CloneFlags) -> Result<()> {
        if let Some(fd) = &self.fd {
            setns(fd.as_fd(), nstype)
                .map_err(|e| TaskError::from_nix(format!("setns({:?})", nstype), e))?;
        }
        Ok(())
    }

    /// Change root to the directory this fd refers to
    pub fn chroot(&self) -> Result<()> {
        let Some(fd) = &self.fd else {
            return Err(TaskError::invalid_value("chroot on unopened namespace fd"));
        };
        fchdir(fd.as_raw_fd()).map_err(|e| TaskError::from_nix("fchdir(ns root)", e))?;
        nix::unistd::chroot(".").map_err(|e| TaskError::from_nix("chroot(ns root)", e))?;
        Ok(())
    }
}

/// Snapshot of the namespaces a task must join before being cloned
#[derive(Debug, Default)]
pub struct NamespaceSnapshot {
    pub user: NamespaceFd,
    pub ipc: NamespaceFd,
    pub uts: NamespaceFd,
    pub net: NamespaceFd,
    pub pid: NamespaceFd,
    pub mnt: NamespaceFd,
    /// Root directory of the target's mount namespace, for the chroot
    /// that follows entering it
    pub root: NamespaceFd,
}

impl NamespaceSnapshot {
    /// Capture every namespace of `pid`
    pub fn open(pid: Pid) -> Result<Self> {
        Ok(Self {
            user: NamespaceFd::open(pid, "ns/user")?,
            ipc: NamespaceFd::open(pid, "ns/ipc")?,
            uts: NamespaceFd::open(pid, "ns/uts")?,
            net: NamespaceFd::open(pid, "ns/net")?,
            pid: NamespaceFd::open(pid, "ns/pid")?,
            mnt: NamespaceFd::open(pid, "ns/mnt")?,
            root: NamespaceFd::open(pid, "root")?,
        })
    }

    pub fn has_any(&self) -> bool {
        self.user.is_opened()
            || self.ipc.is_opened()
            || self.uts.is_opened()
            || self.net.is_opened()
            || self.pid.is_opened()
            || self.mnt.is_opened()
    }

    /// Enter every captured namespace, mount namespace last
    pub fn enter(&self) -> Result<()> {
        self.user.set_ns(CloneFlags::CLONE_NEWUSER)?;
        self.ipc.set_ns(CloneFlags::CLONE_NEWIPC)?;
        self.uts.set_ns(CloneFlags::CLONE_NEWUTS)?;
        self.net.set_ns(CloneFlags::CLONE_NEWNET)?;
        self.pid.set_ns(CloneFlags::CLONE_NEWPID)?;
        self.mnt.set_ns(CloneFlags::CLONE_NEWNS)?;
        Ok(())
    }
}

/// Get the inode identifying one of `pid`'s namespaces (`None` for the
/// calling process)
pub fn namespace_inode(name: &str, pid: Option<Pid>) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;

    let who = match pid {
        Some(p) => p.as_raw().to_string(),
        None => "self".to_string(),
    };
    let path = format!("/proc/{}/ns/{}", who, name);
    let stat = std::fs::metadata(&path)
        .map_err(|e| TaskError::unknown(format!("stat {}: {}", path, e)))?;
    Ok(stat.ino())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fd_is_unopened() {
        let fd = NamespaceFd::default();
        assert!(!fd.is_opened());
        // set_ns on an unopened fd is a no-op
        assert!(fd.set_ns(CloneFlags::CLONE_NEWNET).is_ok());
    }

    #[test]
    fn test_chroot_on_unopened_fd_fails() {
        assert!(NamespaceFd::default().chroot().is_err());
    }

    #[test]
    fn test_open_own_namespaces() {
        let snapshot = NamespaceSnapshot::open(nix::unistd::getpid()).unwrap();
        assert!(snapshot.has_any());
        assert!(snapshot.mnt.is_opened());
        assert!(snapshot.root.is_opened());
    }

    #[test]
    fn test_default_snapshot_has_none() {
        assert!(!NamespaceSnapshot::default().has_any());
    }

    #[test]
    fn test_namespace_inode_is_stable() {
        let a = namespace_inode("pid", None).unwrap();
        let b = namespace_inode("pid", None).unwrap();
        assert_eq!(a, b);
        assert!(a > 0);
    }

    #[test]
    fn test_entering_own_snapshot_is_a_noop() {
        // Entering namespaces we are already in requires no privileges
        // for the mount namespace only when it is unchanged; restrict the
        // check to inode equality to keep the test unprivileged.
        let self_pid = nix::unistd::getpid();
        let own = namespace_inode("net", None).unwrap();
        let via_pid = namespace_inode("net", Some(self_pid)).unwrap();
        assert_eq!(own, via_pid);
    }
}
