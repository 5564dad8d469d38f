//! Root-filesystem construction
//!
//! Runs inside the grandchild, after the sync gate and before privileges
//! drop; every step still requires root in the task's user namespace.
//! The sequence is: make the root a mount point (or attach the loop
//! image), populate `/sys`, `/proc`, `/dev` and friends, apply the
//! requested bind mounts, optionally freeze everything read-only, then
//! pivot into the new root.

use std::fs;
use std::os::fd::AsRawFd;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use nix::mount::{MntFlags, MsFlags, umount2};
use nix::sys::stat::{Mode, SFlag, makedev, mknod};
use nix::unistd::fchdir;

use crate::errors::{ErrorKind, Result, TaskError};
use crate::storage::{BindMap, LoopMount};
use crate::utils;

/// Proc entries masked read-only (or hidden) inside every task root
const RESTRICTED_PROC: &[&str] = &["/proc/sysrq-trigger", "/proc/irq", "/proc/bus"];

/// Builder for a task's private filesystem tree
#[derive(Debug)]
pub struct RootFs {
    root: PathBuf,
    root_rdonly: bool,
    loop_image: Option<(PathBuf, i32)>,
    bind_dns: bool,
    bind_map: Vec<BindMap>,
    cwd: PathBuf,
    new_mount_ns: bool,
    privileged: bool,
}

impl RootFs {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: impl AsRef<Path>,
        root_rdonly: bool,
        loop_image: Option<(PathBuf, i32)>,
        bind_dns: bool,
        bind_map: Vec<BindMap>,
        cwd: impl AsRef<Path>,
        new_mount_ns: bool,
        privileged: bool,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            root_rdonly,
            loop_image,
            bind_dns,
            bind_map,
            cwd: cwd.as_ref().to_path_buf(),
            new_mount_ns,
            privileged,
        }
    }

    /// True when the task keeps the host root
    pub fn is_host_root(&self) -> bool {
        self.root == Path::new("/")
    }

    fn inner(&self, path: &str) -> PathBuf {
        let rel = path.trim_start_matches('/');
        self.root.join(rel)
    }

    /// Create the mount target for a loop-image root before the mount
    /// namespace is populated
    pub fn prepare_loop_root(&self) -> Result<()> {
        if self.loop_image.is_some() && !self.root.exists() {
            fs::create_dir_all(&self.root)
                .map_err(|e| TaskError::unknown(format!("mkdir {}: {}", self.root.display(), e)))?;
        }
        Ok(())
    }

    /// Populate the root: image or self-bind, pseudo filesystems, device
    /// nodes, DNS binds
    pub fn mount_root_fs(&self) -> Result<()> {
        if self.is_host_root() {
            return Ok(());
        }

        match &self.loop_image {
            Some((backing, dev_index)) => {
                LoopMount::new(backing, &self.root, *dev_index).mount(self.root_rdonly)?;
            }
            None => {
                // the root becomes a mount point of its own so it can be
                // pivoted into
                bind_mount(&self.root, &self.root, false)?;
            }
        }

        let default_flags = MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;

        mount_fs(
            "sysfs",
            &self.inner("/sys"),
            "sysfs",
            default_flags | MsFlags::MS_RDONLY,
            None,
        )?;
        mount_fs("proc", &self.inner("/proc"), "proc", default_flags, None)?;

        self.restrict_proc(!self.privileged)?;
        self.mount_dev()?;

        if self.loop_image.is_some() {
            self.mount_run()?;
        }

        mount_fs(
            "shm",
            &self.inner("/dev/shm"),
            "tmpfs",
            default_flags,
            Some("mode=1777,size=65536k"),
        )?;

        if self.bind_dns {
            self.bind_dns_files()?;
        }

        Ok(())
    }

    /// Mask dangerous proc entries with read-only self-binds, hide kcore
    /// behind /dev/null
    fn restrict_proc(&self, restrict_proc_sys: bool) -> Result<()> {
        let mut paths: Vec<&str> = RESTRICTED_PROC.to_vec();
        if restrict_proc_sys {
            paths.push("/proc/sys");
        }

        for path in paths {
            let target = self.inner(path);
            bind_mount(&target, &target, true)?;
        }

        bind_mount(Path::new("/dev/null"), &self.inner("/proc/kcore"), false)?;

        Ok(())
    }

    fn mount_dev(&self) -> Result<()> {
        mount_fs(
            "tmpfs",
            &self.inner("/dev"),
            "tmpfs",
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some("mode=755,size=32m"),
        )?;
        mount_fs(
            "devpts",
            &self.inner("/dev/pts"),
            "devpts",
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("newinstance,ptmxmode=0666,mode=620,gid=5"),
        )?;

        let nodes: &[(&str, u64, u64)] = &[
            ("/dev/null", 1, 3),
            ("/dev/zero", 1, 5),
            ("/dev/full", 1, 7),
            ("/dev/random", 1, 8),
            ("/dev/urandom", 1, 9),
        ];
        for &(path, major, minor) in nodes {
            let target = self.inner(path);
            mknod(
                &target,
                SFlag::S_IFCHR,
                Mode::from_bits_truncate(0o666),
                makedev(major, minor),
            )
            .map_err(|e| TaskError::from_nix(format!("mknod({})", target.display()), e))?;
        }

        symlink("pts/ptmx", self.inner("/dev/ptmx"))
            .map_err(|e| TaskError::unknown(format!("symlink(/dev/ptmx): {}", e)))?;
        symlink("/proc/self/fd", self.inner("/dev/fd"))
            .map_err(|e| TaskError::unknown(format!("symlink(/dev/fd): {}", e)))?;

        if let Err(e) = fs::File::create(self.inner("/dev/console")) {
            warn!("touch /dev/console: {}", e);
        }

        Ok(())
    }

    /// Loop-image roots get a fresh tmpfs `/run`, with any directories
    /// that existed in the image recreated empty
    fn mount_run(&self) -> Result<()> {
        let run = self.inner("/run");
        let mut subdirs = Vec::new();

        if run.is_dir() {
            let entries = fs::read_dir(&run)
                .map_err(|e| TaskError::unknown(format!("read {}: {}", run.display(), e)))?;
            for entry in entries.flatten() {
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    subdirs.push(entry.file_name());
                }
            }
        } else {
            fs::create_dir_all(&run)
                .map_err(|e| TaskError::unknown(format!("mkdir {}: {}", run.display(), e)))?;
        }

        mount_fs(
            "tmpfs",
            &run,
            "tmpfs",
            MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
            Some("mode=755,size=32m"),
        )?;

        for name in subdirs {
            let dir = run.join(&name);
            fs::create_dir_all(&dir)
                .map_err(|e| TaskError::unknown(format!("mkdir {}: {}", dir.display(), e)))?;
        }

        Ok(())
    }

    fn bind_dns_files(&self) -> Result<()> {
        for file in ["/etc/hosts", "/etc/resolv.conf"] {
            bind_mount(Path::new(file), &self.inner(file), true)?;
        }
        Ok(())
    }

    /// The requested destination of a bind entry, root-relative
    fn bind_dest(&self, bind: &BindMap) -> PathBuf {
        if bind.dest.is_absolute() {
            let rel = bind.dest.strip_prefix("/").unwrap_or(&bind.dest);
            self.root.join(rel)
        } else {
            let cwd_rel = self.cwd.strip_prefix("/").unwrap_or(&self.cwd);
            self.root.join(cwd_rel).join(&bind.dest)
        }
    }

    /// Apply the bind map. Destinations must stay inside the root after
    /// symlink resolution.
    pub fn bind_directories(&self) -> Result<()> {
        let real_root = utils::resolve_path(&self.root);

        for bind in &self.bind_map {
            let dest = self.bind_dest(bind);
            let real_dest = utils::resolve_path(&dest);

            if real_dest == real_root || !real_dest.starts_with(&real_root) {
                return Err(TaskError::invalid_value(format!(
                    "bind mount {} resolves to root {} ({})",
                    bind.source.display(),
                    real_dest.display(),
                    self.root.display()
                )));
            }

            bind_mount(&bind.source, &real_dest, bind.rdonly)?;

            // drop nosuid,noexec,nodev inherited from the parent mount
            if self.new_mount_ns {
                let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND;
                if bind.rdonly {
                    flags |= MsFlags::MS_RDONLY;
                }
                remount(&real_dest, flags)?;
            }
        }

        Ok(())
    }

    /// Remount every mount point under the root read-only, except the
    /// restricted-proc overlays and the bind targets whose writability
    /// was requested explicitly
    pub fn remount_root_ro(&self) -> Result<()> {
        if !self.root_rdonly || self.loop_image.is_some() {
            return Ok(());
        }

        let bind_dests: Vec<PathBuf> = self
            .bind_map
            .iter()
            .map(|bind| {
                if bind.dest.is_absolute() {
                    bind.dest.clone()
                } else {
                    self.cwd.join(&bind.dest)
                }
            })
            .collect();

        for mountpoint in mount_snapshot()? {
            let Ok(inner) = mountpoint.strip_prefix(&self.root) else {
                continue;
            };
            let inner = Path::new("/").join(inner);

            if RESTRICTED_PROC
                .iter()
                .any(|dir| inner.starts_with(dir) || Path::new(dir).starts_with(&inner))
            {
                continue;
            }
            if bind_dests.iter().any(|dest| *dest == inner) {
                continue;
            }

            debug!("remount {} read-only", mountpoint.display());
            remount(
                &mountpoint,
                MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
            )?;
        }

        Ok(())
    }

    /// Switch the process into the new root. Falls back to chroot when
    /// pivot_root is not possible (for example on tmpfs-rooted hosts).
    pub fn pivot_into_root(&self) -> Result<()> {
        if self.is_host_root() {
            return Ok(());
        }

        if let Err(error) = pivot_root(&self.root) {
            warn!("pivot root failed, falling back to chroot: {}", error);
            nix::unistd::chroot(&self.root)
                .map_err(|e| TaskError::from_nix(format!("chroot({})", self.root.display()), e))?;
        }

        // honor suid binaries and device nodes at the container root
        let mut flags = MsFlags::MS_REMOUNT | MsFlags::MS_BIND;
        if self.root_rdonly {
            flags |= MsFlags::MS_RDONLY;
        }
        remount(Path::new("/"), flags)?;

        nix::unistd::chdir("/").map_err(|e| TaskError::from_nix("chdir(/)", e))?;
        Ok(())
    }
}

fn mount_fs(
    source: &str,
    target: &Path,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    if !target.exists() {
        fs::create_dir_all(target)
            .map_err(|e| TaskError::unknown(format!("mkdir {}: {}", target.display(), e)))?;
    }
    nix::mount::mount(Some(source), target, Some(fstype), flags, data).map_err(|e| {
        TaskError::new(
            ErrorKind::Unknown,
            e as i32,
            format!("mount {} at {}", fstype, target.display()),
        )
    })
}

/// Bind `source` onto `target`, creating the target as a directory or
/// file to match the source
fn bind_mount(source: &Path, target: &Path, rdonly: bool) -> Result<()> {
    if !target.exists() {
        if source.is_dir() {
            fs::create_dir_all(target)
                .map_err(|e| TaskError::unknown(format!("mkdir {}: {}", target.display(), e)))?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    TaskError::unknown(format!("mkdir {}: {}", parent.display(), e))
                })?;
            }
            fs::File::create(target)
                .map_err(|e| TaskError::unknown(format!("touch {}: {}", target.display(), e)))?;
        }
    }

    nix::mount::mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        TaskError::new(
            ErrorKind::Unknown,
            e as i32,
            format!("bind {} at {}", source.display(), target.display()),
        )
    })?;

    if rdonly {
        remount(
            target,
            MsFlags::MS_REMOUNT | MsFlags::MS_BIND | MsFlags::MS_RDONLY,
        )?;
    }

    Ok(())
}

pub(crate) fn remount(target: &Path, flags: MsFlags) -> Result<()> {
    nix::mount::mount(None::<&str>, target, None::<&str>, flags, None::<&str>).map_err(|e| {
        TaskError::new(
            ErrorKind::Unknown,
            e as i32,
            format!("remount {} ({:?})", target.display(), flags),
        )
    })
}

/// Mount points currently visible to this process, in mount order
fn mount_snapshot() -> Result<Vec<PathBuf>> {
    let content = fs::read_to_string("/proc/self/mounts")
        .map_err(|e| TaskError::unknown(format!("read /proc/self/mounts: {}", e)))?;
    Ok(parse_mounts(&content))
}

fn parse_mounts(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .map(PathBuf::from)
        .collect()
}

/// `/proc/self/mounts` escapes whitespace and backslashes octally
fn unescape_mount_path(raw: &str) -> String {
    let mut result = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        let digits: String = chars.clone().take(3).collect();
        if digits.len() == 3
            && let Ok(code) = u8::from_str_radix(&digits, 8)
        {
            result.push(code as char);
            chars.nth(2);
        } else {
            result.push(c);
        }
    }
    result
}

/// pivot_root into `new_root` keeping no reference to the old root: the
/// old root is stacked underneath and lazily detached
fn pivot_root(new_root: &Path) -> Result<()> {
    let old_root =
        fs::File::open("/").map_err(|e| TaskError::unknown(format!("open(/): {}", e)))?;

    nix::unistd::chdir(new_root)
        .map_err(|e| TaskError::from_nix(format!("chdir({})", new_root.display()), e))?;
    nix::unistd::pivot_root(".", ".").map_err(|e| TaskError::from_nix("pivot_root(.)", e))?;
    fchdir(old_root.as_raw_fd()).map_err(|e| TaskError::from_nix("fchdir(old root)", e))?;
    umount2(".", MntFlags::MNT_DETACH).map_err(|e| TaskError::from_nix("umount2(old root)", e))?;
    nix::unistd::chdir("/").map_err(|e| TaskError::from_nix("chdir(/)", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn plain_rootfs(root: &Path, bind_map: Vec<BindMap>) -> RootFs {
        RootFs::new(root, false, None, false, bind_map, "/", true, true)
    }

    #[test]
    fn test_host_root_detection() {
        assert!(plain_rootfs(Path::new("/"), Vec::new()).is_host_root());
        assert!(!plain_rootfs(Path::new("/tmp/r"), Vec::new()).is_host_root());
    }

    #[test]
    fn test_inner_path_join() {
        let rootfs = plain_rootfs(Path::new("/tmp/r"), Vec::new());
        assert_eq!(rootfs.inner("/dev/pts"), PathBuf::from("/tmp/r/dev/pts"));
    }

    #[test]
    fn test_bind_dest_absolute_and_relative() {
        let rootfs = RootFs::new(
            "/tmp/r",
            false,
            None,
            false,
            Vec::new(),
            "/work",
            true,
            true,
        );
        let absolute = BindMap {
            source: PathBuf::from("/etc"),
            dest: PathBuf::from("/etc"),
            rdonly: true,
        };
        let relative = BindMap {
            source: PathBuf::from("/etc"),
            dest: PathBuf::from("etc"),
            rdonly: true,
        };
        assert_eq!(rootfs.bind_dest(&absolute), PathBuf::from("/tmp/r/etc"));
        assert_eq!(rootfs.bind_dest(&relative), PathBuf::from("/tmp/r/work/etc"));
    }

    #[test]
    fn test_bind_escape_is_rejected() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("r");
        fs::create_dir_all(&root).unwrap();

        let rootfs = plain_rootfs(
            &root,
            vec![BindMap {
                source: PathBuf::from("/etc"),
                dest: PathBuf::from("../../../etc"),
                rdonly: true,
            }],
        );

        let err = rootfs.bind_directories().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
        assert!(err.message.contains("resolves to root"), "{}", err.message);
    }

    #[test]
    fn test_bind_to_root_itself_is_rejected() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("r");
        fs::create_dir_all(&root).unwrap();

        let rootfs = plain_rootfs(
            &root,
            vec![BindMap {
                source: PathBuf::from("/etc"),
                dest: PathBuf::from("/"),
                rdonly: false,
            }],
        );

        assert!(rootfs.bind_directories().is_err());
    }

    #[test]
    fn test_symlink_escape_is_rejected() {
        let tmp = tempdir().unwrap();
        let root = tmp.path().join("r");
        fs::create_dir_all(&root).unwrap();
        symlink("/", root.join("out")).unwrap();

        let rootfs = plain_rootfs(
            &root,
            vec![BindMap {
                source: PathBuf::from("/etc"),
                dest: PathBuf::from("/out/etc"),
                rdonly: true,
            }],
        );

        let err = rootfs.bind_directories().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn test_parse_mounts_extracts_mountpoints() {
        let content = "sysfs /sys sysfs rw 0 0\n\
                       tmpfs /dev\\040shm tmpfs rw 0 0\n";
        let mounts = parse_mounts(content);
        assert_eq!(mounts[0], PathBuf::from("/sys"));
        assert_eq!(mounts[1], PathBuf::from("/dev shm"));
    }

    #[test]
    fn test_mount_snapshot_sees_root() {
        let mounts = mount_snapshot().unwrap();
        assert!(mounts.contains(&PathBuf::from("/")));
    }

    #[test]
    fn test_remount_ro_skipped_for_loop_and_writable_roots() {
        let rootfs = plain_rootfs(Path::new("/tmp/r"), Vec::new());
        // root_rdonly is false, nothing to do and no mounts are touched
        assert!(rootfs.remount_root_ro().is_ok());

        let loop_rootfs = RootFs::new(
            "/tmp/r",
            true,
            Some((PathBuf::from("/img"), 0)),
            false,
            Vec::new(),
            "/",
            true,
            true,
        );
        assert!(loop_rootfs.remount_root_ro().is_ok());
    }
}
