//! Loop-device backed root images

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use log::warn;
use nix::mount::MsFlags;
use nix::{ioctl_none_bad, ioctl_write_int_bad};

use crate::errors::{ErrorKind, Result, TaskError};

const LOOP_SET_FD: libc::c_ulong = 0x4C00;
const LOOP_CLR_FD: libc::c_ulong = 0x4C01;

ioctl_write_int_bad!(ioctl_loop_set_fd, LOOP_SET_FD);
ioctl_none_bad!(ioctl_loop_clr_fd, LOOP_CLR_FD);

/// A backing file attached to a numbered loop device and mounted as the
/// task's ext4 root image
#[derive(Debug)]
pub struct LoopMount {
    backing: PathBuf,
    target: PathBuf,
    dev_index: i32,
}

impl LoopMount {
    pub fn new(backing: impl AsRef<Path>, target: impl AsRef<Path>, dev_index: i32) -> Self {
        Self {
            backing: backing.as_ref().to_path_buf(),
            target: target.as_ref().to_path_buf(),
            dev_index,
        }
    }

    fn dev_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/loop{}", self.dev_index))
    }

    /// Attach the backing file and mount ext4 at the target. On mount
    /// failure the device is detached again.
    pub fn mount(&self, read_only: bool) -> Result<()> {
        let dev_path = self.dev_path();
        let device = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&dev_path)
            .map_err(|e| TaskError::unknown(format!("open {}: {}", dev_path.display(), e)))?;
        let backing = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&self.backing)
            .map_err(|e| TaskError::unknown(format!("open {}: {}", self.backing.display(), e)))?;

        unsafe { ioctl_loop_set_fd(device.as_raw_fd(), backing.as_raw_fd()) }.map_err(|e| {
            TaskError::from_nix(format!("LOOP_SET_FD {}", dev_path.display()), e)
        })?;

        let mut flags = MsFlags::empty();
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        let mounted = nix::mount::mount(
            Some(dev_path.as_path()),
            &self.target,
            Some("ext4"),
            flags,
            None::<&str>,
        );
        if let Err(e) = mounted {
            if let Err(clear) = unsafe { ioctl_loop_clr_fd(device.as_raw_fd()) } {
                warn!("LOOP_CLR_FD {}: {}", dev_path.display(), clear);
            }
            return Err(TaskError::new(
                ErrorKind::Unknown,
                e as i32,
                format!(
                    "mount {} at {}",
                    dev_path.display(),
                    self.target.display()
                ),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dev_path_from_index() {
        let m = LoopMount::new("/images/root.img", "/mnt/root", 7);
        assert_eq!(m.dev_path(), PathBuf::from("/dev/loop7"));
    }

    #[test]
    fn test_mount_missing_backing_fails() {
        let m = LoopMount::new("/definitely/not/there.img", "/mnt/root", 0);
        let err = m.mount(true).unwrap_err();
        assert!(err.message.contains("open"));
    }
}
