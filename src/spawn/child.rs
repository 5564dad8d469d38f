//! Grandchild initialization pipeline
//!
//! Everything here runs in the cloned process, between the sync gate and
//! exec. The order is load-bearing: mounts need root privileges that the
//! credential switch removes, mount propagation changes assume the state
//! left by the previous step, and exec must be last because it only
//! returns on failure.

use std::ffi::CString;

use log::debug;
use nix::mount::{MntFlags, MsFlags, umount2};
use nix::sched::CloneFlags;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::sys::stat::{Mode, umask};
use nix::unistd::setsid;

use crate::errors::{ErrorKind, Result, TaskError};
use crate::isolation::caps;
use crate::network::NetLink;
use crate::spawn::cmdline;
use crate::spawn::pipe::{SpawnPipe, SyncPipe};
use crate::storage::RootFs;
use crate::task::env::TaskEnv;

pub const CHILD_PROCESS_NAME: &std::ffi::CStr = c"taskbox-spawn-c";

/// The grandchild's view of a launch in progress
pub struct ChildStage<'a> {
    env: &'a TaskEnv,
    spawn_pipe: &'a mut SpawnPipe,
    sync_pipe: &'a mut SyncPipe,
    verbose: bool,
}

impl<'a> ChildStage<'a> {
    pub fn new(
        env: &'a TaskEnv,
        spawn_pipe: &'a mut SpawnPipe,
        sync_pipe: &'a mut SyncPipe,
        verbose: bool,
    ) -> Self {
        Self {
            env,
            spawn_pipe,
            sync_pipe,
            verbose,
        }
    }

    /// Entry point inside the cloned process. Never returns: either exec
    /// replaces the process image or the first error is reported and the
    /// process exits non-zero.
    pub fn run(mut self) -> isize {
        if let Err(e) = nix::sys::prctl::set_name(CHILD_PROCESS_NAME) {
            debug!("prctl(PR_SET_NAME): {}", e);
        }

        let error = match self.pipeline() {
            Err(error) => error,
            // exec only returns on failure
            Ok(never) => match never {},
        };
        self.abort(&error)
    }

    /// Report the first failure to the supervisor and exit
    fn abort(&self, error: &TaskError) -> ! {
        if let Err(e) = self.spawn_pipe.send_error(error) {
            log::error!("can't report child error: {}", e);
        }
        std::process::exit(libc::EXIT_FAILURE);
    }

    fn pipeline(&mut self) -> Result<std::convert::Infallible> {
        // the write end is held only for symmetry with the intermediate
        self.sync_pipe.close_write();
        self.sync_pipe.wait()?;

        self.spawn_pipe.close_read();
        reset_signal_handlers();

        self.env.rlimits.apply()?;

        setsid().map_err(|e| TaskError::from_nix("setsid()", e))?;
        umask(Mode::empty());

        if self.env.new_mount_ns {
            // receive propagations from the parent namespace but keep
            // ours contained
            crate::storage::rootfs::remount(
                std::path::Path::new("/"),
                MsFlags::MS_REC | MsFlags::MS_SLAVE,
            )?;
        }

        let rootfs = RootFs::new(
            &self.env.root,
            self.env.root_rdonly,
            self.env
                .loop_image
                .as_ref()
                .map(|path| (path.clone(), self.env.loop_dev)),
            self.env.bind_dns,
            self.env.bind_map.clone(),
            &self.env.cwd,
            self.env.new_mount_ns,
            self.env.cred.is_root(),
        );

        if self.env.isolate {
            // remount proc so the new PID namespace is visible
            umount2("/proc", MntFlags::MNT_DETACH)
                .map_err(|e| TaskError::from_nix("detach procfs", e))?;
            nix::mount::mount(
                Some("proc"),
                "/proc",
                Some("proc"),
                MsFlags::empty(),
                None::<&str>,
            )
            .map_err(|e| TaskError::from_nix("remount procfs", e))?;

            rootfs.prepare_loop_root()?;
        }

        if self.env.net_cfg.new_net_ns {
            self.enable_net()?;
        }

        if self.env.parent_ns.mnt.is_opened() {
            self.env.parent_ns.mnt.set_ns(CloneFlags::CLONE_NEWNS)?;
            self.env.parent_ns.root.chroot()?;
            nix::unistd::chdir(&self.env.cwd).map_err(|e| {
                TaskError::from_nix(format!("chdir({})", self.env.cwd.display()), e)
            })?;
        } else {
            rootfs.mount_root_fs()?;
            rootfs.bind_directories()?;
            rootfs.remount_root_ro()?;
            rootfs.pivot_into_root()?;
            nix::unistd::chdir(&self.env.cwd).map_err(|e| {
                TaskError::from_nix(format!("chdir({})", self.env.cwd.display()), e)
            })?;
            self.set_hostname()?;
        }

        if self.env.new_mount_ns {
            // subcontainers will get propagation from us
            crate::storage::rootfs::remount(
                std::path::Path::new("/"),
                MsFlags::MS_REC | MsFlags::MS_SHARED,
            )?;
        }

        self.apply_capabilities()?;
        self.drop_privileges()?;

        self.exec()
    }

    /// Bring links up and apply addresses and gateways inside the new
    /// network namespace
    fn enable_net(&self) -> Result<()> {
        let nl = NetLink::connect()?;

        for (index, name) in nl.links()? {
            nl.up(index)?;

            for ip in &self.env.ip_vec {
                if ip.iface == name {
                    nl.set_ip_addr(index, ip.addr, ip.prefix)?;
                }
            }

            for gw in &self.env.gw_vec {
                if gw.iface == name {
                    nl.set_default_gw(gw.addr)?;
                }
            }
        }

        Ok(())
    }

    /// Rewrite `/etc/hostname` (when the image carries one) and set the
    /// UTS hostname
    fn set_hostname(&self) -> Result<()> {
        if self.env.hostname.is_empty() || self.env.root == std::path::Path::new("/") {
            return Ok(());
        }

        let etc_hostname = std::path::Path::new("/etc/hostname");
        if etc_hostname.exists() {
            std::fs::write(etc_hostname, format!("{}\n", self.env.hostname))
                .map_err(|e| TaskError::unknown(format!("write(/etc/hostname): {}", e)))?;
        }

        nix::unistd::sethostname(&self.env.hostname)
            .map_err(|e| TaskError::from_nix("sethostname()", e))
    }

    fn apply_capabilities(&self) -> Result<()> {
        if !self.env.cred.is_root() {
            // non-root capabilities follow from the uid transition
            return Ok(());
        }

        caps::apply_capability_trim(caps::clamp_to_last_cap(self.env.caps))
    }

    fn drop_privileges(&self) -> Result<()> {
        nix::unistd::setgid(self.env.cred.gid)
            .map_err(|e| TaskError::from_nix("setgid()", e))?;

        if self.verbose {
            for (i, gid) in self.env.group_list.iter().enumerate() {
                debug!("supplementary_group[{}]={}", i, gid);
            }
        }

        nix::unistd::setgroups(&self.env.group_list)
            .map_err(|e| TaskError::from_nix("setgroups()", e))?;

        nix::unistd::setuid(self.env.cred.uid)
            .map_err(|e| TaskError::from_nix("setuid()", e))
    }

    fn exec(&self) -> Result<std::convert::Infallible> {
        let argv = cmdline::expand_command(&self.env.command, &self.env.environ)?;
        let envp = self.env.envp()?;

        if self.verbose {
            debug!("command={}", self.env.command);
            for (i, arg) in argv.iter().enumerate() {
                debug!("argv[{}]={}", i, arg);
            }
            for (i, entry) in self.env.environ.iter().enumerate() {
                debug!("environ[{}]={}", i, entry);
            }
        }

        let argv: Vec<CString> = argv
            .into_iter()
            .map(|arg| {
                CString::new(arg)
                    .map_err(|_| TaskError::invalid_value("argument contains a nul byte"))
            })
            .collect::<Result<_>>()?;

        clear_parent_death_signal();

        let argc = argv.len();
        let filename = argv[0].clone();
        let errno = match nix::unistd::execvpe(&filename, &argv, &envp) {
            Ok(never) => match never {},
            Err(errno) => errno,
        };
        Err(TaskError::new(
            ErrorKind::InvalidValue,
            errno as i32,
            format!(
                "execvpe({}, {}, {})",
                filename.to_string_lossy(),
                argc,
                envp.len()
            ),
        ))
    }
}

/// Put every catchable signal back to its default disposition
fn reset_signal_handlers() {
    for sig in Signal::iterator() {
        if sig == Signal::SIGKILL || sig == Signal::SIGSTOP {
            continue;
        }
        unsafe {
            let _ = signal(sig, SigHandler::SigDfl);
        }
    }
}

/// The parent-death signal installed by the intermediate must not leak
/// into the task
fn clear_parent_death_signal() {
    if let Err(e) = nix::sys::prctl::set_pdeathsig(None::<Signal>) {
        debug!("prctl(PR_SET_PDEATHSIG, 0): {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;

    #[test]
    fn test_reset_signal_handlers_restores_defaults() {
        let _guard = serial_guard();
        let previous = unsafe { signal(Signal::SIGUSR1, SigHandler::SigIgn) }.unwrap();

        reset_signal_handlers();

        let current = unsafe { signal(Signal::SIGUSR1, SigHandler::SigDfl) }.unwrap();
        assert_eq!(current, SigHandler::SigDfl);

        unsafe {
            let _ = signal(Signal::SIGUSR1, previous);
        }
    }

    #[test]
    fn test_clear_parent_death_signal_runs() {
        let _guard = serial_guard();
        nix::sys::prctl::set_pdeathsig(Signal::SIGTERM).unwrap();
        clear_parent_death_signal();
        let current = nix::sys::prctl::get_pdeathsig().unwrap();
        assert_eq!(current, None);
    }
}
