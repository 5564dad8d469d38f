//! Intermediate process stage
//!
//! The forked middle process exists for two reasons: the grandchild must
//! be reparented away from the supervisor (so the supervisor never reaps
//! containers), and somebody with the grandchild's PID in hand has to do
//! the host-side work that cannot happen inside the new namespaces:
//! cgroup attachment before clone, netlink interface placement after.

use std::ffi::CString;
use std::sync::Arc;

use log::{debug, error, info};
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::unistd::{Pid, setsid};

use crate::config::LauncherConfig;
use crate::errors::{ErrorKind, Result, TaskError};
use crate::network::{NetLink, generate_hw};
use crate::spawn::child::ChildStage;
use crate::spawn::pipe::{SpawnPipe, SyncPipe};
use crate::task::env::TaskEnv;
use crate::utils;

pub const INTERMEDIATE_PROCESS_NAME: &std::ffi::CStr = c"taskbox-spawn-p";

/// Work done in the forked middle process
pub struct IntermediateStage {
    env: Arc<TaskEnv>,
    config: LauncherConfig,
    spawn_pipe: SpawnPipe,
}

impl IntermediateStage {
    pub fn new(env: Arc<TaskEnv>, config: LauncherConfig, spawn_pipe: SpawnPipe) -> Self {
        Self {
            env,
            config,
            spawn_pipe,
        }
    }

    /// Entry point after fork. Never returns; the PID word is written in
    /// every path, -1 when clone never happened.
    pub fn run(mut self) -> ! {
        if let Err(e) = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL) {
            debug!("prctl(PR_SET_PDEATHSIG): {}", e);
        }
        if let Err(e) = nix::sys::prctl::set_name(INTERMEDIATE_PROCESS_NAME) {
            debug!("prctl(PR_SET_NAME): {}", e);
        }
        let _ = setsid();

        if let Err(error) = self.prepare() {
            self.spawn_pipe.report_pid(-1);
            self.abort(&error);
        }

        let mut sync_pipe = match SyncPipe::new() {
            Ok(pipe) => pipe,
            Err(error) => {
                error!("can't create sync pipe for child: {}", error);
                self.spawn_pipe.report_pid(-1);
                self.abort(&error);
            }
        };

        let child_pid = match self.clone_child(&mut sync_pipe) {
            Ok(pid) => {
                sync_pipe.close_read();
                self.spawn_pipe.report_pid(pid.as_raw());
                pid
            }
            Err(error) => {
                sync_pipe.close_read();
                self.spawn_pipe.report_pid(-1);
                error!("can't spawn child: {}", error);
                self.abort(&error);
            }
        };

        if self.config.network_enabled
            && let Err(error) = self.isolate_net(child_pid)
        {
            error!("can't isolate child network: {}", error);
            self.abort(&error);
        }

        if let Err(error) = sync_pipe.signal() {
            error!("can't spawn child: {}", error);
            self.abort(&error);
        }

        unsafe { libc::_exit(libc::EXIT_SUCCESS) }
    }

    fn abort(&self, error: &TaskError) -> ! {
        if let Err(e) = self.spawn_pipe.send_error(error) {
            error!("can't report intermediate error: {}", e);
        }
        std::process::exit(libc::EXIT_FAILURE);
    }

    /// Everything that must happen before clone: cgroup attachment (so
    /// the grandchild inherits membership), the client's mount namespace
    /// for path lookups, stdio, and the parent namespaces.
    fn prepare(&mut self) -> Result<()> {
        let self_pid = nix::unistd::getpid();
        for cgroup in self.env.leaf_cgroups.values() {
            cgroup.attach(self_pid).map_err(|e| {
                error!("can't attach to cgroup: {}", e);
                e
            })?;
        }

        self.env
            .client_mnt_ns
            .set_ns(CloneFlags::CLONE_NEWNS)
            .map_err(|e| {
                error!("can't move task to client mount namespace: {}", e);
                e
            })?;

        self.reopen_stdio()?;

        self.env.parent_ns.enter().map_err(|e| {
            error!("cannot enter namespaces: {}", e);
            e
        })?;

        Ok(())
    }

    /// Put fds 0/1/2 on the requested paths. The fd numbers must come
    /// out exactly; anything else means an fd leaked into the launch.
    fn reopen_stdio(&self) -> Result<()> {
        let keep: Vec<_> = self.spawn_pipe.write_fd().into_iter().collect();
        utils::close_fds_from(0, &keep);

        self.open_std_file(&self.env.stdin_path, 0, false)?;
        self.open_std_file(&self.env.stdout_path, 1, true)?;
        self.open_std_file(&self.env.stderr_path, 2, true)?;
        Ok(())
    }

    fn open_std_file(&self, path: &std::path::Path, expected: i32, writable: bool) -> Result<()> {
        let path_c = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| TaskError::invalid_value("stdio path contains a nul byte"))?;
        let flags = if writable {
            libc::O_CREAT | libc::O_WRONLY | libc::O_APPEND
        } else {
            libc::O_CREAT | libc::O_RDONLY
        };

        let fd = unsafe { libc::open(path_c.as_ptr(), flags, 0o660 as libc::c_uint) };
        if fd < 0 {
            return Err(TaskError::from_errno(
                ErrorKind::InvalidValue,
                format!("open({}) -> {}", path.display(), expected),
            ));
        }

        if fd != expected {
            return Err(TaskError::new(
                ErrorKind::Unknown,
                libc::EINVAL,
                format!(
                    "open({}) -> {}: unexpected fd {}",
                    path.display(),
                    expected,
                    fd
                ),
            ));
        }

        if writable {
            let ret = unsafe {
                libc::fchown(fd, self.env.cred.uid.as_raw(), self.env.cred.gid.as_raw())
            };
            if ret < 0 {
                return Err(TaskError::from_errno(
                    ErrorKind::Unknown,
                    format!("fchown({}) -> {}", path.display(), expected),
                ));
            }
        }

        Ok(())
    }

    /// The namespaces requested for the grandchild
    fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.env.isolate {
            flags |= CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;
        }
        if self.env.new_mount_ns {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if !self.env.hostname.is_empty() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.env.net_cfg.new_net_ns {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        flags
    }

    fn clone_child(&mut self, sync_pipe: &mut SyncPipe) -> Result<Pid> {
        let flags = self.clone_flags();
        let mut stack = vec![0u8; 2 * 1024 * 1024];

        let env = Arc::clone(&self.env);
        let verbose = self.config.verbose;
        let spawn_pipe = &mut self.spawn_pipe;
        let result = unsafe {
            nix::sched::clone(
                Box::new(|| {
                    ChildStage::new(&env, &mut *spawn_pipe, &mut *sync_pipe, verbose).run()
                }),
                &mut stack,
                flags,
                Some(Signal::SIGCHLD as libc::c_int),
            )
        };

        result.map_err(|errno| {
            let kind = if errno == nix::errno::Errno::ENOMEM {
                ErrorKind::ResourceNotAvailable
            } else {
                ErrorKind::Unknown
            };
            TaskError::new(kind, errno as i32, "clone()")
        })
    }

    /// Host-side interface placement, keyed by the grandchild's PID
    fn isolate_net(&self, child_pid: Pid) -> Result<()> {
        let cfg = &self.env.net_cfg;
        if cfg.host_iface.is_empty()
            && cfg.ip_vlan.is_empty()
            && cfg.mac_vlan.is_empty()
            && cfg.veth.is_empty()
        {
            return Ok(());
        }

        let nl = NetLink::connect()?;
        let pid = child_pid.as_raw();
        let tid = nix::unistd::gettid();

        for host in &cfg.host_iface {
            let index = nl.link_index(&host.dev)?;
            nl.change_ns(index, &host.dev, pid)?;
        }

        for ipvlan in &cfg.ip_vlan {
            let transient = format!("piv{}", tid);
            let _ = nl.remove(&transient);

            nl.add_ip_vlan(&transient, &ipvlan.master, &ipvlan.mode, ipvlan.mtu)?;

            let index = nl.link_index(&transient)?;
            if let Err(error) = nl.change_ns(index, &ipvlan.name, pid) {
                let _ = nl.remove(&transient);
                return Err(error);
            }
        }

        for mvlan in &cfg.mac_vlan {
            let transient = format!("pmv{}", tid);
            let _ = nl.remove(&transient);

            let hw = if mvlan.hw.is_empty() {
                generate_hw(&self.env.hostname, &format!("{}{}", mvlan.master, mvlan.name))
            } else {
                mvlan.hw.clone()
            };
            info!("using {} for {}@{}", hw, mvlan.name, mvlan.master);

            nl.add_mac_vlan(&transient, &mvlan.master, &mvlan.mode, &hw, mvlan.mtu)?;

            let index = nl.link_index(&transient)?;
            if let Err(error) = nl.change_ns(index, &mvlan.name, pid) {
                let _ = nl.remove(&transient);
                return Err(error);
            }
        }

        for veth in &cfg.veth {
            let bridge_index = nl.link_index(&veth.bridge)?;

            let hw = if veth.hw.is_empty() {
                generate_hw(&self.env.hostname, &format!("{}{}", veth.name, veth.peer))
            } else {
                veth.hw.clone()
            };
            debug!("using {} for {} -> {}", hw, veth.name, veth.peer);

            nl.add_veth(&veth.name, &veth.peer, &hw, veth.mtu, bridge_index, pid)?;
        }

        Ok(())
    }
}
