//! Spawn layer: two-stage task launch
//!
//! A launch involves three processes. The supervisor forks an
//! intermediate, which attaches itself to the task's cgroups, enters the
//! requested namespaces and clones the grandchild; the grandchild builds
//! its filesystem and credentials and execs the task command. The
//! intermediate exits as soon as setup is done, reparenting the
//! grandchild to the supervisor's own parent, so the supervisor never
//! reaps containers.
//!
//! The supervisor learns the outcome through the spawn pipe: one PID
//! word, then an error record if anything failed before exec.

pub mod child;
pub mod cmdline;
pub mod intermediate;
pub mod pipe;

use std::sync::Arc;

use log::{debug, error, warn};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

use crate::config::LauncherConfig;
use crate::errors::{ErrorKind, Result, TaskError};
use crate::isolation::caps;
use crate::spawn::intermediate::IntermediateStage;
use crate::spawn::pipe::SpawnPipe;
use crate::task::env::TaskEnv;
use crate::task::handle::Task;
use crate::utils::ScopedDir;

/// Creates containerized processes from task descriptions
#[derive(Debug)]
pub struct Launcher {
    config: LauncherConfig,
}

impl Launcher {
    /// Build a launcher. Reads the kernel capability bound once; a
    /// kernel that reports none refuses construction.
    pub fn new(config: LauncherConfig) -> Result<Self> {
        config.validate()?;
        caps::init_last_cap()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Start a task. On success the returned handle is `Started` and
    /// exposes the grandchild's supervisor-visible PID.
    pub fn start(&self, mut env: TaskEnv) -> Result<Task> {
        env.prepare()?;

        let cwd_guard = if env.create_cwd {
            match self.create_cwd(&env) {
                Ok(guard) => Some(guard),
                Err(error) => {
                    // the cwd creator signals exhaustion itself; don't
                    // double-log it
                    if !error.is_no_space() {
                        error!("can't create temporary cwd: {}", error);
                    }
                    return Err(error);
                }
            }
        } else {
            None
        };

        let env = Arc::new(env);
        let mut spawn_pipe = SpawnPipe::new().map_err(|e| {
            error!("can't create communication pipe for child: {}", e);
            e
        })?;

        // Double step (fork + clone): the grandchild must be parented to
        // the supervisor's own parent, not to the supervisor.
        let fork_pid = match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => {
                spawn_pipe.close_read();
                IntermediateStage::new(Arc::clone(&env), self.config.clone(), spawn_pipe).run()
            }
            Err(errno) => {
                let error = TaskError::from_nix("fork()", errno);
                error!("can't spawn intermediate: {}", error);
                return Err(error);
            }
        };

        spawn_pipe.close_write();
        let status = self.wait_intermediate(fork_pid);

        let pid = spawn_pipe.read_pid()?;
        let reported = spawn_pipe.read_error();
        drop(spawn_pipe);

        let error = match reported {
            Ok(maybe_error) => maybe_error,
            Err(error) => Some(error),
        };

        if error.is_some() || status != 0 || pid <= 0 {
            if pid > 0 {
                debug!("kill partly constructed task {}", pid);
                if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                    warn!("kill partly constructed task {}: {}", pid, e);
                }
            }

            return Err(error.unwrap_or_else(|| {
                TaskError::new(
                    ErrorKind::InvalidValue,
                    0,
                    format!(
                        "task could not be started (intermediate exited with {})",
                        status
                    ),
                )
            }));
        }

        // the handle owns everything the running task still needs
        Ok(Task::started(pid, self.config.network_enabled, cwd_guard))
    }

    /// Adopt an already-running containerized process by PID. The handle
    /// keeps the environment so freezer and cgroup checks can run.
    pub fn restore(&self, pid: libc::pid_t, env: Arc<TaskEnv>) -> Task {
        Task::restore(pid, env, self.config.network_enabled)
    }

    fn create_cwd(&self, env: &TaskEnv) -> Result<ScopedDir> {
        let cleanup = env.cwd.starts_with(&self.config.tmp_dir);
        ScopedDir::create(&env.cwd, env.cred.uid, env.cred.gid, cleanup)
    }

    /// Reap the intermediate. This never blocks on the grandchild, which
    /// was reparented to the supervisor's parent by design.
    fn wait_intermediate(&self, pid: Pid) -> i32 {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => code,
            Ok(WaitStatus::Signaled(_, signal, _)) => 128 + signal as i32,
            Ok(other) => {
                warn!("unexpected intermediate wait status: {:?}", other);
                -1
            }
            Err(e) => {
                warn!("waitpid(intermediate): {}", e);
                let _ = kill(pid, Signal::SIGKILL);
                -1
            }
        }
    }
}
