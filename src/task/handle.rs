//! Post-start task handle
//!
//! Tracks one containerized process from the supervisor's side: its PID,
//! whether it is considered running, and the consistency checks used when
//! adopting a task that was started by a previous supervisor instance.

use std::sync::Arc;

use log::{error, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::errors::{ErrorKind, Result, TaskError};
use crate::resources::cgroup::{Cgroup, Subsystem, task_cgroups};
use crate::task::env::TaskEnv;
use crate::utils::{self, ScopedDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Started,
}

/// Supervisor-side representation of a launched (or adopted) task
#[derive(Debug)]
pub struct Task {
    env: Option<Arc<TaskEnv>>,
    pid: libc::pid_t,
    state: TaskState,
    exit_status: i32,
    network_enabled: bool,
    /// Working directory created for the task; removed when the handle
    /// goes away
    cwd_guard: Option<ScopedDir>,
}

impl Task {
    pub(crate) fn started(
        pid: libc::pid_t,
        network_enabled: bool,
        cwd_guard: Option<ScopedDir>,
    ) -> Self {
        Self {
            env: None,
            pid,
            state: TaskState::Started,
            exit_status: 0,
            network_enabled,
            cwd_guard,
        }
    }

    /// Adopt an already-running containerized process. The caller is
    /// expected to follow up with `has_correct_parent` and
    /// `has_correct_freezer` before trusting the handle.
    pub fn restore(pid: libc::pid_t, env: Arc<TaskEnv>, network_enabled: bool) -> Self {
        Self {
            env: Some(env),
            pid,
            state: TaskState::Started,
            exit_status: 0,
            network_enabled,
            cwd_guard: None,
        }
    }

    pub fn get_pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.state == TaskState::Started
    }

    pub fn get_exit_status(&self) -> i32 {
        self.exit_status
    }

    /// Record the task's exit status
    pub fn exit(&mut self, status: i32) {
        self.exit_status = status;
        self.state = TaskState::Stopped;
    }

    /// Drop the environment reference once it is no longer needed
    pub fn clear_env(&mut self) {
        self.env = None;
    }

    /// Send a signal to the task
    pub fn kill(&self, signal: Signal) -> Result<()> {
        if self.pid == 0 {
            return Err(TaskError::invalid_value("kill on a task without a pid"));
        }

        kill(Pid::from_raw(self.pid), signal).map_err(|e| {
            TaskError::new(ErrorKind::Unknown, e as i32, format!("kill({})", self.pid))
        })
    }

    /// True when the process exists but is already a zombie
    pub fn is_zombie(&self) -> bool {
        let Ok(lines) = utils::proc_status_lines(self.pid) else {
            return false;
        };
        lines
            .iter()
            .any(|line| line.strip_prefix("State:\t").is_some_and(|s| s.starts_with('Z')))
    }

    /// Parent PID as reported by `/proc/<pid>/status`
    pub fn get_ppid(&self) -> Result<libc::pid_t> {
        let lines = utils::proc_status_lines(self.pid)?;
        for line in &lines {
            if let Some(value) = line.strip_prefix("PPid:\t") {
                return value
                    .trim()
                    .parse()
                    .map_err(|e| TaskError::unknown(format!("parse PPid: {}", e)));
            }
        }
        warn!("can't parse /proc/{}/status", self.pid);
        Err(TaskError::unknown("can't parse /proc/pid/status"))
    }

    /// An adopted task must still be parented to the supervisor's own
    /// parent; anything else means the PID wrapped or the task was
    /// orphaned.
    pub fn has_correct_parent(&self) -> bool {
        let ppid = match self.get_ppid() {
            Ok(ppid) => ppid,
            Err(e) => {
                warn!("can't get ppid of restored task: {}", e);
                return false;
            }
        };

        let expected = nix::unistd::getppid().as_raw();
        if ppid != expected {
            warn!("invalid ppid of restored task: {} != {}", ppid, expected);
            return false;
        }

        true
    }

    /// An adopted task must sit in the expected freezer leaf. A mismatch
    /// means the PID wrapped or the recorded state is stale, so the
    /// handle is demoted and the stale PID is discarded. Zombies carry no
    /// cgroup information and pass.
    pub fn has_correct_freezer(&mut self) -> bool {
        let cgmap = match task_cgroups(Pid::from_raw(self.pid)) {
            Ok(map) => map,
            Err(e) => {
                warn!("can't read cgroups of restored task {}: {}", self.pid, e);
                return false;
            }
        };

        let Some(expected) = self
            .env
            .as_ref()
            .and_then(|env| env.leaf_cgroups.get("freezer"))
        else {
            return true;
        };

        let actual = cgmap.get("freezer").map(String::as_str).unwrap_or("");
        if expected.relpath() != actual {
            if self.is_zombie() {
                return true;
            }

            warn!(
                "unexpected freezer cgroup of restored task {}: {} != {}",
                self.pid,
                expected.relpath(),
                actual
            );
            self.pid = 0;
            self.state = TaskState::Stopped;
            return false;
        }

        true
    }

    /// Reattach the task to every expected leaf cgroup it drifted out
    /// of. Unknown subsystems are skipped; combined v1 entries are
    /// skipped; with networking disabled a task stuck in a `net_cls`
    /// leaf is parked at that hierarchy's root.
    pub fn fix_cgroups(&self) -> Result<()> {
        if self.is_zombie() {
            return Ok(());
        }

        let Some(env) = &self.env else {
            return Ok(());
        };

        let pid = Pid::from_raw(self.pid);
        let cgmap = task_cgroups(pid)?;

        for (subsystem, path) in &cgmap {
            let Some(expected) = env.leaf_cgroups.get(subsystem) else {
                if subsystem.contains(',') {
                    continue;
                }
                if subsystem == "net_cls" && !self.network_enabled {
                    if path == "/" {
                        continue;
                    }
                    warn!("no network, disabled net_cls:{}", path);
                    let root = Cgroup::root(&Subsystem::new("net_cls"));
                    if let Err(e) = root.attach(pid) {
                        error!("can't reattach to root: {}", e);
                    }
                    continue;
                }
                warn!("skip {}: task belongs to unknown subsystem", subsystem);
                continue;
            };

            if expected.relpath() != *path {
                warn!("fixed invalid task subsystem for {}:{}", subsystem, path);
                if let Err(e) = expected.attach(pid) {
                    error!("can't fix {}: {}", subsystem, e);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_with_freezer(relpath: &str) -> Arc<TaskEnv> {
        let subsys = Subsystem::new("freezer");
        let mut leaf_cgroups = HashMap::new();
        leaf_cgroups.insert("freezer".to_string(), Cgroup::new(&subsys, relpath));
        Arc::new(TaskEnv {
            leaf_cgroups,
            ..Default::default()
        })
    }

    #[test]
    fn test_started_task_is_running() {
        let task = Task::started(42, true, None);
        assert!(task.is_running());
        assert_eq!(task.get_pid(), 42);
        assert_eq!(task.get_exit_status(), 0);
    }

    #[test]
    fn test_exit_records_status_and_stops() {
        let mut task = Task::started(42, true, None);
        task.exit(137);
        assert!(!task.is_running());
        assert_eq!(task.get_exit_status(), 137);
    }

    #[test]
    fn test_kill_without_pid_is_invalid() {
        let task = Task::started(0, true, None);
        let err = task.kill(Signal::SIGTERM).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn test_kill_with_signal_zero_probes_self() {
        let task = Task::started(unsafe { libc::getpid() }, true, None);
        // signal 0 is a liveness probe; nix models it as None, so use
        // SIGCONT which is harmless for a running test process
        assert!(task.kill(Signal::SIGCONT).is_ok());
    }

    #[test]
    fn test_self_is_not_zombie() {
        let task = Task::started(unsafe { libc::getpid() }, true, None);
        assert!(!task.is_zombie());
    }

    #[test]
    fn test_missing_pid_is_not_zombie() {
        // pid 0 has no /proc entry
        let task = Task::started(0, true, None);
        assert!(!task.is_zombie());
    }

    #[test]
    fn test_get_ppid_of_self_matches() {
        let task = Task::started(unsafe { libc::getpid() }, true, None);
        let ppid = task.get_ppid().unwrap();
        assert_eq!(ppid, nix::unistd::getppid().as_raw());
    }

    #[test]
    fn test_restored_self_has_wrong_parent() {
        // our own ppid differs from our grandparent, so adopting
        // ourselves must be rejected
        let env = Arc::new(TaskEnv::default());
        let task = Task::restore(unsafe { libc::getpid() }, env, true);
        assert!(!task.has_correct_parent());
    }

    #[test]
    fn test_freezer_check_passes_without_expected_leaf() {
        let env = Arc::new(TaskEnv::default());
        let mut task = Task::restore(unsafe { libc::getpid() }, env, true);
        assert!(task.has_correct_freezer());
        assert!(task.is_running());
    }

    #[test]
    fn test_freezer_mismatch_demotes_and_clears_pid() {
        let env = env_with_freezer("/tasks/expected");
        let mut task = Task::restore(unsafe { libc::getpid() }, env, true);
        // the test process is not in /tasks/expected
        assert!(!task.has_correct_freezer());
        assert!(!task.is_running());
        assert_eq!(task.get_pid(), 0);
    }

    #[test]
    fn test_fix_cgroups_without_env_is_noop() {
        let task = Task::started(unsafe { libc::getpid() }, true, None);
        assert!(task.fix_cgroups().is_ok());
    }

    #[test]
    fn test_clear_env_drops_reference() {
        let env = Arc::new(TaskEnv::default());
        let mut task = Task::restore(1, Arc::clone(&env), true);
        assert_eq!(Arc::strong_count(&env), 2);
        task.clear_env();
        assert_eq!(Arc::strong_count(&env), 1);
    }
}
