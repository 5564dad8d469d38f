//! Immutable task description consumed by the launcher
//!
//! A `TaskEnv` is prepared once in the supervisor (credential resolution
//! and supplementary-group lookup happen there, in the supervisor's
//! namespaces) and is then shared read-only with the intermediate process
//! across fork.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::PathBuf;

use nix::unistd::{Gid, Group, Uid, User};

use crate::errors::{ErrorKind, Result, TaskError};
use crate::isolation::namespace::{NamespaceFd, NamespaceSnapshot};
use crate::network::{GwVec, IpVec, NetCfg};
use crate::resources::cgroup::Cgroup;
use crate::resources::rlimit::RlimitMap;
use crate::spawn::cmdline;
use crate::storage::BindMap;

/// Resolved task credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub uid: Uid,
    pub gid: Gid,
}

impl Default for Cred {
    fn default() -> Self {
        Self {
            uid: Uid::from_raw(0),
            gid: Gid::from_raw(0),
        }
    }
}

impl Cred {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(gid),
        }
    }

    pub fn is_root(&self) -> bool {
        self.uid.is_root()
    }
}

/// Declarative description of a containerized process
#[derive(Debug)]
pub struct TaskEnv {
    /// Shell-like command line, word-expanded in the grandchild with
    /// command substitution disabled
    pub command: String,
    pub cwd: PathBuf,
    /// Create `cwd` on demand; the created directory lives and dies with
    /// the task handle
    pub create_cwd: bool,
    /// `/` means no root change
    pub root: PathBuf,
    pub root_rdonly: bool,
    pub user: String,
    pub group: String,
    /// Ordered `KEY=VALUE` entries; duplicates allowed, last wins
    pub environ: Vec<String>,
    /// New PID and IPC namespaces
    pub isolate: bool,
    pub stdin_path: PathBuf,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    /// Namespaces to enter before the grandchild is cloned
    pub parent_ns: NamespaceSnapshot,
    /// Mount namespace of the caller, entered so path lookups see the
    /// caller's view
    pub client_mnt_ns: NamespaceFd,
    pub rlimits: RlimitMap,
    /// Non-empty requests a new UTS namespace
    pub hostname: String,
    pub bind_dns: bool,
    pub bind_map: Vec<BindMap>,
    pub net_cfg: NetCfg,
    /// Backing file mounted as the root ext4 image via `loop_dev`
    pub loop_image: Option<PathBuf>,
    pub loop_dev: i32,
    /// Bitmap of capabilities the task keeps
    pub caps: u64,
    pub gw_vec: Vec<GwVec>,
    pub ip_vec: Vec<IpVec>,
    pub new_mount_ns: bool,
    /// Per-subsystem leaf cgroups the task is attached to
    pub leaf_cgroups: HashMap<String, Cgroup>,
    /// Supplementary groups, computed by `prepare`
    pub group_list: Vec<Gid>,
    pub cred: Cred,
}

impl Default for TaskEnv {
    fn default() -> Self {
        Self {
            command: String::new(),
            cwd: PathBuf::from("/"),
            create_cwd: false,
            root: PathBuf::from("/"),
            root_rdonly: false,
            user: String::new(),
            group: String::new(),
            environ: Vec::new(),
            isolate: false,
            stdin_path: PathBuf::from("/dev/null"),
            stdout_path: PathBuf::from("/dev/null"),
            stderr_path: PathBuf::from("/dev/null"),
            parent_ns: NamespaceSnapshot::default(),
            client_mnt_ns: NamespaceFd::default(),
            rlimits: RlimitMap::default(),
            hostname: String::new(),
            bind_dns: false,
            bind_map: Vec::new(),
            net_cfg: NetCfg::host(),
            loop_image: None,
            loop_dev: 0,
            caps: 0,
            gw_vec: Vec::new(),
            ip_vec: Vec::new(),
            new_mount_ns: false,
            leaf_cgroups: HashMap::new(),
            group_list: Vec::new(),
            cred: Cred::default(),
        }
    }
}

impl TaskEnv {
    /// Resolve credentials and the supplementary group list. Runs in the
    /// supervisor so name-service lookups see the supervisor's view.
    pub fn prepare(&mut self) -> Result<()> {
        if self.command.is_empty() {
            return Ok(());
        }

        if !self.user.is_empty() {
            let user = User::from_name(&self.user)
                .map_err(|e| TaskError::from_nix(format!("getpwnam({})", self.user), e))?
                .ok_or_else(|| {
                    TaskError::invalid_value(format!("unknown user: {}", self.user))
                })?;
            self.cred.uid = user.uid;
            self.cred.gid = user.gid;
        }

        if !self.group.is_empty() {
            let group = Group::from_name(&self.group)
                .map_err(|e| TaskError::from_nix(format!("getgrnam({})", self.group), e))?
                .ok_or_else(|| {
                    TaskError::invalid_value(format!("unknown group: {}", self.group))
                })?;
            self.cred.gid = group.gid;
        }

        self.group_list = self.get_group_list()?;
        Ok(())
    }

    /// Supplementary groups for the task user. Tasks without a symbolic
    /// user keep only their primary group.
    fn get_group_list(&self) -> Result<Vec<Gid>> {
        if self.user.is_empty() {
            return Ok(vec![self.cred.gid]);
        }

        let user = CString::new(self.user.as_str())
            .map_err(|_| TaskError::invalid_value("user name contains a nul byte"))?;
        nix::unistd::getgrouplist(&user, self.cred.gid).map_err(|e| {
            TaskError::new(
                ErrorKind::Unknown,
                e as i32,
                "can't get supplementary group list",
            )
        })
    }

    /// True when the environment defines `key` (with or without a value)
    pub fn env_has_key(&self, key: &str) -> bool {
        cmdline::environ_lookup(&self.environ, key).is_some()
    }

    /// Environment as `KEY=VALUE` CStrings for execvpe
    pub fn envp(&self) -> Result<Vec<CString>> {
        self.environ
            .iter()
            .map(|entry| {
                CString::new(entry.as_str()).map_err(|_| {
                    TaskError::invalid_value(format!("environment entry contains nul: {:?}", entry))
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_env_is_host_rooted() {
        let env = TaskEnv::default();
        assert_eq!(env.root, PathBuf::from("/"));
        assert!(!env.isolate);
        assert!(env.cred.is_root());
    }

    #[test]
    fn test_prepare_without_command_is_noop() {
        let mut env = TaskEnv::default();
        env.user = "no-such-user-zzz".to_string();
        // empty command short-circuits before any lookup
        assert!(env.prepare().is_ok());
    }

    #[test]
    fn test_prepare_unknown_user_fails() {
        let mut env = TaskEnv {
            command: "/bin/true".to_string(),
            user: "no-such-user-zzz".to_string(),
            ..Default::default()
        };
        let err = env.prepare().unwrap_err();
        assert!(err.message.contains("no-such-user-zzz"));
    }

    #[test]
    fn test_prepare_resolves_root_user() {
        let mut env = TaskEnv {
            command: "/bin/true".to_string(),
            user: "root".to_string(),
            ..Default::default()
        };
        env.prepare().unwrap();
        assert!(env.cred.is_root());
        assert!(!env.group_list.is_empty());
        assert!(env.group_list.contains(&env.cred.gid));
    }

    #[test]
    fn test_prepare_without_user_keeps_numeric_cred() {
        let mut env = TaskEnv {
            command: "/bin/true".to_string(),
            cred: Cred::new(1234, 5678),
            ..Default::default()
        };
        env.prepare().unwrap();
        assert_eq!(env.cred, Cred::new(1234, 5678));
        assert_eq!(env.group_list, vec![Gid::from_raw(5678)]);
    }

    #[test]
    fn test_env_has_key() {
        let env = TaskEnv {
            environ: vec!["PATH=/bin".to_string(), "TERM".to_string()],
            ..Default::default()
        };
        assert!(env.env_has_key("PATH"));
        assert!(env.env_has_key("TERM"));
        assert!(!env.env_has_key("HOME"));
    }

    #[test]
    fn test_envp_conversion() {
        let env = TaskEnv {
            environ: vec!["A=1".to_string(), "B=2".to_string()],
            ..Default::default()
        };
        let envp = env.envp().unwrap();
        assert_eq!(envp.len(), 2);
        assert_eq!(envp[0].to_str().unwrap(), "A=1");
    }
}
