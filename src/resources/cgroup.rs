//! Cgroup subsystem abstraction
//!
//! Tasks are attached to one leaf cgroup per subsystem hierarchy. The
//! intermediate process attaches itself before cloning the grandchild so
//! membership is inherited, and the supervisor later verifies and repairs
//! membership through `/proc/<pid>/cgroup`.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::unistd::Pid;

use crate::errors::{Result, TaskError};

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

fn hierarchy_root() -> PathBuf {
    std::env::var("TASKBOX_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(CGROUP_ROOT))
}

/// One mounted cgroup hierarchy (freezer, cpu, memory, ...)
#[derive(Debug)]
pub struct Subsystem {
    name: String,
    root: PathBuf,
}

impl Subsystem {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            root: hierarchy_root().join(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A cgroup inside one subsystem hierarchy
#[derive(Debug, Clone)]
pub struct Cgroup {
    subsystem: Arc<Subsystem>,
    relpath: PathBuf,
}

impl Cgroup {
    /// A leaf cgroup at `relpath` inside a hierarchy
    pub fn new(subsystem: &Arc<Subsystem>, relpath: impl AsRef<Path>) -> Self {
        let relpath = relpath.as_ref();
        let relpath = if relpath.is_absolute() {
            relpath.to_path_buf()
        } else {
            Path::new("/").join(relpath)
        };
        Self {
            subsystem: Arc::clone(subsystem),
            relpath,
        }
    }

    /// The hierarchy root, used to park tasks that must not stay in a
    /// leaf
    pub fn root(subsystem: &Arc<Subsystem>) -> Self {
        Self {
            subsystem: Arc::clone(subsystem),
            relpath: PathBuf::from("/"),
        }
    }

    /// Hierarchy-relative path as reported by `/proc/<pid>/cgroup`
    pub fn relpath(&self) -> String {
        self.relpath.to_string_lossy().into_owned()
    }

    pub fn subsystem(&self) -> &Arc<Subsystem> {
        &self.subsystem
    }

    fn dir(&self) -> PathBuf {
        let rel = self.relpath.strip_prefix("/").unwrap_or(&self.relpath);
        self.subsystem.root.join(rel)
    }

    /// Move `pid` into this cgroup
    pub fn attach(&self, pid: Pid) -> Result<()> {
        let procs = self.dir().join("cgroup.procs");
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&procs)
            .map_err(|e| TaskError::unknown(format!("open {}: {}", procs.display(), e)))?;
        write!(file, "{}", pid.as_raw())
            .map_err(|e| TaskError::unknown(format!("write {}: {}", procs.display(), e)))?;
        Ok(())
    }
}

/// Parse `/proc/<pid>/cgroup` into a subsystem name to hierarchy-relative
/// path map. Controller lists are kept verbatim, so combined v1 entries
/// (`cpu,cpuacct` or `name=systemd`) appear under their combined name and
/// can be recognized and skipped during fixup.
pub fn task_cgroups(pid: Pid) -> Result<HashMap<String, String>> {
    let path = format!("/proc/{}/cgroup", pid.as_raw());
    let content = fs::read_to_string(&path)
        .map_err(|e| TaskError::unknown(format!("read {}: {}", path, e)))?;
    Ok(parse_cgroup_file(&content))
}

fn parse_cgroup_file(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        // hierarchy-id:controller-list:path
        let mut fields = line.splitn(3, ':');
        let (Some(_id), Some(controllers), Some(path)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if controllers.is_empty() {
            continue;
        }
        map.insert(controllers.to_string(), path.to_string());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use tempfile::tempdir;

    #[test]
    fn test_relpath_is_rooted() {
        let subsys = Subsystem::new("freezer");
        assert_eq!(Cgroup::new(&subsys, "tasks/t1").relpath(), "/tasks/t1");
        assert_eq!(Cgroup::new(&subsys, "/tasks/t1").relpath(), "/tasks/t1");
        assert_eq!(Cgroup::root(&subsys).relpath(), "/");
    }

    #[test]
    fn test_attach_writes_cgroup_procs() {
        let _guard = serial_guard();
        let tmp = tempdir().unwrap();
        unsafe { std::env::set_var("TASKBOX_CGROUP_ROOT", tmp.path()) };
        let leaf_dir = tmp.path().join("freezer/tasks/t1");
        fs::create_dir_all(&leaf_dir).unwrap();
        fs::write(leaf_dir.join("cgroup.procs"), "").unwrap();

        let subsys = Subsystem::new("freezer");
        let leaf = Cgroup::new(&subsys, "tasks/t1");
        leaf.attach(Pid::from_raw(1234)).unwrap();

        let written = fs::read_to_string(leaf_dir.join("cgroup.procs")).unwrap();
        assert_eq!(written, "1234");
        unsafe { std::env::remove_var("TASKBOX_CGROUP_ROOT") };
    }

    #[test]
    fn test_parse_cgroup_file_v1_entries() {
        let content = "11:freezer:/tasks/t1\n\
                       10:cpu,cpuacct:/tasks/t1\n\
                       9:net_cls:/\n\
                       1:name=systemd:/init.scope\n";
        let map = parse_cgroup_file(content);
        assert_eq!(map["freezer"], "/tasks/t1");
        assert_eq!(map["cpu,cpuacct"], "/tasks/t1");
        assert_eq!(map["net_cls"], "/");
        assert_eq!(map["name=systemd"], "/init.scope");
    }

    #[test]
    fn test_parse_cgroup_file_skips_malformed_lines() {
        let map = parse_cgroup_file("nonsense\n::\n5:freezer:/x\n");
        assert_eq!(map.len(), 1);
        assert_eq!(map["freezer"], "/x");
    }

    #[test]
    fn test_task_cgroups_for_self() {
        // v2-only hosts expose a single line with no controller names,
        // which parses to an empty map; every recorded path is rooted
        let map = task_cgroups(nix::unistd::getpid()).unwrap();
        assert!(map.values().all(|path| path.starts_with('/')));
    }
}
