//! taskbox: containerized task launcher
//!
//! Creates isolated Linux processes from declarative task descriptions:
//! a two-stage fork + clone keeps container reaping away from the
//! supervisor, while the cloned child builds its namespaces, root
//! filesystem, network, capabilities and credentials in kernel-mandated
//! order before exec.
//!
//! # Modules
//!
//! - **spawn**: launcher orchestration, the two spawn-time pipes, the
//!   intermediate and grandchild stages
//! - **task**: task descriptions and post-start handles
//! - **isolation**: namespace handles and capability policy
//! - **storage**: root-filesystem construction and loop images
//! - **network**: interface placement and in-namespace addressing
//! - **resources**: cgroup membership and rlimits
//!
//! # Example
//!
//! ```ignore
//! use taskbox::{Launcher, LauncherConfig, TaskEnv};
//!
//! let launcher = Launcher::new(LauncherConfig::default())?;
//! let mut task = launcher.start(TaskEnv {
//!     command: "/bin/true".to_string(),
//!     ..Default::default()
//! })?;
//! println!("started pid {}", task.get_pid());
//! ```

// Core modules
pub mod config;
pub mod errors;
pub mod utils;

// Layered modules
pub mod isolation;
pub mod network;
pub mod resources;
pub mod spawn;
pub mod storage;
pub mod task;

// Public API
pub use config::LauncherConfig;
pub use errors::{ErrorKind, Result, TaskError};
pub use isolation::{NamespaceFd, NamespaceSnapshot};
pub use network::{NetCfg, NetLink};
pub use resources::{Cgroup, RlimitMap, Subsystem};
pub use spawn::Launcher;
pub use storage::BindMap;
pub use task::{Cred, Task, TaskEnv, TaskState};
