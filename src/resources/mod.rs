//! Resources layer: cgroup membership and rlimits

pub mod cgroup;
pub mod rlimit;

pub use cgroup::{Cgroup, Subsystem};
pub use rlimit::RlimitMap;
