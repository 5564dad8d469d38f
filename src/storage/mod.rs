//! Storage layer: root-filesystem construction for containerized tasks
//!
//! A task with its own root gets a private filesystem tree built in a
//! fixed order before the process pivots into it. The order matters: each
//! step assumes the mount state produced by the previous one.

pub mod loopdev;
pub mod rootfs;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use loopdev::LoopMount;
pub use rootfs::RootFs;

/// One bind mount requested for the task's root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindMap {
    pub source: PathBuf,
    /// Resolved against the task root, or against the working directory
    /// when relative
    pub dest: PathBuf,
    pub rdonly: bool,
}
