//! Task layer: the immutable launch description and the live handle

pub mod env;
pub mod handle;

pub use env::{Cred, TaskEnv};
pub use handle::{Task, TaskState};
