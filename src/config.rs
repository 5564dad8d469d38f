//! Launcher configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, TaskError};

/// Configuration consumed by the launcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Perform host-side netlink setup for started tasks. When disabled,
    /// tasks found attached to a non-root `net_cls` cgroup are moved back
    /// to its root during cgroup fixup.
    pub network_enabled: bool,
    /// Scratch area for task working directories created on demand;
    /// directories created here are removed with the task handle.
    pub tmp_dir: PathBuf,
    /// Log command expansion and supplementary groups at debug level
    pub verbose: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            network_enabled: true,
            tmp_dir: PathBuf::from("/var/tmp/taskbox"),
            verbose: false,
        }
    }
}

impl LauncherConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.tmp_dir.is_absolute() {
            return Err(TaskError::invalid_value(format!(
                "tmp_dir must be absolute: {}",
                self.tmp_dir.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_is_valid() {
        let config = LauncherConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.network_enabled);
    }

    #[test]
    fn test_relative_tmp_dir_rejected() {
        let config = LauncherConfig {
            tmp_dir: PathBuf::from("scratch"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
