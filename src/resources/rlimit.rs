//! setrlimit application inside the grandchild

use std::collections::BTreeMap;

use crate::errors::{ErrorKind, Result, TaskError};

/// Resource limits keyed by the kernel resource id (`RLIMIT_*`), each
/// carrying a (soft, hard) pair. Applied in the grandchild before any
/// other setup so later stages run inside the limits.
#[derive(Debug, Clone, Default)]
pub struct RlimitMap {
    limits: BTreeMap<u32, (u64, u64)>,
}

impl RlimitMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a (soft, hard) pair for `resource`
    pub fn set(&mut self, resource: u32, soft: u64, hard: u64) {
        self.limits.insert(resource, (soft, hard));
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    /// Apply every recorded limit to the current process
    pub fn apply(&self) -> Result<()> {
        for (&resource, &(soft, hard)) in &self.limits {
            let rlim = libc::rlimit {
                rlim_cur: soft,
                rlim_max: hard,
            };
            let ret = unsafe { libc::setrlimit(resource as libc::__rlimit_resource_t, &rlim) };
            if ret != 0 {
                return Err(TaskError::from_errno(
                    ErrorKind::Unknown,
                    format!("setrlimit({}, {}:{})", resource, soft, hard),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_map_applies() {
        assert!(RlimitMap::new().apply().is_ok());
    }

    #[test]
    fn test_set_records_pairs() {
        let mut map = RlimitMap::new();
        map.set(libc::RLIMIT_NOFILE as u32, 64, 128);
        map.set(libc::RLIMIT_FSIZE as u32, 1 << 20, 1 << 20);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn apply_reports_resource_and_values_on_failure() {
        // soft > hard is rejected by the kernel with EINVAL
        let mut map = RlimitMap::new();
        map.set(libc::RLIMIT_NOFILE as u32, 1024, 16);
        let err = map.apply().unwrap_err();
        assert_eq!(err.errno, libc::EINVAL);
        assert!(err.message.contains("1024:16"));
    }

    #[test]
    fn apply_lowers_soft_limit() {
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut current) };
        assert_eq!(ret, 0);

        let mut map = RlimitMap::new();
        map.set(
            libc::RLIMIT_NOFILE as u32,
            current.rlim_cur.min(256),
            current.rlim_max,
        );
        assert!(map.apply().is_ok());
    }
}
