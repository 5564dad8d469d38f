//! Capability trim for root-credential tasks
//!
//! Tasks keeping root credentials get their capability surface cut down
//! to an explicit bitmap: the bounding set loses every bit outside the
//! bitmap, the inheritable set becomes exactly the bitmap. Non-root tasks
//! are left alone, their capabilities follow from the uid transition.

use std::fs;
use std::sync::OnceLock;

use caps::{CapSet, Capability, CapsHashSet};
use log::debug;

use crate::errors::{Result, TaskError};

static LAST_CAP: OnceLock<u32> = OnceLock::new();

/// Read the kernel's highest capability bit once. Must run before the
/// first launch; fails if the kernel reports zero.
pub fn init_last_cap() -> Result<u32> {
    if let Some(&cached) = LAST_CAP.get() {
        return Ok(cached);
    }

    let content = fs::read_to_string("/proc/sys/kernel/cap_last_cap")
        .map_err(|e| TaskError::unknown(format!("read cap_last_cap: {}", e)))?;
    let value: u32 = content
        .trim()
        .parse()
        .map_err(|e| TaskError::unknown(format!("parse cap_last_cap: {}", e)))?;
    if value == 0 {
        return Err(TaskError::invalid_value("kernel reports cap_last_cap = 0"));
    }

    Ok(*LAST_CAP.get_or_init(|| value))
}

/// The cached bound, zero when `init_last_cap` has not run
pub fn last_cap() -> u32 {
    LAST_CAP.get().copied().unwrap_or(0)
}

/// The subset of `bitmap` the running kernel can represent
pub fn clamp_to_last_cap(bitmap: u64) -> u64 {
    let bound = last_cap();
    if bound >= 63 {
        bitmap
    } else {
        bitmap & ((1u64 << (bound + 1)) - 1)
    }
}

fn caps_from_bitmap(bitmap: u64) -> CapsHashSet {
    caps::all()
        .into_iter()
        .filter(|cap| bitmap & (1u64 << cap.index()) != 0)
        .collect()
}

/// Apply the trim: effective and permitted stay full, inheritable becomes
/// `keep`, and every bounding-set bit outside `keep` is dropped with
/// CAP_SETPCAP last. Dropping CAP_SETPCAP earlier would remove the right
/// to drop anything else.
pub fn apply_capability_trim(keep: u64) -> Result<()> {
    let bound = last_cap();
    if bound == 0 {
        return Err(TaskError::invalid_value(
            "capability bound not initialized before trim",
        ));
    }

    let full = caps::all();
    caps::set(None, CapSet::Effective, &full)
        .map_err(|e| TaskError::unknown(format!("capset(effective): {}", e)))?;
    caps::set(None, CapSet::Permitted, &full)
        .map_err(|e| TaskError::unknown(format!("capset(permitted): {}", e)))?;
    caps::set(None, CapSet::Inheritable, &caps_from_bitmap(keep))
        .map_err(|e| TaskError::unknown(format!("capset(inheritable): {}", e)))?;

    for cap in caps::all() {
        let index = cap.index() as u32;
        if index > bound || cap == Capability::CAP_SETPCAP {
            continue;
        }
        if keep & (1u64 << index) == 0 {
            debug!("drop bounding capability {}", cap);
            caps::drop(None, CapSet::Bounding, cap)
                .map_err(|e| TaskError::unknown(format!("capbset_drop({}): {}", cap, e)))?;
        }
    }

    if keep & (1u64 << Capability::CAP_SETPCAP.index()) == 0 {
        caps::drop(None, CapSet::Bounding, Capability::CAP_SETPCAP)
            .map_err(|e| TaskError::unknown(format!("capbset_drop(CAP_SETPCAP): {}", e)))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_last_cap_reads_kernel_value() {
        let value = init_last_cap().unwrap();
        assert!(value > 0);
        // the cell is sticky
        assert_eq!(init_last_cap().unwrap(), value);
        assert_eq!(last_cap(), value);
    }

    #[test]
    fn test_clamp_keeps_low_bits() {
        init_last_cap().unwrap();
        let keep = 1u64 << Capability::CAP_NET_BIND_SERVICE.index();
        assert_eq!(clamp_to_last_cap(keep), keep);
    }

    #[test]
    fn test_caps_from_bitmap_selects_by_index() {
        let bit = Capability::CAP_NET_BIND_SERVICE.index();
        let set = caps_from_bitmap(1u64 << bit);
        assert_eq!(set.len(), 1);
        assert!(set.contains(&Capability::CAP_NET_BIND_SERVICE));
    }

    #[test]
    fn test_caps_from_empty_bitmap_is_empty() {
        assert!(caps_from_bitmap(0).is_empty());
    }
}
