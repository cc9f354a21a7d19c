// SPDX-License-Identifier: GPL-3.0-only

//! Low-level system operations for the partition state manager
//!
//! This crate wraps the kernel collaborators that do not go through D-Bus:
//! - Reading and parsing the mount table (`/proc/mounts` or mountinfo format)
//! - Probing filesystem capacity with `statvfs(3)` and user quotas with `quotactl(2)`
//!
//! Capacity probes may block on slow or removable media and must be called
//! from a blocking worker, never from the reconciliation task.

pub mod capacity;
pub mod error;
pub mod mounts;

pub use capacity::{CapacityProbe, FsStats, QuotaUsage, SyscallProbe, capacity_from_stats};
pub use error::{Result, SysError};
pub use mounts::{
    DEFAULT_MOUNT_TABLE, MountEntry, MountTable, ProcMountTable, parse_mount_table,
};
