// SPDX-License-Identifier: GPL-3.0-only

//! Filesystem capacity probing with `statvfs(3)` and `quotactl(2)`.
//!
//! Both calls can block for a long time on removable or network media; keep
//! them on a blocking worker.

use std::ffi::CString;
use std::mem::MaybeUninit;

use storage_types::Capacity;

use crate::error::{Result, SysError};

// <sys/quota.h>
const Q_GETQUOTA: u32 = 0x800007;
const USRQUOTA: u32 = 0;
const SUBCMDSHIFT: u32 = 8;
const SUBCMDMASK: u32 = 0x00ff;
const QIF_BLIMITS: u32 = 1;
const QIF_SPACE: u32 = 4;
const QIF_DQBLKSIZE: u64 = 1024;

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct IfDqblk {
    dqb_bhardlimit: u64,
    dqb_bsoftlimit: u64,
    dqb_curspace: u64,
    dqb_ihardlimit: u64,
    dqb_isoftlimit: u64,
    dqb_curinodes: u64,
    dqb_btime: u64,
    dqb_itime: u64,
    dqb_valid: u32,
}

unsafe extern "C" {
    fn quotactl(
        cmd: libc::c_int,
        special: *const libc::c_char,
        id: libc::c_int,
        addr: *mut libc::c_char,
    ) -> libc::c_int;
}

/// Raw `statvfs` counters of one filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub fragment_size: u64,
    pub read_only: bool,
}

/// Space left under the calling user's hard block quota
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub bytes_available: u64,
}

/// Probe run on a blocking worker for one mounted partition.
pub trait CapacityProbe: Send + Sync {
    fn probe(&self, mount_path: &str, device_path: &str) -> Result<Capacity>;
}

/// Probe backed by the real syscalls
#[derive(Debug, Clone, Copy, Default)]
pub struct SyscallProbe;

impl CapacityProbe for SyscallProbe {
    fn probe(&self, mount_path: &str, device_path: &str) -> Result<Capacity> {
        let stats = statvfs(mount_path)?;

        let quota = if device_path.starts_with("/dev/") {
            // SAFETY: getuid never fails.
            let uid = unsafe { libc::getuid() };
            user_quota(device_path, uid).unwrap_or_else(|e| {
                tracing::debug!("Quota lookup failed for {device_path}: {e}");
                None
            })
        } else {
            None
        };

        Ok(capacity_from_stats(&stats, quota.as_ref()))
    }
}

/// Combine statvfs counters with an optional quota.
///
/// Available bytes are the smaller of the filesystem's free-for-users space
/// and the quota headroom, never more than the total.
pub fn capacity_from_stats(stats: &FsStats, quota: Option<&QuotaUsage>) -> Capacity {
    let to_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);

    let total = stats.blocks.saturating_mul(stats.fragment_size);
    let free = stats.blocks_free.saturating_mul(stats.fragment_size);
    let mut available = stats.blocks_available.saturating_mul(stats.fragment_size);

    if let Some(quota) = quota {
        available = available.min(quota.bytes_available);
    }

    Capacity {
        bytes_total: to_i64(total),
        bytes_available: to_i64(available.min(total)),
        bytes_free: to_i64(free),
        read_only: stats.read_only,
    }
}

pub fn statvfs(mount_path: &str) -> Result<FsStats> {
    let path_c =
        CString::new(mount_path).map_err(|_| SysError::InvalidPath(mount_path.to_string()))?;

    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    let rc = unsafe { libc::statvfs(path_c.as_ptr(), stat.as_mut_ptr()) };
    if rc != 0 {
        return Err(SysError::Syscall {
            call: "statvfs",
            path: mount_path.to_string(),
            source: std::io::Error::last_os_error(),
        });
    }

    let stat = unsafe { stat.assume_init() };
    let fragment_size = if stat.f_frsize > 0 {
        stat.f_frsize
    } else {
        stat.f_bsize
    };

    Ok(FsStats {
        blocks: stat.f_blocks as u64,
        blocks_free: stat.f_bfree as u64,
        blocks_available: stat.f_bavail as u64,
        fragment_size: fragment_size as u64,
        read_only: stat.f_flag & libc::ST_RDONLY != 0,
    })
}

/// Look up the user block quota on `device_path`.
///
/// Returns `Ok(None)` when quotas are not enabled or no hard limit is set.
pub fn user_quota(device_path: &str, uid: libc::uid_t) -> Result<Option<QuotaUsage>> {
    let device_c =
        CString::new(device_path).map_err(|_| SysError::InvalidPath(device_path.to_string()))?;

    let cmd = ((Q_GETQUOTA << SUBCMDSHIFT) | (USRQUOTA & SUBCMDMASK)) as libc::c_int;
    let mut quota = IfDqblk::default();
    let rc = unsafe {
        quotactl(
            cmd,
            device_c.as_ptr(),
            uid as libc::c_int,
            (&mut quota as *mut IfDqblk).cast(),
        )
    };

    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ESRCH) | Some(libc::ENOSYS) | Some(libc::ENOTBLK) | Some(libc::ENOENT)
            | Some(libc::EPERM) | Some(libc::EINVAL) => Ok(None),
            _ => Err(SysError::Syscall {
                call: "quotactl",
                path: device_path.to_string(),
                source: err,
            }),
        };
    }

    Ok(quota_headroom(&quota))
}

fn quota_headroom(quota: &IfDqblk) -> Option<QuotaUsage> {
    if quota.dqb_valid & QIF_BLIMITS == 0 || quota.dqb_bhardlimit == 0 {
        return None;
    }

    let limit = quota.dqb_bhardlimit.saturating_mul(QIF_DQBLKSIZE);
    let used = if quota.dqb_valid & QIF_SPACE != 0 {
        quota.dqb_curspace
    } else {
        0
    };

    Some(QuotaUsage {
        bytes_available: limit.saturating_sub(used),
    })
}
