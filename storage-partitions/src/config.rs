// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use storage_udisks::DEFAULT_WAITER_TIMEOUT;

use crate::probe::DEFAULT_PROBE_WORKERS;

pub const DEFAULT_REFRESH_DEBOUNCE: Duration = Duration::from_millis(10);

/// Tunables of the partition controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    pub root_mount: String,
    /// `None` disables the separate home partition
    pub home_mount: Option<String>,
    pub refresh_debounce: Duration,
    pub waiter_timeout: Duration,
    pub probe_workers: usize,
    /// Devices under these paths are never mounted on request
    pub excluded_device_prefixes: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            root_mount: "/".to_string(),
            home_mount: Some("/home".to_string()),
            refresh_debounce: DEFAULT_REFRESH_DEBOUNCE,
            waiter_timeout: DEFAULT_WAITER_TIMEOUT,
            probe_workers: DEFAULT_PROBE_WORKERS,
            excluded_device_prefixes: Vec::new(),
        }
    }
}
