// SPDX-License-Identifier: GPL-3.0-only

use storage_types::{OperationError, OperationErrorKind};
use storage_udisks::{BlockDeviceRegistry, DeviceLookup};

/// Which devices may be operated on at a caller's request.
#[derive(Debug, Clone, Default)]
pub struct AutomountPolicy {
    excluded_prefixes: Vec<String>,
}

impl AutomountPolicy {
    pub fn new(excluded_prefixes: Vec<String>) -> Self {
        Self { excluded_prefixes }
    }

    /// Resolve `device_path` to an accepted device the caller may touch.
    ///
    /// Devices backing internal partitions, devices the service marks as
    /// ignored or system-only (without the auto hint) and devices under an
    /// excluded prefix are refused.
    pub fn check(
        &self,
        registry: &BlockDeviceRegistry,
        device_path: &str,
        internal_devices: &[String],
    ) -> Result<DeviceLookup, OperationError> {
        let Some(lookup) = registry.lookup(device_path) else {
            return Err(OperationError::new(
                OperationErrorKind::UnknownDevice,
                format!("no block device {device_path}"),
            ));
        };

        let accepted = registry
            .record(&lookup.device.object_path)
            .is_some_and(|r| r.is_accepted());
        let refuse = |reason: &str| {
            Err(OperationError::new(
                OperationErrorKind::NotAutomountable,
                format!("{device_path}: {reason}"),
            ))
        };

        if !accepted {
            return refuse("not a partition");
        }
        let candidates = std::iter::once(&lookup.device).chain(lookup.backing.as_ref());
        for device in candidates {
            if device.hint_ignore {
                return refuse("ignored by the storage service");
            }
            if device.hint_system && !device.hint_auto {
                return refuse("system device");
            }
            if internal_devices.contains(&device.device_path) {
                return refuse("backs an internal partition");
            }
            if self
                .excluded_prefixes
                .iter()
                .any(|prefix| device.device_path.starts_with(prefix.as_str()))
            {
                return refuse("excluded by configuration");
            }
        }

        Ok(lookup)
    }
}
