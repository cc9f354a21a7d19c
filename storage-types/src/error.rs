// SPDX-License-Identifier: GPL-3.0-only

use serde::{Deserialize, Serialize};
use thiserror::Error;

const UDISKS_ERROR_PREFIX: &str = "org.freedesktop.UDisks2.Error.";

/// Classification of a failed mount/unmount/lock/unlock/format request.
///
/// The UDisks2-reported kinds keep the names of the service's D-Bus error
/// suffixes. The last three are produced locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationErrorKind {
    Failed,
    Cancelled,
    AlreadyCancelled,
    NotAuthorized,
    NotAuthorizedCanObtain,
    NotAuthorizedDismissed,
    AlreadyMounted,
    NotMounted,
    OptionNotPermitted,
    MountedByOtherUser,
    AlreadyUnmounting,
    NotSupported,
    TimedOut,
    WouldWakeup,
    DeviceBusy,
    /// Rejected by the local automount policy before contacting the service
    NotAutomountable,
    /// No block device with that path is known
    UnknownDevice,
    /// The storage service could not be reached
    ServiceUnavailable,
}

impl OperationErrorKind {
    /// Map a D-Bus error name such as `org.freedesktop.UDisks2.Error.DeviceBusy`.
    ///
    /// Unknown names, including non-UDisks2 errors, map to [`Self::Failed`].
    pub fn from_dbus_name(name: &str) -> Self {
        if name == "org.freedesktop.DBus.Error.ServiceUnknown"
            || name == "org.freedesktop.DBus.Error.NameHasNoOwner"
        {
            return Self::ServiceUnavailable;
        }

        let Some(suffix) = name.strip_prefix(UDISKS_ERROR_PREFIX) else {
            return Self::Failed;
        };

        match suffix {
            "Cancelled" => Self::Cancelled,
            "AlreadyCancelled" => Self::AlreadyCancelled,
            "NotAuthorized" => Self::NotAuthorized,
            "NotAuthorizedCanObtain" => Self::NotAuthorizedCanObtain,
            "NotAuthorizedDismissed" => Self::NotAuthorizedDismissed,
            "AlreadyMounted" => Self::AlreadyMounted,
            "NotMounted" => Self::NotMounted,
            "OptionNotPermitted" => Self::OptionNotPermitted,
            "MountedByOtherUser" => Self::MountedByOtherUser,
            "AlreadyUnmounting" => Self::AlreadyUnmounting,
            "NotSupported" => Self::NotSupported,
            "Timedout" | "TimedOut" => Self::TimedOut,
            "WouldWakeup" => Self::WouldWakeup,
            "DeviceBusy" => Self::DeviceBusy,
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct OperationError {
    pub kind: OperationErrorKind,
    pub message: String,
}

impl OperationError {
    pub fn new(kind: OperationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_dbus(name: &str, message: impl Into<String>) -> Self {
        Self::new(OperationErrorKind::from_dbus_name(name), message)
    }

    /// Busy devices are a retry signal for the caller, not a real failure.
    pub fn is_retryable(&self) -> bool {
        self.kind == OperationErrorKind::DeviceBusy
    }
}

/// Whether a job completion message reports a busy target.
///
/// UDisks2 surfaces `umount` output verbatim ("target is busy") in job
/// messages instead of a typed error name.
pub fn is_busy_message(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("device is busy")
        || message.contains("target is busy")
        || message.contains("devicebusy")
        || message.contains("device busy")
}
