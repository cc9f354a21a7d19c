// SPDX-License-Identifier: GPL-3.0-only

use storage_types::{OperationError, OperationErrorKind};
use thiserror::Error;
use zbus::DBusError;

const INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
const UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
const UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
const UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
const UDISKS_ERROR_PREFIX: &str = "org.freedesktop.UDisks2.Error.";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The system bus or the UDisks2 service cannot be reached
    #[error("Storage service unavailable: {0}")]
    Unavailable(String),

    /// A D-Bus method call returned an error reply
    #[error("{name}: {message}")]
    Method { name: String, message: String },

    #[error("D-Bus error: {0}")]
    DBus(String),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

impl ServiceError {
    /// Classify an `fdo` error by its D-Bus error name.
    pub fn from_dbus<E>(error: &E) -> Self
    where
        E: DBusError + std::fmt::Display,
    {
        let message = error
            .description()
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        Self::from_error_name(error.name().as_str(), message)
    }

    fn from_error_name(name: &str, message: String) -> Self {
        if OperationErrorKind::from_dbus_name(name) == OperationErrorKind::ServiceUnavailable {
            return Self::Unavailable(message);
        }

        if name.starts_with("org.freedesktop.zbus.") {
            return Self::DBus(message);
        }

        Self::Method {
            name: name.to_string(),
            message,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    /// Whether the object does not carry the requested interface.
    ///
    /// `GetAll` on a non-applicable interface is an expected outcome while
    /// probing block devices.
    pub fn is_missing_interface(&self) -> bool {
        match self {
            Self::Method { name, .. } => matches!(
                name.as_str(),
                INVALID_ARGS | UNKNOWN_INTERFACE | UNKNOWN_OBJECT | UNKNOWN_METHOD
            ),
            _ => false,
        }
    }

    pub fn to_operation_error(&self) -> OperationError {
        match self {
            Self::Unavailable(message) => {
                OperationError::new(OperationErrorKind::ServiceUnavailable, message.clone())
            }
            Self::Method { name, message } => OperationError::from_dbus(name, message.clone()),
            Self::DBus(message) => OperationError::new(OperationErrorKind::Failed, message.clone()),
        }
    }
}

impl From<zbus::Error> for ServiceError {
    fn from(error: zbus::Error) -> Self {
        match error {
            zbus::Error::MethodError(name, message, _) => {
                let message = message.unwrap_or_else(|| name.to_string());
                Self::from_error_name(name.as_str(), message)
            }
            zbus::Error::FDO(error) => Self::from(*error),
            other => Self::DBus(other.to_string()),
        }
    }
}

impl From<zbus::fdo::Error> for ServiceError {
    fn from(error: zbus::fdo::Error) -> Self {
        Self::from_dbus(&error)
    }
}

/// The udisks2 proxies have already decoded the error name into a variant;
/// map it back so every error reaches [`OperationErrorKind::from_dbus_name`].
impl From<udisks2::Error> for ServiceError {
    fn from(error: udisks2::Error) -> Self {
        use udisks2::Error as E;

        let message = error.to_string();
        let suffix = match error {
            E::Zbus(error) => return Self::from(error),
            E::Failed | E::Iscsi(_) => "Failed",
            E::Cancelled => "Cancelled",
            E::AlreadyCancelled => "AlreadyCancelled",
            E::NotAuthorized => "NotAuthorized",
            E::NotAuthorizedCanObtain => "NotAuthorizedCanObtain",
            E::NotAuthorizedDismissed => "NotAuthorizedDismissed",
            E::AlreadyMounted => "AlreadyMounted",
            E::NotMounted => "NotMounted",
            E::OptionNotPermitted => "OptionNotPermitted",
            E::MountedByOtherUser => "MountedByOtherUser",
            E::AlreadyUnmounting => "AlreadyUnmounting",
            E::NotSupported => "NotSupported",
            E::TimedOut => "Timedout",
            E::WouldWakeup => "WouldWakeup",
            E::DeviceBusy => "DeviceBusy",
        };

        Self::Method {
            name: format!("{UDISKS_ERROR_PREFIX}{suffix}"),
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_interface_is_recognised() {
        let error = ServiceError::from(zbus::fdo::Error::InvalidArgs(
            "No such interface 'org.freedesktop.UDisks2.Filesystem'".to_string(),
        ));
        assert!(error.is_missing_interface());
        assert!(!error.is_unavailable());
    }

    #[test]
    fn service_unknown_means_unavailable() {
        let error = ServiceError::from(zbus::fdo::Error::ServiceUnknown(
            "The name org.freedesktop.UDisks2 was not provided".to_string(),
        ));
        assert!(error.is_unavailable());
        assert_eq!(
            error.to_operation_error().kind,
            OperationErrorKind::ServiceUnavailable
        );
    }

    #[test]
    fn method_errors_map_to_operation_kinds() {
        let error = ServiceError::Method {
            name: "org.freedesktop.UDisks2.Error.NotAuthorizedCanObtain".to_string(),
            message: "Authentication is required".to_string(),
        };
        let operation = error.to_operation_error();
        assert_eq!(operation.kind, OperationErrorKind::NotAuthorizedCanObtain);
        assert_eq!(operation.message, "Authentication is required");
    }

    #[test]
    fn udisks_call_errors_keep_their_kind() {
        let busy = ServiceError::from(udisks2::Error::DeviceBusy).to_operation_error();
        assert_eq!(busy.kind, OperationErrorKind::DeviceBusy);
        assert!(busy.is_retryable());

        let denied = ServiceError::from(udisks2::Error::NotAuthorizedDismissed);
        assert_eq!(
            denied.to_operation_error().kind,
            OperationErrorKind::NotAuthorizedDismissed
        );
        assert_eq!(
            ServiceError::from(udisks2::Error::TimedOut)
                .to_operation_error()
                .kind,
            OperationErrorKind::TimedOut
        );
    }

    #[test]
    fn wrapped_zbus_errors_are_unwrapped() {
        let error = ServiceError::from(udisks2::Error::Zbus(zbus::Error::FDO(Box::new(
            zbus::fdo::Error::ServiceUnknown("UDisks2 is not running".to_string()),
        ))));
        assert!(error.is_unavailable());

        let error = ServiceError::from(zbus::Error::Failure("connection reset".to_string()));
        assert_eq!(
            error.to_operation_error().kind,
            OperationErrorKind::Failed
        );
        assert!(!error.is_missing_interface());
    }
}
