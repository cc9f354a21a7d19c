// SPDX-License-Identifier: GPL-3.0-only

use storage_types::{OperationError, OperationErrorKind, is_busy_message};

use crate::dbus::properties::PropertyMap;

/// What a UDisks2 job is doing, from its `Operation` property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOperation {
    Mount,
    Unmount,
    Format,
    Lock,
    Unlock,
    Other(String),
}

impl JobOperation {
    pub fn from_udisks(operation: &str) -> Self {
        match operation {
            "filesystem-mount" => Self::Mount,
            "filesystem-unmount" => Self::Unmount,
            "format-mkfs" | "format-erase" => Self::Format,
            "encrypted-lock" => Self::Lock,
            "encrypted-unlock" => Self::Unlock,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Added,
    Completed,
}

/// One outstanding privileged operation announced by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub path: String,
    pub operation: JobOperation,
    /// Object paths of the block devices the job affects
    pub objects: Vec<String>,
    pub status: JobStatus,
    pub success: bool,
    pub message: String,
}

impl Job {
    pub fn from_properties(path: impl Into<String>, properties: &PropertyMap) -> Self {
        let operation = properties
            .get("Operation")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        Self {
            path: path.into(),
            operation: JobOperation::from_udisks(operation),
            objects: properties
                .get("Objects")
                .map(|v| v.as_strings())
                .unwrap_or_default(),
            status: JobStatus::Added,
            success: false,
            message: String::new(),
        }
    }

    pub fn complete(&mut self, success: bool, message: impl Into<String>) {
        self.status = JobStatus::Completed;
        self.success = success;
        self.message = message.into();
    }

    /// An unmount that failed only because the target was busy.
    pub fn is_busy_failure(&self) -> bool {
        self.status == JobStatus::Completed
            && !self.success
            && self.operation == JobOperation::Unmount
            && is_busy_message(&self.message)
    }

    pub fn error(&self) -> Option<OperationError> {
        if self.status != JobStatus::Completed || self.success {
            return None;
        }
        let kind = if is_busy_message(&self.message) {
            OperationErrorKind::DeviceBusy
        } else {
            OperationErrorKind::Failed
        };
        Some(OperationError::new(kind, self.message.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbus::properties::PropValue;

    fn unmount_job() -> Job {
        Job::from_properties(
            "/org/freedesktop/UDisks2/jobs/7",
            &PropertyMap::from([
                (
                    "Operation".to_string(),
                    PropValue::Str("filesystem-unmount".to_string()),
                ),
                (
                    "Objects".to_string(),
                    PropValue::Strings(vec![
                        "/org/freedesktop/UDisks2/block_devices/mmcblk1p1".to_string(),
                    ]),
                ),
            ]),
        )
    }

    #[test]
    fn parses_operation_and_objects() {
        let job = unmount_job();
        assert_eq!(job.operation, JobOperation::Unmount);
        assert_eq!(job.status, JobStatus::Added);
        assert_eq!(
            job.objects,
            vec!["/org/freedesktop/UDisks2/block_devices/mmcblk1p1".to_string()]
        );
        assert_eq!(
            JobOperation::from_udisks("ata-smart-selftest"),
            JobOperation::Other("ata-smart-selftest".to_string())
        );
    }

    #[test]
    fn busy_unmount_is_not_a_real_failure() {
        let mut job = unmount_job();
        job.complete(false, "Error unmounting /dev/mmcblk1p1: target is busy");
        assert!(job.is_busy_failure());
        assert!(job.error().is_some_and(|e| e.is_retryable()));

        let mut job = unmount_job();
        job.complete(false, "Not mounted");
        assert!(!job.is_busy_failure());
        assert_eq!(
            job.error().map(|e| e.kind),
            Some(OperationErrorKind::Failed)
        );

        let mut job = unmount_job();
        job.complete(true, "");
        assert!(job.error().is_none());
    }
}
