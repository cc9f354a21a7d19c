// SPDX-License-Identifier: GPL-3.0-only

//! Canonical domain models for the partition state manager
//!
//! These models are shared by every layer of the stack:
//!
//! - **storage-sys**: produces [`Capacity`] from statvfs/quota probes
//! - **storage-udisks**: reports drive metadata as [`ConnectionBus`] and [`DriveInfo`]
//! - **storage-partitions**: owns [`PartitionRecord`]s and drives their [`PartitionStatus`]
//! - **storage-service**: serializes records for the `list` command
//!
//! Operation failures reported by the storage service are classified as
//! [`OperationError`] so callers can tell a retryable busy device apart from a
//! real failure.

pub mod capacity;
pub mod common;
pub mod error;
pub mod operation;
pub mod partition;

pub use capacity::Capacity;
pub use common::{bytes_to_pretty, signed_bytes_to_pretty};
pub use error::{OperationError, OperationErrorKind, is_busy_message};
pub use operation::{FormatOptions, OperationKind};
pub use partition::{
    ActiveState, ConnectionBus, DriveInfo, PartitionFilter, PartitionRecord, PartitionStatus,
    StorageType, device_name_of,
};
