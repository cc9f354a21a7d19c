// SPDX-License-Identifier: GPL-3.0-only

//! UDisks2 side of the partition state manager: the service connection and
//! its signals, the calls made on behalf of callers, and the registry that
//! turns partial notifications into complete block device records.

mod dbus;

pub mod backend;
pub mod block;
pub mod error;
pub mod interfaces;
pub mod job;
pub mod manager;
pub mod registry;

pub use backend::{OperationRequest, StorageBackend, UDisksBackend};
pub use block::BlockDevice;
pub use dbus::bytestring::{decode_c_string_bytes, decode_mount_points};
pub use dbus::properties::{PropValue, PropertyMap, property_map};
pub use error::{Result, ServiceError};
pub use interfaces::{Interface, JOB_INTERFACE, UDISKS2_ROOT, UDISKS2_SERVICE};
pub use job::{Job, JobOperation, JobStatus};
pub use manager::{ServiceConnection, ServiceSignal, ServiceSignalStream};
pub use registry::{
    BlockDeviceRecord, BlockDeviceRegistry, DEFAULT_WAITER_TIMEOUT, DeviceLookup, FetchRequest,
    InterfaceMap, PartitionWaiter, RegistryEvent, RegistryOutput,
};
