// SPDX-License-Identifier: GPL-3.0-only

//! Partition state for the session: the internal root and home filesystems
//! plus every removable device UDisks2 reports, kept in sync with the kernel
//! mount table.
//!
//! Start a [`Controller`] on the runtime and talk to it through the returned
//! [`StorageHandle`]. [`Partition`] handles read live state without going
//! through the controller.

pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod manager;
pub mod model;
pub mod monitor;
pub mod partition;
pub mod policy;
pub mod probe;

#[cfg(test)]
mod testing;

pub use config::{DEFAULT_REFRESH_DEBOUNCE, ManagerConfig};
pub use controller::{Controller, StorageHandle};
pub use error::ControlError;
pub use event::{OperationReply, PartitionEvent, ProbeResult};
pub use manager::{JobPhase, ManagerOutput, PartitionManager};
pub use model::{ModelChange, PartitionModel};
pub use monitor::{DeviceOperation, Monitor, MonitorEvent};
pub use partition::{Partition, PartitionId, PartitionStore};
pub use policy::AutomountPolicy;
pub use probe::{DEFAULT_PROBE_WORKERS, ProbePool, ProbeRequest};
