// SPDX-License-Identifier: GPL-3.0-only

use storage_sys::SysError;
use storage_types::{Capacity, OperationError, OperationKind, PartitionRecord};
use storage_udisks::{Interface, PropertyMap, ServiceError};
use tokio::sync::oneshot;

use crate::partition::{Partition, PartitionId};

/// Changes to the partition collection, as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionEvent {
    Added(Partition),
    /// The handle is already invalid; `snapshot` is its last known state
    Removed {
        partition: Partition,
        snapshot: PartitionRecord,
    },
    Changed(Partition),
    /// The initial UDisks2 enumeration has settled
    ExternalsPopulated,
}

pub type OperationReply = oneshot::Sender<Result<(), OperationError>>;

/// Outcome of one capacity probe, keyed by the mount path it was run on.
#[derive(Debug)]
pub struct ProbeResult {
    pub mount_path: String,
    pub result: Result<Capacity, SysError>,
}

/// Results of work done off the control task, delivered back to it.
#[derive(Debug)]
pub(crate) enum ControlEvent {
    Enumerated(Result<Vec<String>, ServiceError>),
    FetchFinished {
        record_path: String,
        interface: Interface,
        result: Result<PropertyMap, ServiceError>,
    },
    OperationFinished {
        kind: OperationKind,
        object_path: String,
        result: Result<(), ServiceError>,
        reply: OperationReply,
    },
    ProbeFinished(ProbeResult),
    WaiterExpired {
        path: String,
        generation: u64,
    },
    RefreshPartition(PartitionId),
}
