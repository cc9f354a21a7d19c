// SPDX-License-Identifier: GPL-3.0-only

//! Partition handles and the arena backing them.
//!
//! Records are only mutated by the control task. Handles may live anywhere
//! and read the current record through the arena, so a mutation is visible to
//! every holder without replacing anything.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use storage_types::{PartitionRecord, PartitionStatus, StorageType};
use tokio::sync::mpsc;
use tracing::debug;

use crate::event::ControlEvent;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(u64);

pub struct PartitionStore {
    records: RwLock<HashMap<PartitionId, PartitionRecord>>,
    next_id: AtomicU64,
    control: Option<mpsc::UnboundedSender<ControlEvent>>,
}

impl PartitionStore {
    pub(crate) fn new(control: Option<mpsc::UnboundedSender<ControlEvent>>) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            control,
        }
    }

    pub(crate) fn insert(&self, record: PartitionRecord) -> PartitionId {
        let id = PartitionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, record);
        id
    }

    pub(crate) fn remove(&self, id: PartitionId) -> Option<PartitionRecord> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    pub(crate) fn get(&self, id: PartitionId) -> Option<PartitionRecord> {
        self.read(id, PartitionRecord::clone)
    }

    pub(crate) fn read<T>(&self, id: PartitionId, f: impl FnOnce(&PartitionRecord) -> T) -> Option<T> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(f)
    }

    pub(crate) fn update<T>(
        &self,
        id: PartitionId,
        f: impl FnOnce(&mut PartitionRecord) -> T,
    ) -> Option<T> {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&id)
            .map(f)
    }
}

/// Reference handle to one partition.
///
/// Equality is identity of the backing record: two handles are equal when
/// they point at the same partition, whatever its current fields.
#[derive(Clone)]
pub struct Partition {
    id: PartitionId,
    store: Option<Arc<PartitionStore>>,
}

impl Partition {
    pub(crate) fn new(id: PartitionId, store: Arc<PartitionStore>) -> Self {
        Self {
            id,
            store: Some(store),
        }
    }

    /// A handle that never resolves, returned when nothing matches.
    pub fn invalid() -> Self {
        Self {
            id: PartitionId(0),
            store: None,
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn is_valid(&self) -> bool {
        self.store
            .as_ref()
            .and_then(|store| store.read(self.id, |_| ()))
            .is_some()
    }

    /// Copy of the current record, or defaults once the partition is gone.
    pub fn snapshot(&self) -> PartitionRecord {
        self.read(PartitionRecord::clone).unwrap_or_default()
    }

    fn read<T>(&self, f: impl FnOnce(&PartitionRecord) -> T) -> Option<T> {
        self.store.as_ref().and_then(|store| store.read(self.id, f))
    }

    pub fn storage_type(&self) -> Option<StorageType> {
        self.read(|r| r.storage_type)
    }

    pub fn status(&self) -> PartitionStatus {
        self.read(|r| r.status).unwrap_or_default()
    }

    pub fn device_path(&self) -> String {
        self.read(|r| r.device_path.clone()).unwrap_or_default()
    }

    pub fn mount_path(&self) -> String {
        self.read(|r| r.mount_path.clone()).unwrap_or_default()
    }

    pub fn bytes_available(&self) -> i64 {
        self.read(|r| r.bytes_available).unwrap_or(-1)
    }

    pub fn bytes_total(&self) -> i64 {
        self.read(|r| r.bytes_total).unwrap_or(-1)
    }

    /// Ask the owner to reconcile this partition again and re-announce it.
    pub fn refresh(&self) {
        let Some(control) = self.store.as_ref().and_then(|s| s.control.as_ref()) else {
            return;
        };
        if control.send(ControlEvent::RefreshPartition(self.id)).is_err() {
            debug!("Partition refresh requested after the controller stopped");
        }
    }
}

impl PartialEq for Partition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && match (&self.store, &other.store) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
    }
}

impl Eq for Partition {}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_observe_in_place_mutation() {
        let store = Arc::new(PartitionStore::new(None));
        let id = store.insert(PartitionRecord::external("/dev/sdb1"));
        let a = Partition::new(id, store.clone());
        let b = Partition::new(id, store.clone());

        store.update(id, |r| r.status = PartitionStatus::Mounted);
        assert_eq!(a.status(), PartitionStatus::Mounted);
        assert_eq!(a, b);
    }

    #[test]
    fn equality_is_identity_not_fields() {
        let store = Arc::new(PartitionStore::new(None));
        let first = Partition::new(store.insert(PartitionRecord::external("/dev/sdb1")), store.clone());
        let second = Partition::new(store.insert(PartitionRecord::external("/dev/sdb1")), store.clone());
        assert_eq!(first.snapshot(), second.snapshot());
        assert_ne!(first, second);
    }

    #[test]
    fn removed_partitions_report_defaults() {
        let store = Arc::new(PartitionStore::new(None));
        let id = store.insert(PartitionRecord::internal(StorageType::System, "/"));
        let handle = Partition::new(id, store.clone());
        assert!(handle.is_valid());

        store.remove(id);
        assert!(!handle.is_valid());
        assert_eq!(handle.mount_path(), "");
        assert_eq!(handle.bytes_total(), -1);
        assert_eq!(handle.storage_type(), None);
        assert!(!Partition::invalid().is_valid());
    }

    #[test]
    fn refresh_reaches_the_controller() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let store = Arc::new(PartitionStore::new(Some(tx)));
        let id = store.insert(PartitionRecord::external("/dev/sdb1"));
        Partition::new(id, store).refresh();

        assert!(matches!(rx.try_recv(), Ok(ControlEvent::RefreshPartition(got)) if got == id));
    }
}
