// SPDX-License-Identifier: GPL-3.0-only

//! The canonical, ordered partition collection.
//!
//! Order is root, home, then external devices by connection bus. The manager
//! merges three views into it: the kernel mount table (read once per
//! reconciliation pass), UDisks2 device hints and job-driven predictions.
//! It never blocks on capacity probes; it hands out [`ProbeRequest`]s and
//! merges their results later.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use storage_sys::{MountEntry, MountTable};
use storage_types::{
    ActiveState, Capacity, ConnectionBus, PartitionFilter, PartitionRecord, PartitionStatus,
    StorageType, device_name_of,
};
use storage_udisks::{BlockDevice, JobOperation};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::event::{PartitionEvent, ProbeResult};
use crate::partition::{Partition, PartitionId, PartitionStore};
use crate::probe::ProbeRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Added,
    /// `busy` marks an unmount refused because the target is in use
    Completed { success: bool, busy: bool },
    /// The job disappeared without reporting completion
    Abandoned,
}

#[derive(Debug, Default)]
pub struct ManagerOutput {
    pub events: Vec<PartitionEvent>,
    pub probes: Vec<ProbeRequest>,
}

impl ManagerOutput {
    pub fn extend(&mut self, other: ManagerOutput) {
        self.events.extend(other.events);
        self.probes.extend(other.probes);
    }
}

/// Service-provided values an external partition falls back to when the
/// mount table has nothing to say about it.
#[derive(Debug, Clone, Default)]
struct ExternalHints {
    filesystem_type: String,
    can_mount: bool,
}

impl From<&BlockDevice> for ExternalHints {
    fn from(device: &BlockDevice) -> Self {
        Self {
            filesystem_type: device.id_type.clone(),
            can_mount: device.is_mountable,
        }
    }
}

pub struct PartitionManager {
    store: Arc<PartitionStore>,
    order: Vec<PartitionId>,
    hints: HashMap<PartitionId, ExternalHints>,
    mount_table: Arc<dyn MountTable>,
    root_mount: String,
    refresh_debounce: Duration,
    refresh_due: Option<Instant>,
}

impl PartitionManager {
    /// Build the internal partitions from the configured mount points.
    ///
    /// Internal mount points with nothing mounted are dropped, as is a home
    /// that lives on the root device. A single survivor becomes `Mass`.
    pub fn new(
        config: &ManagerConfig,
        mount_table: Arc<dyn MountTable>,
        store: Arc<PartitionStore>,
    ) -> Self {
        let mut manager = Self {
            store,
            order: Vec::new(),
            hints: HashMap::new(),
            mount_table,
            root_mount: config.root_mount.clone(),
            refresh_debounce: config.refresh_debounce,
            refresh_due: None,
        };

        let root = manager
            .store
            .insert(PartitionRecord::internal(StorageType::System, &config.root_mount));
        manager.order.push(root);

        if let Some(home) = config.home_mount.as_deref()
            && home != config.root_mount
        {
            let home = manager
                .store
                .insert(PartitionRecord::internal(StorageType::User, home));
            manager.order.push(home);
        }

        let internals = manager.order.clone();
        manager.reconcile(&internals, false);
        manager.prune_internals();
        manager
    }

    fn prune_internals(&mut self) {
        let internals: Vec<(PartitionId, PartitionRecord)> = self
            .order
            .iter()
            .filter_map(|id| self.store.get(*id).map(|r| (*id, r)))
            .filter(|(_, r)| r.is_internal())
            .collect();

        let root_device = internals
            .iter()
            .find(|(_, r)| r.storage_type == StorageType::System && r.is_mounted())
            .map(|(_, r)| r.device_path.clone());

        for (id, record) in &internals {
            let duplicate = record.storage_type == StorageType::User
                && root_device.as_deref() == Some(record.device_path.as_str());
            if !record.is_mounted() || duplicate {
                info!(
                    mount_path = record.mount_path,
                    duplicate, "Dropping internal partition"
                );
                self.order.retain(|other| other != id);
                self.store.remove(*id);
            }
        }

        let remaining: Vec<PartitionId> = self
            .order
            .iter()
            .copied()
            .filter(|id| self.store.read(*id, |r| r.is_internal()) == Some(true))
            .collect();
        if let [only] = remaining.as_slice() {
            self.store
                .update(*only, |r| r.storage_type = StorageType::Mass);
        }
    }

    fn handle(&self, id: PartitionId) -> Partition {
        Partition::new(id, self.store.clone())
    }

    fn is_external(&self, id: PartitionId) -> bool {
        self.store
            .read(id, |r| r.storage_type == StorageType::External)
            .unwrap_or(false)
    }

    fn find_external(&self, device_path: &str) -> Option<PartitionId> {
        self.order.iter().copied().find(|id| {
            self.store
                .read(*id, |r| {
                    r.storage_type == StorageType::External && r.device_path == device_path
                })
                .unwrap_or(false)
        })
    }

    /// The partition mounted at the root mount point, or an invalid handle.
    pub fn root(&self) -> Partition {
        self.order
            .iter()
            .copied()
            .find(|id| {
                self.store
                    .read(*id, |r| {
                        r.is_internal() && r.mount_path == self.root_mount && r.is_mounted()
                    })
                    .unwrap_or(false)
            })
            .map(|id| self.handle(id))
            .unwrap_or_else(Partition::invalid)
    }

    pub fn partitions(&self, filter: PartitionFilter) -> Vec<Partition> {
        let matched: Vec<(PartitionId, PartitionRecord)> = self
            .order
            .iter()
            .filter_map(|id| self.store.get(*id).map(|r| (*id, r)))
            .filter(|(_, r)| filter.matches(r.storage_type))
            .collect();

        if !filter.exclude_parents {
            return matched.into_iter().map(|(id, _)| self.handle(id)).collect();
        }

        let records: Vec<PartitionRecord> = matched.iter().map(|(_, r)| r.clone()).collect();
        collapsed_indices(&records)
            .into_iter()
            .map(|index| self.handle(matched[index].0))
            .collect()
    }

    /// Device paths currently backing internal partitions.
    pub fn internal_device_paths(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|id| {
                self.store
                    .read(*id, |r| (r.is_internal() && !r.device_path.is_empty()).then(|| r.device_path.clone()))
                    .flatten()
            })
            .collect()
    }

    fn insert_position(&self, bus: ConnectionBus) -> usize {
        let mut position = self.order.iter().filter(|id| !self.is_external(**id)).count();
        for (index, id) in self.order.iter().enumerate() {
            let external_bus = self
                .store
                .read(*id, |r| (r.storage_type == StorageType::External).then_some(r.drive.connection_bus))
                .flatten();
            if external_bus.is_some_and(|b| b <= bus) {
                position = index + 1;
            }
        }
        position
    }

    /// Add an accepted external device. A known device path is an update.
    pub fn add(&mut self, device: &BlockDevice) -> ManagerOutput {
        if self.find_external(&device.device_path).is_some() {
            return self.update(device);
        }
        if device.device_path.is_empty() {
            warn!(object = device.object_path, "Ignoring block device without a device path");
            return ManagerOutput::default();
        }

        let mut record = PartitionRecord::external(&device.device_path);
        apply_device(&mut record, device);
        let id = self.store.insert(record);
        self.hints.insert(id, ExternalHints::from(device));

        let position = self.insert_position(device.drive.connection_bus);
        self.order.insert(position, id);
        info!(
            device = device.device_path,
            bus = ?device.drive.connection_bus,
            "Partition added"
        );

        let mut out = self.reconcile(&[id], false);
        out.events
            .retain(|e| !matches!(e, PartitionEvent::Changed(p) if p.id() == id));
        out.events.insert(0, PartitionEvent::Added(self.handle(id)));
        out
    }

    pub fn remove(&mut self, device_paths: &[String]) -> ManagerOutput {
        let mut out = ManagerOutput::default();
        for device_path in device_paths {
            let Some(id) = self.find_external(device_path) else {
                continue;
            };
            self.order.retain(|other| *other != id);
            self.hints.remove(&id);
            if let Some(snapshot) = self.store.remove(id) {
                info!(device = device_path, "Partition removed");
                out.events.push(PartitionEvent::Removed {
                    partition: self.handle(id),
                    snapshot,
                });
            }
        }
        out
    }

    /// Move an external entry to another block device, keeping its handle.
    ///
    /// Used when unlocking swaps an encrypted device for its cleartext
    /// device, and back when locking.
    pub fn replace(&mut self, previous_device_path: &str, current: &BlockDevice) -> ManagerOutput {
        let Some(id) = self.find_external(previous_device_path) else {
            return self.add(current);
        };

        debug!(
            previous = previous_device_path,
            current = current.device_path,
            "Partition moves to another block device"
        );
        self.store.update(id, |r| {
            r.device_path = current.device_path.clone();
            r.device_name = device_name_of(&current.device_path).to_string();
            apply_device(r, current);
        });
        self.hints.insert(id, ExternalHints::from(current));
        self.reconcile(&[id], false)
    }

    /// Refresh hint fields of a known external entry.
    ///
    /// The service sends these in bursts, so the mount table is consulted
    /// by a scheduled refresh rather than right away.
    pub fn update(&mut self, device: &BlockDevice) -> ManagerOutput {
        let mut out = ManagerOutput::default();
        let Some(id) = self.find_external(&device.device_path) else {
            return out;
        };

        let hints = ExternalHints::from(device);
        let changed = self.store.update(id, |r| {
            let before = r.clone();
            apply_device(r, device);
            if !r.is_mounted() {
                r.filesystem_type = hints.filesystem_type.clone();
                r.can_mount = hints.can_mount;
            }
            *r != before
        });
        self.hints.insert(id, hints);
        self.schedule_refresh();

        if changed == Some(true) {
            out.events.push(PartitionEvent::Changed(self.handle(id)));
        }
        out
    }

    /// Request a full reconciliation after the debounce interval.
    ///
    /// Further requests before it runs are folded into the same pass.
    pub fn schedule_refresh(&mut self) {
        if self.refresh_due.is_none() {
            self.refresh_due = Some(Instant::now() + self.refresh_debounce);
        }
    }

    pub fn refresh_deadline(&self) -> Option<Instant> {
        self.refresh_due
    }

    pub fn run_scheduled_refresh(&mut self) -> ManagerOutput {
        self.refresh_due = None;
        self.refresh(None)
    }

    /// Reconcile `subset`, or everything.
    pub fn refresh(&mut self, subset: Option<&[PartitionId]>) -> ManagerOutput {
        let ids: Vec<PartitionId> = match subset {
            Some(ids) => ids.to_vec(),
            None => self.order.clone(),
        };
        self.reconcile(&ids, false)
    }

    /// Reconcile one partition and announce it even if nothing changed.
    pub fn refresh_partition(&mut self, id: PartitionId) -> ManagerOutput {
        if !self.order.contains(&id) {
            return ManagerOutput::default();
        }
        self.reconcile(&[id], true)
    }

    fn reconcile(&mut self, ids: &[PartitionId], announce: bool) -> ManagerOutput {
        let mut out = ManagerOutput::default();
        let before: Vec<Option<PartitionRecord>> = ids.iter().map(|id| self.store.get(*id)).collect();

        for id in ids {
            let hints = self.hints.get(id);
            self.store.update(*id, |r| reset_transient(r, hints));
        }

        let entries = match self.mount_table.read() {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to read mount table: {e}");
                Vec::new()
            }
        };

        for (id, previous) in ids.iter().zip(before) {
            let Some(previous) = previous else {
                continue;
            };
            self.store.update(*id, |r| {
                if let Some(entry) = matching_entry(r, &entries) {
                    populate_from_mount(r, entry);
                    if previous.is_mounted() && previous.mount_path == r.mount_path {
                        r.bytes_total = previous.bytes_total;
                        r.bytes_available = previous.bytes_available;
                        r.bytes_free = previous.bytes_free;
                    }
                }
            });

            let Some(current) = self.store.get(*id) else {
                continue;
            };
            if announce || current != previous {
                out.events.push(PartitionEvent::Changed(self.handle(*id)));
            }
            if current.is_mounted() {
                out.probes.push(ProbeRequest {
                    mount_path: current.mount_path.clone(),
                    device_path: current.device_path.clone(),
                });
            }
        }

        out
    }

    /// Merge a capacity probe result. Results for paths no longer mounted
    /// are dropped.
    pub fn merge_probe(&mut self, probe: ProbeResult) -> Vec<PartitionEvent> {
        let Some(id) = self.order.iter().copied().find(|id| {
            self.store
                .read(*id, |r| r.is_mounted() && r.mount_path == probe.mount_path)
                .unwrap_or(false)
        }) else {
            debug!(mount_path = probe.mount_path, "Discarding stale capacity probe");
            return Vec::new();
        };

        let capacity = match probe.result {
            Ok(capacity) => capacity,
            Err(e) => {
                debug!(mount_path = probe.mount_path, "Capacity probe failed: {e}");
                Capacity {
                    read_only: self.store.read(id, |r| r.read_only).unwrap_or(false),
                    ..Capacity::unknown()
                }
            }
        };

        if self.store.update(id, |r| r.apply_capacity(&capacity)) == Some(true) {
            vec![PartitionEvent::Changed(self.handle(id))]
        } else {
            Vec::new()
        }
    }

    /// Optimistic status from job progress, ahead of the mount table.
    ///
    /// An encrypted entry is also reached through its backing device, which
    /// is what lock and unlock jobs name.
    pub fn apply_job(
        &mut self,
        operation: &JobOperation,
        device_paths: &[String],
        phase: JobPhase,
    ) -> ManagerOutput {
        let mut out = ManagerOutput::default();
        if matches!(operation, JobOperation::Other(_)) {
            return out;
        }

        for id in self.order.clone() {
            let changed = self.store.update(id, |r| {
                let affected = device_paths.iter().any(|path| {
                    *path == r.device_path
                        || (!r.crypto_backing_device_path.is_empty()
                            && *path == r.crypto_backing_device_path)
                });
                if !affected {
                    return false;
                }
                let before = r.clone();
                job_transition(operation, phase, r);
                *r != before
            });
            if changed == Some(true) {
                out.events.push(PartitionEvent::Changed(self.handle(id)));
            }
        }

        if phase != JobPhase::Added {
            self.schedule_refresh();
        }
        out
    }
}

fn apply_device(record: &mut PartitionRecord, device: &BlockDevice) {
    record.device_label = device.id_label.clone();
    record.is_encrypted = device.is_encrypted;
    record.crypto_backing_device_path = device.crypto_backing_device_path.clone();
    record.is_whole_disk = device.is_whole_disk();
    // A mounted entry takes read-only from its mount options.
    if !record.is_mounted() || device.read_only {
        record.read_only = device.read_only;
    }
    if device.drive != Default::default() {
        record.drive = device.drive.clone();
    }
}

fn reset_transient(record: &mut PartitionRecord, hints: Option<&ExternalHints>) {
    record.status = if record.active_state == ActiveState::Activating {
        PartitionStatus::Mounting
    } else {
        PartitionStatus::Unmounted
    };
    record.clear_capacity();
    record.can_mount = false;
    record.filesystem_type.clear();

    if record.is_internal() {
        record.device_path.clear();
        record.device_name.clear();
        record.read_only = false;
    } else {
        record.mount_path.clear();
        if let Some(hints) = hints {
            record.filesystem_type = hints.filesystem_type.clone();
            record.can_mount = hints.can_mount;
        }
    }
}

fn matching_entry<'a>(record: &PartitionRecord, entries: &'a [MountEntry]) -> Option<&'a MountEntry> {
    if record.is_internal() {
        // The last mount on a path is the visible one.
        entries.iter().rev().find(|e| e.mount_path == record.mount_path)
    } else {
        entries.iter().find(|e| e.device == record.device_path)
    }
}

fn populate_from_mount(record: &mut PartitionRecord, entry: &MountEntry) {
    record.device_path = entry.device.clone();
    record.device_name = device_name_of(&entry.device).to_string();
    record.mount_path = entry.mount_path.clone();
    record.filesystem_type = entry.filesystem_type.clone();
    record.can_mount = true;
    record.read_only = entry.is_read_only();
    record.status = if record.active_state == ActiveState::Deactivating {
        PartitionStatus::Unmounting
    } else {
        PartitionStatus::Mounted
    };
}

fn job_transition(operation: &JobOperation, phase: JobPhase, record: &mut PartitionRecord) {
    use PartitionStatus::*;

    let (running, done) = match operation {
        JobOperation::Mount => (Mounting, Mounted),
        JobOperation::Unmount => (Unmounting, Unmounted),
        JobOperation::Format => (Formatting, Formatted),
        JobOperation::Lock => (Locking, Locked),
        JobOperation::Unlock => (Unlocking, Unlocked),
        JobOperation::Other(_) => return,
    };

    match phase {
        JobPhase::Abandoned => {
            // Leave status to the next reconciliation.
            record.active_state = ActiveState::Unknown;
        }
        JobPhase::Added => {
            record.status = running;
            match operation {
                JobOperation::Mount => record.active_state = ActiveState::Activating,
                JobOperation::Unmount => record.active_state = ActiveState::Deactivating,
                _ => {}
            }
        }
        JobPhase::Completed { success: true, .. } => {
            record.status = done;
            match operation {
                JobOperation::Mount => {
                    record.active_state = ActiveState::Active;
                    record.mount_failed = false;
                }
                JobOperation::Unmount => {
                    record.active_state = ActiveState::Inactive;
                    record.mount_failed = false;
                }
                _ => {}
            }
        }
        JobPhase::Completed {
            success: false,
            busy: true,
        } if *operation == JobOperation::Unmount => {
            // Still mounted; the caller may retry.
            record.status = Mounted;
            record.active_state = ActiveState::Active;
            record.mount_failed = false;
        }
        JobPhase::Completed { success: false, .. } => match operation {
            JobOperation::Mount => {
                record.status = Unmounted;
                record.active_state = ActiveState::Failed;
                record.mount_failed = true;
            }
            JobOperation::Unmount => {
                record.status = Mounted;
                record.active_state = ActiveState::Failed;
                record.mount_failed = true;
            }
            _ => record.status = Unmounted,
        },
    }
}

/// Indices of `records` left after folding whole disks into their partitions.
///
/// A child takes its parent's slot; further children keep their own order.
pub(crate) fn collapsed_indices(records: &[PartitionRecord]) -> Vec<usize> {
    let mut kept: Vec<usize> = Vec::new();
    for (index, record) in records.iter().enumerate() {
        if let Some(slot) = kept.iter().position(|k| is_child_of(record, &records[*k])) {
            kept[slot] = index;
            continue;
        }
        if records[..index].iter().any(|earlier| is_child_of(earlier, record)) {
            continue;
        }
        kept.push(index);
    }
    kept
}

fn is_child_of(child: &PartitionRecord, parent: &PartitionRecord) -> bool {
    if !parent.is_whole_disk
        || child.is_whole_disk
        || parent.is_internal()
        || child.is_internal()
        || parent.device_name.is_empty()
    {
        return false;
    }
    child
        .device_name
        .strip_prefix(&parent.device_name)
        .map(|rest| rest.strip_prefix('p').unwrap_or(rest))
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}
