// SPDX-License-Identifier: GPL-3.0-only

//! Block devices known to UDisks2, assembled from out-of-order notifications.
//!
//! The registry is a plain state machine: callers feed it notifications and
//! fetch results and act on the [`RegistryOutput`] it returns (issue the
//! requested fetches, start waiter timers, forward accepted devices).

mod record;
mod waiter;

use std::collections::HashMap;
use std::time::Duration;

use tracing::debug;

pub use record::BlockDeviceRecord;
pub use waiter::{DEFAULT_WAITER_TIMEOUT, PartitionWaiter};

use crate::block::BlockDevice;
use crate::dbus::properties::PropertyMap;
use crate::error::ServiceError;
use crate::interfaces::Interface;

/// Properties keyed by interface, as delivered with an add notification.
pub type InterfaceMap = HashMap<Interface, PropertyMap>;

/// A `GetAll` the registry needs answered via [`BlockDeviceRegistry::fetch_finished`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub record_path: String,
    /// Where to call `GetAll`; differs from `record_path` for the drive
    pub object_path: String,
    pub interface: Interface,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// All pending fetches of a record finished; fired once per record
    Completed(String),
    Accepted(BlockDevice),
    Updated(BlockDevice),
    Removed(BlockDevice),
    /// An accepted device now lives on another block object (unlock or lock)
    Morphed {
        previous: BlockDevice,
        current: BlockDevice,
    },
    WaiterStarted {
        path: String,
        generation: u64,
        timeout: Duration,
    },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RegistryOutput {
    pub fetches: Vec<FetchRequest>,
    pub events: Vec<RegistryEvent>,
}

impl RegistryOutput {
    pub fn is_empty(&self) -> bool {
        self.fetches.is_empty() && self.events.is_empty()
    }

    pub fn extend(&mut self, other: RegistryOutput) {
        self.fetches.extend(other.fetches);
        self.events.extend(other.events);
    }
}

/// An accepted device, together with the locked device it was unlocked from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLookup {
    pub device: BlockDevice,
    pub backing: Option<BlockDevice>,
}

#[derive(Debug)]
pub struct BlockDeviceRegistry {
    records: HashMap<String, BlockDeviceRecord>,
    waiters: HashMap<String, PartitionWaiter>,
    next_generation: u64,
    waiter_timeout: Duration,
}

impl Default for BlockDeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_WAITER_TIMEOUT)
    }
}

impl BlockDeviceRegistry {
    pub fn new(waiter_timeout: Duration) -> Self {
        Self {
            records: HashMap::new(),
            waiters: HashMap::new(),
            next_generation: 1,
            waiter_timeout,
        }
    }

    pub fn record(&self, path: &str) -> Option<&BlockDeviceRecord> {
        self.records.get(path)
    }

    pub fn device(&self, path: &str) -> Option<BlockDevice> {
        self.records.get(path).map(summary)
    }

    /// Whether a record is complete. Unknown paths count as settled.
    pub fn is_settled(&self, path: &str) -> bool {
        self.records.get(path).is_none_or(|r| r.is_completed())
    }

    pub fn has_waiter(&self, path: &str) -> bool {
        self.waiters.contains_key(path)
    }

    pub fn accepted_devices(&self) -> Vec<BlockDevice> {
        self.records
            .values()
            .filter(|r| r.is_accepted())
            .map(summary)
            .collect()
    }

    /// Find the record presenting `device_path`, directly or as the locked
    /// device behind an unlocked one.
    pub fn lookup(&self, device_path: &str) -> Option<DeviceLookup> {
        self.records.values().find_map(|record| {
            let device = summary(record);
            let backing = record.superseded().map(|b| summary(b));
            let matches = device.device_path == device_path
                || backing
                    .as_ref()
                    .is_some_and(|b| b.device_path == device_path);
            matches.then_some(DeviceLookup { device, backing })
        })
    }

    /// First sighting of an object, or more interfaces for a known one.
    pub fn create_or_update(&mut self, path: &str, interfaces: InterfaceMap) -> RegistryOutput {
        if self.records.contains_key(path) {
            return self.add_interfaces(path, interfaces);
        }

        let mut out = RegistryOutput::default();
        let mut record = BlockDeviceRecord::new(path);
        for (interface, properties) in interfaces {
            if interface == Interface::Drive {
                continue;
            }
            record.set_interface(interface, properties);
            record.clear_pending(interface);
        }

        for interface in Interface::block_object().iter() {
            if record.pending().contains(interface) {
                out.fetches.push(FetchRequest {
                    record_path: path.to_string(),
                    object_path: path.to_string(),
                    interface,
                });
            }
        }

        debug!(path, pending = ?record.pending(), "Tracking block device");
        self.records.insert(path.to_string(), record);
        self.resolve_drive(path, &mut out);
        self.check_completion(path, &mut out);
        out
    }

    pub fn fetch_finished(
        &mut self,
        record_path: &str,
        interface: Interface,
        result: Result<PropertyMap, ServiceError>,
    ) -> RegistryOutput {
        let mut out = RegistryOutput::default();
        let Some(record) = self.records.get_mut(record_path) else {
            return out;
        };
        if !record.clear_pending(interface) {
            return out;
        }

        match result {
            Ok(properties) => record.set_interface(interface, properties),
            Err(e) => debug!(
                path = record_path,
                "Fetching {} failed: {e}",
                interface.name()
            ),
        }

        self.resolve_drive(record_path, &mut out);
        self.check_completion(record_path, &mut out);
        out
    }

    pub fn add_interfaces(&mut self, path: &str, interfaces: InterfaceMap) -> RegistryOutput {
        if !self.records.contains_key(path) {
            return self.create_or_update(path, interfaces);
        }

        let mut out = RegistryOutput::default();
        let before = self.device(path);
        let Some(record) = self.records.get_mut(path) else {
            return out;
        };
        let was_completed = record.is_completed();
        for (interface, properties) in interfaces {
            if interface == Interface::Drive {
                continue;
            }
            record.set_interface(interface, properties);
            record.clear_pending(interface);
        }

        self.resolve_drive(path, &mut out);
        if was_completed {
            self.after_change(path, before, &mut out);
        } else {
            self.check_completion(path, &mut out);
        }
        out
    }

    /// Removing the block interface destroys the record.
    pub fn remove_interfaces(&mut self, path: &str, interfaces: &[Interface]) -> RegistryOutput {
        if interfaces.contains(&Interface::Block) {
            return self.remove(path);
        }

        let mut out = RegistryOutput::default();
        let before = self.device(path);
        let Some(record) = self.records.get_mut(path) else {
            return out;
        };
        let was_completed = record.is_completed();
        for interface in interfaces {
            record.remove_interface(*interface);
            record.clear_pending(*interface);
        }

        if was_completed {
            self.after_change(path, before, &mut out);
        } else {
            self.resolve_drive(path, &mut out);
            self.check_completion(path, &mut out);
        }
        out
    }

    pub fn update_properties(
        &mut self,
        path: &str,
        interface: &str,
        changed: PropertyMap,
        invalidated: &[String],
    ) -> RegistryOutput {
        let mut out = RegistryOutput::default();
        let Some(interface) = Interface::from_name(interface) else {
            return out;
        };
        if interface == Interface::Drive {
            return out;
        }

        if !self.records.contains_key(path) {
            if let Some(backing) = self.stashed_mut(path) {
                backing.patch_interface(interface, changed, invalidated);
            }
            return out;
        }

        let before = self.device(path);
        let Some(record) = self.records.get_mut(path) else {
            return out;
        };
        record.patch_interface(interface, changed, invalidated);
        if record.is_completed() {
            self.after_change(path, before, &mut out);
        }
        out
    }

    /// Flag a device as being formatted, which makes it acceptable.
    pub fn set_formatting(&mut self, path: &str, formatting: bool) -> RegistryOutput {
        let mut out = RegistryOutput::default();
        let before = self.device(path);
        let Some(record) = self.records.get_mut(path) else {
            return out;
        };
        if record.is_formatting() == formatting {
            return out;
        }
        record.set_formatting(formatting);
        if record.is_completed() {
            self.after_change(path, before, &mut out);
        }
        out
    }

    pub fn waiter_expired(&mut self, path: &str, generation: u64) -> RegistryOutput {
        let mut out = RegistryOutput::default();
        match self.waiters.get(path) {
            Some(waiter) if waiter.generation == generation => {}
            _ => return out,
        }
        self.waiters.remove(path);

        if self.has_children(path) {
            debug!(path, "Waiter superseded by a child partition");
            return out;
        }

        let device = self.device(path);
        if let (Some(record), Some(device)) = (self.records.get_mut(path), device)
            && !record.is_accepted()
            && !device.hint_ignore
        {
            debug!(path, "No partition claimed the device, accepting it");
            record.accepted = true;
            out.events.push(RegistryEvent::Accepted(device));
        }
        out
    }

    pub fn remove(&mut self, path: &str) -> RegistryOutput {
        let mut out = RegistryOutput::default();
        self.waiters.remove(path);

        let Some(mut record) = self.records.remove(path) else {
            for record in self.records.values_mut() {
                if record.superseded().is_some_and(|b| b.path() == path) {
                    debug!(path, "Dropping locked device behind {}", record.path());
                    record.superseded = None;
                }
            }
            return out;
        };

        let removed = summary(&record);
        debug!(path, "Block device removed");

        if let Some(backing) = record.superseded.take() {
            let mut backing = *backing;
            let backing_path = backing.path().to_string();
            if record.is_accepted() {
                backing.accepted = true;
                let current = summary(&backing);
                self.records.insert(backing_path, backing);
                out.events.push(RegistryEvent::Morphed {
                    previous: removed,
                    current,
                });
                return out;
            }

            self.records.insert(backing_path.clone(), backing);
            self.accept_if_acceptable(&backing_path, &mut out);
            return out;
        }

        if record.is_accepted() {
            out.events.push(RegistryEvent::Removed(removed));
        }
        out
    }

    fn stashed_mut(&mut self, path: &str) -> Option<&mut BlockDeviceRecord> {
        self.records
            .values_mut()
            .filter_map(|r| r.superseded.as_deref_mut())
            .find(|b| b.path() == path)
    }

    fn has_children(&self, path: &str) -> bool {
        self.records
            .values()
            .any(|r| summary(r).partition_table.as_deref() == Some(path))
    }

    /// Issue the drive fetch once the block interface has been settled.
    fn resolve_drive(&mut self, path: &str, out: &mut RegistryOutput) {
        let Some(record) = self.records.get_mut(path) else {
            return;
        };
        if record.is_drive_resolved() || record.pending().contains(Interface::Block) {
            return;
        }

        let drive = record
            .interface(Interface::Block)
            .and_then(BlockDevice::drive_object);
        if let Some(drive) = record.resolve_drive(drive) {
            out.fetches.push(FetchRequest {
                record_path: path.to_string(),
                object_path: drive,
                interface: Interface::Drive,
            });
        }
    }

    fn check_completion(&mut self, path: &str, out: &mut RegistryOutput) {
        let Some(record) = self.records.get_mut(path) else {
            return;
        };
        if !record.try_complete() {
            return;
        }

        out.events.push(RegistryEvent::Completed(path.to_string()));
        self.on_completed(path, out);
    }

    fn on_completed(&mut self, path: &str, out: &mut RegistryOutput) {
        let Some(device) = self.device(path) else {
            return;
        };

        if let Some(table) = device.partition_table.as_deref()
            && self.waiters.remove(table).is_some()
        {
            debug!(path, table, "Partition claims waiting device");
        }

        if let Some(backing_path) = device.crypto_backing_object.as_deref()
            && backing_path != path
            && let Some(backing) = self.records.remove(backing_path)
        {
            self.waiters.remove(backing_path);
            let previous = summary(&backing);
            let backing_accepted = backing.is_accepted();

            let Some(record) = self.records.get_mut(path) else {
                return;
            };
            record.superseded = Some(Box::new(backing));
            if backing_accepted {
                record.accepted = true;
                let current = summary(record);
                debug!(path, backing = backing_path, "Unlocked device replaces its backing device");
                out.events.push(RegistryEvent::Morphed { previous, current });
                return;
            }
        }

        if self.accept_if_acceptable(path, out) {
            return;
        }

        let Some(device) = self.device(path) else {
            return;
        };
        if device.hint_ignore {
            debug!(path, "Service hints to ignore the device");
            return;
        }
        if self.has_children(path) || self.waiters.contains_key(path) {
            return;
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.waiters
            .insert(path.to_string(), PartitionWaiter { generation });
        out.events.push(RegistryEvent::WaiterStarted {
            path: path.to_string(),
            generation,
            timeout: self.waiter_timeout,
        });
    }

    fn accept_if_acceptable(&mut self, path: &str, out: &mut RegistryOutput) -> bool {
        let Some(device) = self.device(path) else {
            return false;
        };
        let Some(record) = self.records.get_mut(path) else {
            return false;
        };
        if record.is_accepted() || !record.is_completed() || !device.is_acceptable() {
            return false;
        }

        record.accepted = true;
        self.waiters.remove(path);
        out.events.push(RegistryEvent::Accepted(device));
        true
    }

    fn after_change(&mut self, path: &str, before: Option<BlockDevice>, out: &mut RegistryOutput) {
        let Some(after) = self.device(path) else {
            return;
        };
        let accepted = self.records.get(path).is_some_and(|r| r.is_accepted());

        if accepted {
            if before.as_ref() != Some(&after) {
                out.events.push(RegistryEvent::Updated(after));
            }
        } else {
            self.accept_if_acceptable(path, out);
        }
    }
}

fn summary(record: &BlockDeviceRecord) -> BlockDevice {
    let backing_device_path = record
        .superseded()
        .map(|b| BlockDevice::from_record(b, "").device_path)
        .unwrap_or_default();
    BlockDevice::from_record(record, &backing_device_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbus::properties::PropValue;

    const SDB: &str = "/org/freedesktop/UDisks2/block_devices/sdb";
    const SDB1: &str = "/org/freedesktop/UDisks2/block_devices/sdb1";
    const DM0: &str = "/org/freedesktop/UDisks2/block_devices/dm_2d0";
    const DRIVE: &str = "/org/freedesktop/UDisks2/drives/Kingston_DataTraveler";

    fn block(device: &str, drive: &str) -> PropertyMap {
        let mut device_bytes = device.as_bytes().to_vec();
        device_bytes.push(0);
        PropertyMap::from([
            ("Device".to_string(), PropValue::Bytes(device_bytes)),
            ("Drive".to_string(), PropValue::ObjectPath(drive.to_string())),
            ("IdType".to_string(), PropValue::Str(String::new())),
            ("HintIgnore".to_string(), PropValue::Bool(false)),
        ])
    }

    fn partition_of(table: &str) -> PropertyMap {
        PropertyMap::from([(
            "Table".to_string(),
            PropValue::ObjectPath(table.to_string()),
        )])
    }

    fn filesystem() -> PropertyMap {
        PropertyMap::from([("MountPoints".to_string(), PropValue::ByteArrays(Vec::new()))])
    }

    /// Complete every outstanding fetch with an empty (not applicable) answer.
    fn finish_fetches(registry: &mut BlockDeviceRegistry, out: RegistryOutput) -> RegistryOutput {
        let mut collected = RegistryOutput {
            fetches: Vec::new(),
            events: out.events,
        };
        let mut queue = out.fetches;
        while let Some(fetch) = queue.pop() {
            let next =
                registry.fetch_finished(&fetch.record_path, fetch.interface, Ok(PropertyMap::new()));
            queue.extend(next.fetches);
            collected.events.extend(next.events);
        }
        collected
    }

    fn accepted_paths(events: &[RegistryEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                RegistryEvent::Accepted(device) => Some(device.object_path.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn fetches_missing_interfaces_and_then_the_drive() {
        let mut registry = BlockDeviceRegistry::default();
        let out = registry.create_or_update(
            SDB1,
            InterfaceMap::from([(Interface::Block, block("/dev/sdb1", DRIVE))]),
        );

        let fetched: Vec<Interface> = out.fetches.iter().map(|f| f.interface).collect();
        assert_eq!(fetched.len(), 5);
        assert!(fetched.contains(&Interface::Filesystem));
        assert!(fetched.contains(&Interface::Drive));
        assert!(!fetched.contains(&Interface::Block));

        let drive_fetch = out
            .fetches
            .iter()
            .find(|f| f.interface == Interface::Drive)
            .expect("drive fetch");
        assert_eq!(drive_fetch.object_path, DRIVE);
        assert_eq!(drive_fetch.record_path, SDB1);
        assert!(out.events.is_empty());
    }

    #[test]
    fn completes_exactly_once_even_when_fetches_fail() {
        let mut registry = BlockDeviceRegistry::default();
        let out = registry.create_or_update(
            SDB1,
            InterfaceMap::from([
                (Interface::Block, block("/dev/sdb1", "/")),
                (Interface::Partition, partition_of(SDB)),
            ]),
        );
        assert_eq!(out.fetches.len(), 3);

        let mut completed = 0;
        for fetch in &out.fetches {
            let next = registry.fetch_finished(
                &fetch.record_path,
                fetch.interface,
                Err(ServiceError::DBus("timeout".to_string())),
            );
            completed += next
                .events
                .iter()
                .filter(|e| matches!(e, RegistryEvent::Completed(_)))
                .count();
        }
        assert_eq!(completed, 1);

        // Late duplicate answers change nothing.
        let late = registry.fetch_finished(SDB1, Interface::Filesystem, Ok(filesystem()));
        assert!(late.is_empty());
        assert!(registry.is_settled(SDB1));
    }

    #[test]
    fn partitions_are_accepted_on_completion() {
        let mut registry = BlockDeviceRegistry::default();
        let out = registry.create_or_update(
            SDB1,
            InterfaceMap::from([
                (Interface::Block, block("/dev/sdb1", "/")),
                (Interface::Partition, partition_of(SDB)),
                (Interface::Filesystem, filesystem()),
            ]),
        );
        let out = finish_fetches(&mut registry, out);

        assert_eq!(accepted_paths(&out.events), vec![SDB1.to_string()]);
        let device = registry.device(SDB1).expect("device");
        assert!(device.is_partition);
        assert!(device.is_mountable);
        assert_eq!(device.device_path, "/dev/sdb1");
        assert_eq!(device.partition_table.as_deref(), Some(SDB));
    }

    #[test]
    fn ignored_devices_are_never_accepted() {
        let mut registry = BlockDeviceRegistry::default();
        let mut props = block("/dev/sdb1", "/");
        props.insert("HintIgnore".to_string(), PropValue::Bool(true));
        let out = registry.create_or_update(
            SDB1,
            InterfaceMap::from([
                (Interface::Block, props),
                (Interface::Filesystem, filesystem()),
            ]),
        );
        let out = finish_fetches(&mut registry, out);

        assert!(accepted_paths(&out.events).is_empty());
        assert!(
            !out.events
                .iter()
                .any(|e| matches!(e, RegistryEvent::WaiterStarted { .. }))
        );
    }

    #[test]
    fn bare_disk_waits_then_is_force_accepted() {
        let mut registry = BlockDeviceRegistry::new(Duration::from_millis(3000));
        let out = registry.create_or_update(
            SDB,
            InterfaceMap::from([(Interface::Block, block("/dev/sdb", "/"))]),
        );
        let out = finish_fetches(&mut registry, out);

        let generation = out
            .events
            .iter()
            .find_map(|e| match e {
                RegistryEvent::WaiterStarted {
                    path,
                    generation,
                    timeout,
                } => {
                    assert_eq!(path, SDB);
                    assert_eq!(*timeout, Duration::from_millis(3000));
                    Some(*generation)
                }
                _ => None,
            })
            .expect("waiter started");
        assert!(accepted_paths(&out.events).is_empty());

        assert!(registry.waiter_expired(SDB, generation + 1).is_empty());

        let expired = registry.waiter_expired(SDB, generation);
        assert_eq!(accepted_paths(&expired.events), vec![SDB.to_string()]);
        assert!(registry.waiter_expired(SDB, generation).is_empty());
    }

    #[test]
    fn child_partition_supersedes_waiter() {
        let mut registry = BlockDeviceRegistry::default();
        let out = registry.create_or_update(
            SDB,
            InterfaceMap::from([
                (Interface::Block, block("/dev/sdb", "/")),
                (Interface::PartitionTable, PropertyMap::from([(
                    "Type".to_string(),
                    PropValue::Str("gpt".to_string()),
                )])),
            ]),
        );
        let out = finish_fetches(&mut registry, out);
        let generation = out
            .events
            .iter()
            .find_map(|e| match e {
                RegistryEvent::WaiterStarted { generation, .. } => Some(*generation),
                _ => None,
            })
            .expect("waiter started");

        let out = registry.create_or_update(
            SDB1,
            InterfaceMap::from([
                (Interface::Block, block("/dev/sdb1", "/")),
                (Interface::Partition, partition_of(SDB)),
            ]),
        );
        finish_fetches(&mut registry, out);
        assert!(!registry.has_waiter(SDB));

        assert!(registry.waiter_expired(SDB, generation).is_empty());
        assert!(!registry.record(SDB).expect("record").is_accepted());
    }

    #[test]
    fn filesystem_toggle_updates_only_on_change() {
        let mut registry = BlockDeviceRegistry::default();
        let out = registry.create_or_update(
            SDB1,
            InterfaceMap::from([
                (Interface::Block, block("/dev/sdb1", "/")),
                (Interface::Partition, partition_of(SDB)),
            ]),
        );
        finish_fetches(&mut registry, out);
        assert!(!registry.device(SDB1).expect("device").is_mountable);

        let added =
            registry.add_interfaces(SDB1, InterfaceMap::from([(Interface::Filesystem, filesystem())]));
        assert!(matches!(
            added.events.as_slice(),
            [RegistryEvent::Updated(device)] if device.is_mountable
        ));

        let again =
            registry.add_interfaces(SDB1, InterfaceMap::from([(Interface::Filesystem, filesystem())]));
        assert!(again.events.is_empty());

        let removed = registry.remove_interfaces(SDB1, &[Interface::Filesystem]);
        assert!(matches!(
            removed.events.as_slice(),
            [RegistryEvent::Updated(device)] if !device.is_mountable
        ));
    }

    #[test]
    fn property_changes_patch_accepted_devices() {
        let mut registry = BlockDeviceRegistry::default();
        let out = registry.create_or_update(
            SDB1,
            InterfaceMap::from([
                (Interface::Block, block("/dev/sdb1", "/")),
                (Interface::Partition, partition_of(SDB)),
                (Interface::Filesystem, filesystem()),
            ]),
        );
        finish_fetches(&mut registry, out);

        let out = registry.update_properties(
            SDB1,
            Interface::Filesystem.name(),
            PropertyMap::from([(
                "MountPoints".to_string(),
                PropValue::ByteArrays(vec![b"/run/media/user/STICK\0".to_vec()]),
            )]),
            &[],
        );
        assert!(matches!(
            out.events.as_slice(),
            [RegistryEvent::Updated(device)] if device.mount_points == vec!["/run/media/user/STICK".to_string()]
        ));

        let unrelated = registry.update_properties(
            SDB1,
            "org.freedesktop.UDisks2.Job",
            PropertyMap::new(),
            &[],
        );
        assert!(unrelated.is_empty());
    }

    #[test]
    fn removing_block_interface_destroys_record() {
        let mut registry = BlockDeviceRegistry::default();
        let out = registry.create_or_update(
            SDB1,
            InterfaceMap::from([
                (Interface::Block, block("/dev/sdb1", "/")),
                (Interface::Partition, partition_of(SDB)),
            ]),
        );
        finish_fetches(&mut registry, out);

        let out = registry.remove_interfaces(SDB1, &[Interface::Block, Interface::Partition]);
        assert!(matches!(
            out.events.as_slice(),
            [RegistryEvent::Removed(device)] if device.object_path == SDB1
        ));
        assert!(registry.record(SDB1).is_none());
    }

    #[test]
    fn unlock_morphs_and_lock_restores() {
        let mut registry = BlockDeviceRegistry::default();
        let out = registry.create_or_update(
            SDB1,
            InterfaceMap::from([
                (Interface::Block, block("/dev/sdb1", "/")),
                (Interface::Partition, partition_of(SDB)),
                (Interface::Encrypted, PropertyMap::from([(
                    "CleartextDevice".to_string(),
                    PropValue::ObjectPath("/".to_string()),
                )])),
            ]),
        );
        finish_fetches(&mut registry, out);

        let mut cleartext = block("/dev/dm-0", "/");
        cleartext.insert(
            "CryptoBackingDevice".to_string(),
            PropValue::ObjectPath(SDB1.to_string()),
        );
        let out = registry.create_or_update(
            DM0,
            InterfaceMap::from([
                (Interface::Block, cleartext),
                (Interface::Filesystem, filesystem()),
            ]),
        );
        let out = finish_fetches(&mut registry, out);
        let morphed = out
            .events
            .iter()
            .find_map(|e| match e {
                RegistryEvent::Morphed { previous, current } => Some((previous, current)),
                _ => None,
            })
            .expect("morphed");
        assert_eq!(morphed.0.device_path, "/dev/sdb1");
        assert_eq!(morphed.1.device_path, "/dev/dm-0");
        assert_eq!(morphed.1.crypto_backing_device_path, "/dev/sdb1");
        assert!(registry.record(SDB1).is_none());

        let lookup = registry.lookup("/dev/sdb1").expect("found via backing");
        assert_eq!(lookup.device.object_path, DM0);
        assert_eq!(
            lookup.backing.map(|b| b.object_path).as_deref(),
            Some(SDB1)
        );

        let out = registry.remove(DM0);
        assert!(matches!(
            out.events.as_slice(),
            [RegistryEvent::Morphed { previous, current }]
                if previous.object_path == DM0 && current.object_path == SDB1
        ));
        assert!(registry.record(SDB1).expect("restored").is_accepted());
    }

    #[test]
    fn formatting_makes_a_bare_disk_acceptable() {
        let mut registry = BlockDeviceRegistry::default();
        let out = registry.create_or_update(
            SDB,
            InterfaceMap::from([(Interface::Block, block("/dev/sdb", "/"))]),
        );
        finish_fetches(&mut registry, out);

        let out = registry.set_formatting(SDB, true);
        assert_eq!(accepted_paths(&out.events), vec![SDB.to_string()]);
        assert!(!registry.has_waiter(SDB));
    }
}
