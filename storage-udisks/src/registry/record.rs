// SPDX-License-Identifier: GPL-3.0-only

use std::collections::HashMap;

use enumflags2::BitFlags;

use crate::dbus::properties::PropertyMap;
use crate::interfaces::Interface;

/// Everything known about one UDisks2 block object.
///
/// Properties arrive piecemeal: some with the add notification, the rest from
/// per-interface fetches. The record is complete once nothing is pending.
#[derive(Debug, Clone)]
pub struct BlockDeviceRecord {
    path: String,
    properties: HashMap<Interface, PropertyMap>,
    pending: BitFlags<Interface>,
    drive_object: Option<String>,
    drive_resolved: bool,
    completed: bool,
    pub(super) accepted: bool,
    formatting: bool,
    /// Encrypted backing record replaced by this cleartext device
    pub(super) superseded: Option<Box<BlockDeviceRecord>>,
}

impl BlockDeviceRecord {
    pub(super) fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            properties: HashMap::new(),
            pending: BitFlags::all(),
            drive_object: None,
            drive_resolved: false,
            completed: false,
            accepted: false,
            formatting: false,
            superseded: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn interface(&self, interface: Interface) -> Option<&PropertyMap> {
        self.properties.get(&interface)
    }

    pub fn pending(&self) -> BitFlags<Interface> {
        self.pending
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    pub fn is_formatting(&self) -> bool {
        self.formatting
    }

    pub fn drive_object(&self) -> Option<&str> {
        self.drive_object.as_deref()
    }

    pub fn superseded(&self) -> Option<&BlockDeviceRecord> {
        self.superseded.as_deref()
    }

    pub(super) fn set_formatting(&mut self, formatting: bool) {
        self.formatting = formatting;
    }

    /// Replace one interface's properties. Empty maps mean "not present".
    pub(super) fn set_interface(&mut self, interface: Interface, properties: PropertyMap) {
        if properties.is_empty() {
            self.properties.remove(&interface);
        } else {
            self.properties.insert(interface, properties);
        }
    }

    /// Patch properties of an interface the object already carries.
    pub(super) fn patch_interface(
        &mut self,
        interface: Interface,
        changed: PropertyMap,
        invalidated: &[String],
    ) {
        let entry = self.properties.entry(interface).or_default();
        entry.extend(changed);
        for name in invalidated {
            entry.remove(name);
        }
    }

    pub(super) fn remove_interface(&mut self, interface: Interface) -> bool {
        self.properties.remove(&interface).is_some()
    }

    /// Clear a pending flag. Returns false if it was not pending.
    pub(super) fn clear_pending(&mut self, interface: Interface) -> bool {
        let was_pending = self.pending.contains(interface);
        self.pending.remove(interface);
        was_pending
    }

    /// Decide the drive fetch once the block interface is known.
    ///
    /// Returns the drive object to fetch, if there is one.
    pub(super) fn resolve_drive(&mut self, drive_object: Option<String>) -> Option<String> {
        if self.drive_resolved {
            return None;
        }
        self.drive_resolved = true;

        match drive_object {
            Some(drive) if self.pending.contains(Interface::Drive) => {
                self.drive_object = Some(drive.clone());
                Some(drive)
            }
            Some(drive) => {
                self.drive_object = Some(drive);
                None
            }
            None => {
                self.pending.remove(Interface::Drive);
                None
            }
        }
    }

    pub(super) fn is_drive_resolved(&self) -> bool {
        self.drive_resolved
    }

    /// Mark completed if nothing is pending. True only on the transition.
    pub(super) fn try_complete(&mut self) -> bool {
        if self.completed || !self.pending.is_empty() {
            return false;
        }
        self.completed = true;
        true
    }
}
