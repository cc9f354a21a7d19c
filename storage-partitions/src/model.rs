// SPDX-License-Identifier: GPL-3.0-only

//! A filtered, ordered list view over partition events, for list displays.

use storage_types::{ConnectionBus, PartitionFilter, PartitionRecord};

use crate::event::PartitionEvent;
use crate::manager::collapsed_indices;
use crate::partition::Partition;

/// Filesystems offered for formatting, if their `mkfs` tool is installed.
const FORMAT_CANDIDATES: &[&str] = &["ext4", "exfat", "vfat", "ntfs", "btrfs", "xfs", "f2fs"];

/// How the visible rows changed after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelChange {
    Inserted(usize),
    Removed(usize),
    DataChanged(usize),
    Reset,
}

#[derive(Debug, Default)]
pub struct PartitionModel {
    filter: PartitionFilter,
    /// Every partition matching the filter's storage types, in display order
    entries: Vec<Partition>,
    rows: Vec<Partition>,
}

fn sort_key(record: &PartitionRecord) -> (bool, ConnectionBus) {
    (!record.is_internal(), record.drive.connection_bus)
}

impl PartitionModel {
    pub fn new(filter: PartitionFilter) -> Self {
        Self {
            filter,
            entries: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Replace the contents, typically with an unfiltered manager listing.
    pub fn reset(&mut self, partitions: Vec<Partition>) {
        self.entries = partitions
            .into_iter()
            .filter(|p| p.storage_type().is_some_and(|t| self.filter.matches(t)))
            .collect();
        self.rebuild_rows();
    }

    pub fn set_filter(&mut self, filter: PartitionFilter) {
        let all = std::mem::take(&mut self.entries);
        self.filter = filter;
        self.reset(all);
    }

    pub fn filter(&self) -> PartitionFilter {
        self.filter
    }

    pub fn rows(&self) -> &[Partition] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn rebuild_rows(&mut self) {
        self.rows = if self.filter.exclude_parents {
            let records: Vec<PartitionRecord> = self.entries.iter().map(Partition::snapshot).collect();
            collapsed_indices(&records)
                .into_iter()
                .map(|index| self.entries[index].clone())
                .collect()
        } else {
            self.entries.clone()
        };
    }

    pub fn apply(&mut self, event: &PartitionEvent) -> Option<ModelChange> {
        match event {
            PartitionEvent::Added(partition) => {
                let snapshot = partition.snapshot();
                if !partition.is_valid() || !self.filter.matches(snapshot.storage_type) {
                    return None;
                }
                if self.entries.contains(partition) {
                    return self.changed(partition);
                }

                let key = sort_key(&snapshot);
                let position = self
                    .entries
                    .iter()
                    .rposition(|e| sort_key(&e.snapshot()) <= key)
                    .map_or(0, |index| index + 1);
                self.entries.insert(position, partition.clone());
                self.rebuild_rows();
                Some(if self.filter.exclude_parents {
                    ModelChange::Reset
                } else {
                    ModelChange::Inserted(position)
                })
            }
            PartitionEvent::Removed { partition, .. } => {
                let position = self.entries.iter().position(|e| e == partition)?;
                self.entries.remove(position);
                self.rebuild_rows();
                Some(if self.filter.exclude_parents {
                    ModelChange::Reset
                } else {
                    ModelChange::Removed(position)
                })
            }
            PartitionEvent::Changed(partition) => self.changed(partition),
            PartitionEvent::ExternalsPopulated => None,
        }
    }

    fn changed(&mut self, partition: &Partition) -> Option<ModelChange> {
        if self.filter.exclude_parents && self.entries.contains(partition) {
            let before = self.rows.clone();
            self.rebuild_rows();
            if self.rows != before {
                return Some(ModelChange::Reset);
            }
        }
        self.rows
            .iter()
            .position(|row| row == partition)
            .map(ModelChange::DataChanged)
    }

    /// Filesystem types whose `mkfs.<type>` tool is on `PATH`.
    pub fn supported_format_types() -> Vec<String> {
        FORMAT_CANDIDATES
            .iter()
            .filter(|fs| which::which(format!("mkfs.{fs}")).is_ok())
            .map(|fs| fs.to_string())
            .collect()
    }
}
