//! Partition data model
//!
//! A [`PartitionRecord`] is the backing record of one mount point or external
//! block device. Records are owned by the partition manager; everything else
//! reads them through handles.

use enumflags2::{BitFlags, bitflags};
use serde::{Deserialize, Serialize};

use crate::Capacity;

/// Where a partition lives from the user's point of view.
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// The root filesystem
    System = 0b0001,
    /// A separate home filesystem
    User = 0b0010,
    /// The single remaining internal filesystem when root and home are merged
    Mass = 0b0100,
    /// Removable media and other devices reported by the storage service
    External = 0b1000,
}

impl StorageType {
    pub fn internal() -> BitFlags<StorageType> {
        StorageType::System | StorageType::User | StorageType::Mass
    }

    pub fn is_internal(self) -> bool {
        Self::internal().contains(self)
    }
}

/// Mount state machine of a partition.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStatus {
    #[default]
    Unmounted,
    Mounting,
    Mounted,
    Unmounting,
    Formatting,
    Formatted,
    Unlocking,
    Unlocked,
    Locking,
    Locked,
}

/// Cached activation state, synthesized from job progress.
///
/// Reconciliation consults it so that a mount table scan does not undo an
/// in-flight mount or unmount.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveState {
    #[default]
    Unknown,
    Activating,
    Active,
    Deactivating,
    Inactive,
    Failed,
}

/// Connection bus of the drive carrying an external partition.
///
/// The declaration order is the display order of external partitions.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionBus {
    Sdio,
    Usb,
    Ieee1394,
    #[default]
    Unknown,
}

impl ConnectionBus {
    /// Parse the `ConnectionBus` property of a UDisks2 drive object.
    pub fn from_udisks(bus: &str) -> Self {
        match bus.trim().to_ascii_lowercase().as_str() {
            "sdio" => Self::Sdio,
            "usb" => Self::Usb,
            "ieee1394" => Self::Ieee1394,
            _ => Self::Unknown,
        }
    }
}

/// Drive metadata attached to external partitions
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveInfo {
    pub model: String,
    pub vendor: String,
    pub connection_bus: ConnectionBus,
}

/// Storage type mask plus the "exclude parents" modifier used by listings.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PartitionFilter {
    pub types: BitFlags<StorageType>,
    pub exclude_parents: bool,
}

impl PartitionFilter {
    pub fn new(types: impl Into<BitFlags<StorageType>>) -> Self {
        Self {
            types: types.into(),
            exclude_parents: false,
        }
    }

    pub fn any() -> Self {
        Self::new(BitFlags::<StorageType>::all())
    }

    pub fn internal() -> Self {
        Self::new(StorageType::internal())
    }

    pub fn external() -> Self {
        Self::new(StorageType::External)
    }

    /// Collapse a whole-disk entry into its child partition when both are listed.
    pub fn excluding_parents(mut self) -> Self {
        self.exclude_parents = true;
        self
    }

    pub fn matches(&self, storage_type: StorageType) -> bool {
        self.types.contains(storage_type)
    }
}

impl Default for PartitionFilter {
    fn default() -> Self {
        Self::any()
    }
}

/// Snapshot of one partition.
///
/// Byte counters are signed; `-1` means unknown.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRecord {
    pub storage_type: StorageType,
    pub status: PartitionStatus,
    pub active_state: ActiveState,
    pub device_path: String,
    pub device_name: String,
    pub device_label: String,
    pub mount_path: String,
    pub filesystem_type: String,
    pub bytes_total: i64,
    pub bytes_available: i64,
    pub bytes_free: i64,
    pub read_only: bool,
    pub can_mount: bool,
    pub mount_failed: bool,
    pub is_encrypted: bool,
    pub crypto_backing_device_path: String,
    pub is_whole_disk: bool,
    pub drive: DriveInfo,
}

impl PartitionRecord {
    /// Internal partitions are identified by their configured mount path.
    pub fn internal(storage_type: StorageType, mount_path: impl Into<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
            ..Self::empty(storage_type)
        }
    }

    /// External partitions are identified by their device path.
    pub fn external(device_path: impl Into<String>) -> Self {
        let device_path = device_path.into();
        Self {
            device_name: device_name_of(&device_path).to_string(),
            device_path,
            ..Self::empty(StorageType::External)
        }
    }

    fn empty(storage_type: StorageType) -> Self {
        Self {
            storage_type,
            status: PartitionStatus::Unmounted,
            active_state: ActiveState::Unknown,
            device_path: String::new(),
            device_name: String::new(),
            device_label: String::new(),
            mount_path: String::new(),
            filesystem_type: String::new(),
            bytes_total: -1,
            bytes_available: -1,
            bytes_free: -1,
            read_only: false,
            can_mount: false,
            mount_failed: false,
            is_encrypted: false,
            crypto_backing_device_path: String::new(),
            is_whole_disk: false,
            drive: DriveInfo::default(),
        }
    }

    pub fn is_internal(&self) -> bool {
        self.storage_type.is_internal()
    }

    pub fn is_mounted(&self) -> bool {
        self.status == PartitionStatus::Mounted
    }

    pub fn capacity(&self) -> Capacity {
        Capacity {
            bytes_total: self.bytes_total,
            bytes_available: self.bytes_available,
            bytes_free: self.bytes_free,
            read_only: self.read_only,
        }
    }

    /// Merge a probe result. Returns true if any counter changed.
    pub fn apply_capacity(&mut self, capacity: &Capacity) -> bool {
        if self.capacity() == *capacity {
            return false;
        }
        self.bytes_total = capacity.bytes_total;
        self.bytes_available = capacity.bytes_available;
        self.bytes_free = capacity.bytes_free;
        self.read_only = capacity.read_only;
        true
    }

    pub fn clear_capacity(&mut self) {
        self.bytes_total = -1;
        self.bytes_available = -1;
        self.bytes_free = -1;
    }
}

/// What a handle to a removed partition reports.
impl Default for PartitionRecord {
    fn default() -> Self {
        Self::empty(StorageType::External)
    }
}

/// Last path component of a device path ("/dev/sda1" -> "sda1").
pub fn device_name_of(device_path: &str) -> &str {
    device_path.rsplit('/').next().unwrap_or(device_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_order_puts_sdio_first_and_unknown_last() {
        let mut buses = vec![
            ConnectionBus::Unknown,
            ConnectionBus::Usb,
            ConnectionBus::Ieee1394,
            ConnectionBus::Sdio,
        ];
        buses.sort();
        assert_eq!(
            buses,
            vec![
                ConnectionBus::Sdio,
                ConnectionBus::Usb,
                ConnectionBus::Ieee1394,
                ConnectionBus::Unknown
            ]
        );
        assert_eq!(ConnectionBus::from_udisks("USB"), ConnectionBus::Usb);
        assert_eq!(ConnectionBus::from_udisks(""), ConnectionBus::Unknown);
    }

    #[test]
    fn filters_match_storage_types() {
        let internal = PartitionFilter::internal();
        assert!(internal.matches(StorageType::System));
        assert!(internal.matches(StorageType::Mass));
        assert!(!internal.matches(StorageType::External));
        assert!(!internal.exclude_parents);
        assert!(PartitionFilter::external().excluding_parents().exclude_parents);
    }

    #[test]
    fn external_records_start_unknown() {
        let record = PartitionRecord::external("/dev/mmcblk1p1");
        assert_eq!(record.device_name, "mmcblk1p1");
        assert_eq!(record.status, PartitionStatus::Unmounted);
        assert_eq!(record.bytes_total, -1);
        assert!(!record.is_internal());
    }

    #[test]
    fn apply_capacity_reports_changes_only() {
        let mut record = PartitionRecord::internal(StorageType::System, "/");
        let capacity = Capacity {
            bytes_total: 1000,
            bytes_available: 300,
            bytes_free: 400,
            read_only: false,
        };
        assert!(record.apply_capacity(&capacity));
        assert!(!record.apply_capacity(&capacity));
        assert_eq!(record.bytes_free, 400);
    }
}
