// SPDX-License-Identifier: GPL-3.0-only

use storage_types::{ConnectionBus, DriveInfo, device_name_of};

use crate::dbus::properties::PropertyMap;
use crate::interfaces::Interface;
use crate::registry::BlockDeviceRecord;

/// Summary of a block device as the partition layer sees it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockDevice {
    pub object_path: String,
    pub device_path: String,
    pub device_name: String,
    pub id_type: String,
    pub id_label: String,
    pub read_only: bool,
    pub size: u64,
    pub hint_ignore: bool,
    pub hint_system: bool,
    pub hint_auto: bool,
    pub is_partition: bool,
    /// Object path of the partition table this partition belongs to
    pub partition_table: Option<String>,
    pub has_partition_table: bool,
    pub is_mountable: bool,
    pub mount_points: Vec<String>,
    pub is_encrypted: bool,
    /// Object path of the encrypted device this cleartext device unlocks
    pub crypto_backing_object: Option<String>,
    pub crypto_backing_device_path: String,
    pub drive: DriveInfo,
    pub is_formatting: bool,
}

fn string_prop(props: Option<&PropertyMap>, name: &str) -> String {
    props
        .and_then(|p| p.get(name))
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn bool_prop(props: Option<&PropertyMap>, name: &str) -> bool {
    props
        .and_then(|p| p.get(name))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// "/" is UDisks2's null object path.
fn object_prop(props: Option<&PropertyMap>, name: &str) -> Option<String> {
    let value = string_prop(props, name);
    (!value.is_empty() && value != "/").then_some(value)
}

impl BlockDevice {
    pub fn from_record(record: &BlockDeviceRecord, crypto_backing_device_path: &str) -> Self {
        let block = record.interface(Interface::Block);
        let partition = record.interface(Interface::Partition);
        let filesystem = record.interface(Interface::Filesystem);
        let drive = record.interface(Interface::Drive);

        let device_path = ["PreferredDevice", "Device"]
            .iter()
            .filter_map(|name| block.and_then(|b| b.get(*name)))
            .filter_map(|v| v.as_bytestring())
            .find(|path| !path.is_empty())
            .unwrap_or_default();

        let mount_points = filesystem
            .and_then(|f| f.get("MountPoints"))
            .map(|v| v.as_strings())
            .unwrap_or_default();

        Self {
            object_path: record.path().to_string(),
            device_name: device_name_of(&device_path).to_string(),
            device_path,
            id_type: string_prop(block, "IdType"),
            id_label: string_prop(block, "IdLabel"),
            read_only: bool_prop(block, "ReadOnly"),
            size: block
                .and_then(|b| b.get("Size"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            hint_ignore: bool_prop(block, "HintIgnore"),
            hint_system: bool_prop(block, "HintSystem"),
            hint_auto: bool_prop(block, "HintAuto"),
            is_partition: partition.is_some(),
            partition_table: object_prop(partition, "Table"),
            has_partition_table: record.interface(Interface::PartitionTable).is_some(),
            is_mountable: filesystem.is_some(),
            mount_points,
            is_encrypted: record.interface(Interface::Encrypted).is_some(),
            crypto_backing_object: object_prop(block, "CryptoBackingDevice"),
            crypto_backing_device_path: crypto_backing_device_path.to_string(),
            drive: DriveInfo {
                model: string_prop(drive, "Model"),
                vendor: string_prop(drive, "Vendor"),
                connection_bus: ConnectionBus::from_udisks(&string_prop(drive, "ConnectionBus")),
            },
            is_formatting: record.is_formatting(),
        }
    }

    /// Object path of the drive carrying this block device, if any.
    pub fn drive_object(properties: &PropertyMap) -> Option<String> {
        object_prop(Some(properties), "Drive")
    }

    /// Whether the registry hands this device to the partition layer.
    pub fn is_acceptable(&self) -> bool {
        !self.hint_ignore
            && (self.is_partition || self.is_mountable || self.is_encrypted || self.is_formatting)
    }

    pub fn is_whole_disk(&self) -> bool {
        !self.is_partition
    }
}
