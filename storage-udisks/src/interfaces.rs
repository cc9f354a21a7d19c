// SPDX-License-Identifier: GPL-3.0-only

use enumflags2::{BitFlags, bitflags};

pub const UDISKS2_SERVICE: &str = "org.freedesktop.UDisks2";
pub const UDISKS2_ROOT: &str = "/org/freedesktop/UDisks2";
pub const JOB_INTERFACE: &str = "org.freedesktop.UDisks2.Job";

/// UDisks2 interfaces a block device record is assembled from.
#[bitflags]
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Interface {
    Block = 0b00_0001,
    Filesystem = 0b00_0010,
    Encrypted = 0b00_0100,
    Partition = 0b00_1000,
    PartitionTable = 0b01_0000,
    /// Lives on the drive object named by `Block.Drive`
    Drive = 0b10_0000,
}

impl Interface {
    pub fn name(self) -> &'static str {
        match self {
            Self::Block => "org.freedesktop.UDisks2.Block",
            Self::Filesystem => "org.freedesktop.UDisks2.Filesystem",
            Self::Encrypted => "org.freedesktop.UDisks2.Encrypted",
            Self::Partition => "org.freedesktop.UDisks2.Partition",
            Self::PartitionTable => "org.freedesktop.UDisks2.PartitionTable",
            Self::Drive => "org.freedesktop.UDisks2.Drive",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        BitFlags::<Interface>::all()
            .iter()
            .find(|iface| iface.name() == name)
    }

    /// Interfaces fetched from the block object itself.
    pub fn block_object() -> BitFlags<Interface> {
        Interface::Block
            | Interface::Filesystem
            | Interface::Encrypted
            | Interface::Partition
            | Interface::PartitionTable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_roundtrip() {
        for iface in BitFlags::<Interface>::all().iter() {
            assert_eq!(Interface::from_name(iface.name()), Some(iface));
        }
        assert_eq!(Interface::from_name(JOB_INTERFACE), None);
        assert_eq!(Interface::block_object().len(), 5);
    }
}
