use serde::{Deserialize, Serialize};

/// Privileged operations the monitor can request from the storage service.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Mount,
    Unmount,
    Lock,
    Unlock,
    Format,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mount => "mount",
            Self::Unmount => "unmount",
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::Format => "format",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for formatting a block device
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    pub label: Option<String>,
    /// Overwrite existing data with zeroes before creating the filesystem
    pub erase: bool,
    /// Wrap the new filesystem in a LUKS container with this passphrase
    pub encrypt_passphrase: Option<String>,
    /// Make the calling user own the filesystem root
    pub take_ownership: bool,
}
