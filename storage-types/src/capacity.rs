use serde::{Deserialize, Serialize};

/// Capacity of a mounted filesystem as seen by the calling user.
///
/// All counters are bytes; `-1` means unknown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    pub bytes_total: i64,
    pub bytes_available: i64,
    pub bytes_free: i64,
    pub read_only: bool,
}

impl Capacity {
    pub fn unknown() -> Self {
        Self {
            bytes_total: -1,
            bytes_available: -1,
            bytes_free: -1,
            read_only: false,
        }
    }

    pub fn is_known(&self) -> bool {
        self.bytes_total >= 0
    }
}

impl Default for Capacity {
    fn default() -> Self {
        Self::unknown()
    }
}
