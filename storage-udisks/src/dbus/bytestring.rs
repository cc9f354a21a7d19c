// SPDX-License-Identifier: GPL-3.0-only

//! UDisks2 reports paths as NUL-terminated byte arrays (`ay`).

/// Decode up to the first NUL byte, replacing invalid UTF-8.
pub fn decode_c_string_bytes(bytes: &[u8]) -> String {
    let raw = bytes.split(|b| *b == 0).next().unwrap_or(bytes);
    String::from_utf8_lossy(raw).into_owned()
}

/// Decode `Filesystem.MountPoints` (`aay`), dropping empty entries.
pub fn decode_mount_points(mount_points: &[Vec<u8>]) -> Vec<String> {
    mount_points
        .iter()
        .map(|mp| decode_c_string_bytes(mp))
        .filter(|decoded| !decoded.is_empty())
        .collect()
}
