// SPDX-License-Identifier: GPL-3.0-only

//! Kernel mount table access.
//!
//! Accepts both the `/proc/mounts` (fstab-like) format and the richer
//! `/proc/self/mountinfo` format. Malformed lines are skipped.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_MOUNT_TABLE: &str = "/proc/mounts";

/// One mounted filesystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    pub device: String,
    pub mount_path: String,
    pub filesystem_type: String,
    pub options: Vec<String>,
}

impl MountEntry {
    pub fn is_read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }
}

/// Source of mount table snapshots.
pub trait MountTable: Send + Sync {
    fn read(&self) -> Result<Vec<MountEntry>>;
}

/// Mount table backed by a procfs file
#[derive(Debug, Clone)]
pub struct ProcMountTable {
    path: PathBuf,
}

impl ProcMountTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcMountTable {
    fn default() -> Self {
        Self::new(DEFAULT_MOUNT_TABLE)
    }
}

impl MountTable for ProcMountTable {
    fn read(&self) -> Result<Vec<MountEntry>> {
        let content = fs::read_to_string(&self.path)?;
        Ok(parse_mount_table(&content))
    }
}

pub fn parse_mount_table(input: &str) -> Vec<MountEntry> {
    input
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let entry = if line.contains(" - ") {
                parse_mountinfo_line(line)
            } else {
                parse_mounts_line(line)
            };
            if entry.is_none() {
                tracing::debug!("Skipping malformed mount table line: {line}");
            }
            entry
        })
        .collect()
}

// device mount_path fstype options dump pass
fn parse_mounts_line(line: &str) -> Option<MountEntry> {
    let mut fields = line.split_whitespace();
    let device = fields.next()?;
    let mount_path = fields.next()?;
    let filesystem_type = fields.next()?;
    let options = fields.next().unwrap_or_default();

    Some(MountEntry {
        device: unescape_mount_field(device),
        mount_path: unescape_mount_field(mount_path),
        filesystem_type: filesystem_type.to_string(),
        options: split_options(options),
    })
}

// id parent major:minor root mount_path options [optional...] - fstype source super_options
fn parse_mountinfo_line(line: &str) -> Option<MountEntry> {
    let (left, right) = line.split_once(" - ")?;

    let mut left_fields = left.split_whitespace();
    let mount_path = left_fields.nth(4)?;
    let mount_options = left_fields.next().unwrap_or_default();

    let mut right_fields = right.split_whitespace();
    let filesystem_type = right_fields.next()?;
    let device = right_fields.next()?;

    Some(MountEntry {
        device: unescape_mount_field(device),
        mount_path: unescape_mount_field(mount_path),
        filesystem_type: filesystem_type.to_string(),
        options: split_options(mount_options),
    })
}

fn split_options(options: &str) -> Vec<String> {
    options
        .split(',')
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect()
}

/// Undo the kernel's octal escapes. Decoding works on bytes so that UTF-8
/// names, escaped or not, come back intact.
fn unescape_mount_field(value: &str) -> String {
    let mut output: Vec<u8> = Vec::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'\\'
            && index + 3 < bytes.len()
            && bytes[index + 1].is_ascii_digit()
            && bytes[index + 2].is_ascii_digit()
            && bytes[index + 3].is_ascii_digit()
        {
            let octal = &value[index + 1..index + 4];
            if let Ok(num) = u8::from_str_radix(octal, 8) {
                output.push(num);
                index += 4;
                continue;
            }
        }

        output.push(bytes[index]);
        index += 1;
    }

    String::from_utf8_lossy(&output).into_owned()
}
