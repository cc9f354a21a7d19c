// SPDX-License-Identifier: GPL-3.0-only

//! Owned, transport-independent copies of UDisks2 property values.
//!
//! The registry merges property maps from `GetAll`, `InterfacesAdded` and
//! `PropertiesChanged`; keeping them as plain Rust values lets it stay free of
//! D-Bus types and makes it testable without a bus.

use std::collections::HashMap;

use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use super::bytestring::{decode_c_string_bytes, decode_mount_points};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Str(String),
    ObjectPath(String),
    Bytes(Vec<u8>),
    ByteArrays(Vec<Vec<u8>>),
    Strings(Vec<String>),
    Unsupported,
}

/// Property name to value, for one interface of one object
pub type PropertyMap = HashMap<String, PropValue>;

impl PropValue {
    pub fn from_owned(value: &OwnedValue) -> Self {
        match &**value {
            Value::Bool(v) => Self::Bool(*v),
            Value::U8(v) => Self::UInt(u64::from(*v)),
            Value::U16(v) => Self::UInt(u64::from(*v)),
            Value::U32(v) => Self::UInt(u64::from(*v)),
            Value::U64(v) => Self::UInt(*v),
            Value::I16(v) => Self::Int(i64::from(*v)),
            Value::I32(v) => Self::Int(i64::from(*v)),
            Value::I64(v) => Self::Int(*v),
            Value::Str(v) => Self::Str(v.as_str().to_string()),
            Value::ObjectPath(v) => Self::ObjectPath(v.as_str().to_string()),
            Value::Array(_) => Self::from_array(value),
            _ => Self::Unsupported,
        }
    }

    fn from_array(value: &OwnedValue) -> Self {
        if let Ok(bytes) = Vec::<u8>::try_from(value.clone()) {
            return Self::Bytes(bytes);
        }
        if let Ok(arrays) = Vec::<Vec<u8>>::try_from(value.clone()) {
            return Self::ByteArrays(arrays);
        }
        if let Ok(strings) = Vec::<String>::try_from(value.clone()) {
            return Self::Strings(strings);
        }
        if let Ok(paths) = Vec::<OwnedObjectPath>::try_from(value.clone()) {
            return Self::Strings(paths.iter().map(|p| p.as_str().to_string()).collect());
        }
        Self::Unsupported
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) | Self::ObjectPath(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::UInt(v) => Some(*v),
            Self::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    /// Decode a NUL-terminated `ay` value.
    pub fn as_bytestring(&self) -> Option<String> {
        match self {
            Self::Bytes(bytes) => Some(decode_c_string_bytes(bytes)),
            _ => None,
        }
    }

    /// Decode an `aay`, `as` or `ao` value. An empty array of any type is empty.
    pub fn as_strings(&self) -> Vec<String> {
        match self {
            Self::ByteArrays(arrays) => decode_mount_points(arrays),
            Self::Strings(strings) => strings.clone(),
            _ => Vec::new(),
        }
    }
}

pub fn property_map(properties: &HashMap<String, OwnedValue>) -> PropertyMap {
    properties
        .iter()
        .map(|(name, value)| (name.clone(), PropValue::from_owned(value)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(value: Value<'_>) -> OwnedValue {
        value.try_into().expect("value should convert into OwnedValue")
    }

    #[test]
    fn converts_scalars() {
        assert_eq!(
            PropValue::from_owned(&OwnedValue::from(true)),
            PropValue::Bool(true)
        );
        assert_eq!(
            PropValue::from_owned(&OwnedValue::from(4096_u64)),
            PropValue::UInt(4096)
        );
        assert_eq!(
            PropValue::from_owned(&owned(Value::from("vfat"))).as_str(),
            Some("vfat")
        );
    }

    #[test]
    fn converts_bytestrings() {
        let value = owned(Value::from(b"/dev/sdb1\0".to_vec()));
        assert_eq!(
            PropValue::from_owned(&value).as_bytestring().as_deref(),
            Some("/dev/sdb1")
        );
    }

    #[test]
    fn unsigned_accessor_accepts_non_negative_ints() {
        assert_eq!(PropValue::Int(7).as_u64(), Some(7));
        assert_eq!(PropValue::Int(-1).as_u64(), None);
        assert_eq!(PropValue::Str("7".into()).as_u64(), None);
    }

    #[test]
    fn empty_arrays_decode_to_no_strings() {
        assert!(PropValue::Bytes(Vec::new()).as_strings().is_empty());
        assert_eq!(
            PropValue::ByteArrays(vec![b"/mnt\0".to_vec()]).as_strings(),
            vec!["/mnt".to_string()]
        );
    }
}
