// SPDX-License-Identifier: GPL-3.0-only

//! Test doubles for the kernel and the storage service.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use storage_sys::{CapacityProbe, MountEntry, MountTable, SysError, parse_mount_table};
use storage_types::Capacity;
use storage_udisks::{Interface, OperationRequest, PropValue, PropertyMap, ServiceError, StorageBackend};

pub(crate) const BLOCK_DEVICES: &str = "/org/freedesktop/UDisks2/block_devices";
pub(crate) const USB_DRIVE: &str = "/org/freedesktop/UDisks2/drives/Kingston_DataTraveler";

pub(crate) fn object_path(device_name: &str) -> String {
    format!("{BLOCK_DEVICES}/{device_name}")
}

pub(crate) fn block(device: &str, drive: &str) -> PropertyMap {
    let mut device_bytes = device.as_bytes().to_vec();
    device_bytes.push(0);
    PropertyMap::from([
        ("Device".to_string(), PropValue::Bytes(device_bytes)),
        ("Drive".to_string(), PropValue::ObjectPath(drive.to_string())),
        ("IdType".to_string(), PropValue::Str("vfat".to_string())),
        ("IdLabel".to_string(), PropValue::Str(String::new())),
        ("HintIgnore".to_string(), PropValue::Bool(false)),
        ("HintSystem".to_string(), PropValue::Bool(false)),
        ("HintAuto".to_string(), PropValue::Bool(true)),
    ])
}

pub(crate) fn filesystem(mount_points: &[&str]) -> PropertyMap {
    let arrays = mount_points
        .iter()
        .map(|m| {
            let mut bytes = m.as_bytes().to_vec();
            bytes.push(0);
            bytes
        })
        .collect();
    PropertyMap::from([("MountPoints".to_string(), PropValue::ByteArrays(arrays))])
}

pub(crate) fn partition_of(table: &str) -> PropertyMap {
    PropertyMap::from([("Table".to_string(), PropValue::ObjectPath(table.to_string()))])
}

pub(crate) fn drive(bus: &str) -> PropertyMap {
    PropertyMap::from([
        ("Model".to_string(), PropValue::Str("DataTraveler".to_string())),
        ("Vendor".to_string(), PropValue::Str("Kingston".to_string())),
        ("ConnectionBus".to_string(), PropValue::Str(bus.to_string())),
    ])
}

pub(crate) fn job(operation: &str, objects: &[String]) -> PropertyMap {
    PropertyMap::from([
        ("Operation".to_string(), PropValue::Str(operation.to_string())),
        ("Objects".to_string(), PropValue::Strings(objects.to_vec())),
    ])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    BlockDevices,
    Properties(String, Interface),
    Operation(OperationRequest),
}

#[derive(Clone)]
pub(crate) struct FakeBackend {
    calls: Arc<Mutex<Vec<Call>>>,
    objects: Arc<Mutex<BTreeMap<String, HashMap<Interface, PropertyMap>>>>,
    enumerate_error: Arc<Mutex<Option<ServiceError>>>,
    call_result: Arc<Mutex<Result<(), ServiceError>>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            objects: Arc::new(Mutex::new(BTreeMap::new())),
            enumerate_error: Arc::new(Mutex::new(None)),
            call_result: Arc::new(Mutex::new(Ok(()))),
        }
    }
}

impl FakeBackend {
    /// Register an object; drives are looked up by path like block devices.
    pub(crate) fn add_object(&self, path: &str, interfaces: HashMap<Interface, PropertyMap>) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.to_string(), interfaces);
    }

    pub(crate) fn set_enumerate_error(&self, error: ServiceError) {
        *self.enumerate_error.lock().unwrap() = Some(error);
    }

    pub(crate) fn set_call_result(&self, result: Result<(), ServiceError>) {
        *self.call_result.lock().unwrap() = result;
    }

    pub(crate) fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub(crate) fn operations(&self) -> Vec<OperationRequest> {
        self.take_calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Operation(request) => Some(request),
                _ => None,
            })
            .collect()
    }
}

impl StorageBackend for FakeBackend {
    fn block_devices(&self) -> BoxFuture<'_, storage_udisks::Result<Vec<String>>> {
        self.calls.lock().unwrap().push(Call::BlockDevices);
        let result = match self.enumerate_error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, interfaces)| interfaces.contains_key(&Interface::Block))
                .map(|(path, _)| path.clone())
                .collect()),
        };
        Box::pin(async move { result })
    }

    fn properties(
        &self,
        object_path: String,
        interface: Interface,
    ) -> BoxFuture<'_, storage_udisks::Result<PropertyMap>> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Properties(object_path.clone(), interface));
        let properties = self
            .objects
            .lock()
            .unwrap()
            .get(&object_path)
            .and_then(|interfaces| interfaces.get(&interface).cloned())
            .unwrap_or_default();
        Box::pin(async move { Ok(properties) })
    }

    fn call(&self, request: OperationRequest) -> BoxFuture<'_, storage_udisks::Result<()>> {
        self.calls.lock().unwrap().push(Call::Operation(request));
        let result = self.call_result.lock().unwrap().clone();
        Box::pin(async move { result })
    }
}

/// Mount table whose content can be swapped between reads; `None` fails.
pub(crate) struct FakeMountTable {
    content: Mutex<Option<String>>,
    reads: AtomicUsize,
}

impl FakeMountTable {
    pub(crate) fn new(content: &str) -> Arc<Self> {
        Arc::new(Self {
            content: Mutex::new(Some(content.to_string())),
            reads: AtomicUsize::new(0),
        })
    }

    pub(crate) fn set(&self, content: Option<&str>) {
        *self.content.lock().unwrap() = content.map(str::to_string);
    }

    pub(crate) fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl MountTable for FakeMountTable {
    fn read(&self) -> storage_sys::Result<Vec<MountEntry>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        match self.content.lock().unwrap().as_deref() {
            Some(content) => Ok(parse_mount_table(content)),
            None => Err(SysError::Io(std::io::Error::from(
                std::io::ErrorKind::NotFound,
            ))),
        }
    }
}

/// Probe reporting the same capacity for every mount path.
pub(crate) struct FixedProbe(pub Capacity);

impl CapacityProbe for FixedProbe {
    fn probe(&self, _mount_path: &str, _device_path: &str) -> storage_sys::Result<Capacity> {
        Ok(self.0)
    }
}
