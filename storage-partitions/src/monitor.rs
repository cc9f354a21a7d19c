// SPDX-License-Identifier: GPL-3.0-only

//! The UDisks2 side of the controller.
//!
//! Turns service signals into registry updates and job predictions, and
//! issues the operations callers ask for. Every service call runs in its own
//! task and reports back through the control channel; nothing here awaits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use storage_types::{FormatOptions, OperationError, OperationErrorKind, OperationKind};
use storage_udisks::{
    BlockDevice, BlockDeviceRegistry, DeviceLookup, FetchRequest, Interface, InterfaceMap,
    JOB_INTERFACE, Job, JobOperation, OperationRequest, PropertyMap, RegistryEvent,
    RegistryOutput, ServiceError, ServiceSignal, StorageBackend,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::{ControlEvent, OperationReply};
use crate::manager::JobPhase;
use crate::policy::AutomountPolicy;

/// An operation on one device, as requested by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceOperation {
    Mount,
    Unmount,
    Lock,
    Unlock { passphrase: String },
    Format {
        filesystem_type: String,
        options: FormatOptions,
    },
}

impl DeviceOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Mount => OperationKind::Mount,
            Self::Unmount => OperationKind::Unmount,
            Self::Lock => OperationKind::Lock,
            Self::Unlock { .. } => OperationKind::Unlock,
            Self::Format { .. } => OperationKind::Format,
        }
    }
}

/// What the partition manager has to learn from the service side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    DeviceAdded(BlockDevice),
    DeviceRemoved(BlockDevice),
    DeviceChanged(BlockDevice),
    DeviceMorphed {
        previous: BlockDevice,
        current: BlockDevice,
    },
    /// `device_paths` are the kernel devices of the job's objects
    Job {
        operation: JobOperation,
        device_paths: Vec<String>,
        phase: JobPhase,
    },
    ExternalsPopulated,
    WaiterStarted {
        path: String,
        generation: u64,
        timeout: Duration,
    },
}

/// A job and the devices its objects resolved to when it started. A
/// cleartext device may be gone by the time its lock job completes.
struct TrackedJob {
    job: Job,
    /// (object path, device path)
    targets: Vec<(String, String)>,
}

pub struct Monitor {
    registry: BlockDeviceRegistry,
    jobs: HashMap<String, TrackedJob>,
    /// Block object path to the job currently driving its status
    claims: HashMap<String, String>,
    backend: Arc<dyn StorageBackend>,
    policy: AutomountPolicy,
    control: mpsc::UnboundedSender<ControlEvent>,
    initial: Option<HashSet<String>>,
    populated: bool,
}

impl Monitor {
    pub(crate) fn new(
        backend: Arc<dyn StorageBackend>,
        policy: AutomountPolicy,
        waiter_timeout: Duration,
        control: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        Self {
            registry: BlockDeviceRegistry::new(waiter_timeout),
            jobs: HashMap::new(),
            claims: HashMap::new(),
            backend,
            policy,
            control,
            initial: None,
            populated: false,
        }
    }

    pub fn registry(&self) -> &BlockDeviceRegistry {
        &self.registry
    }

    pub fn is_populated(&self) -> bool {
        self.populated
    }

    /// Kick off the initial enumeration.
    pub(crate) fn start(&self) {
        let backend = self.backend.clone();
        let control = self.control.clone();
        tokio::spawn(async move {
            let result = backend.block_devices().await;
            if control.send(ControlEvent::Enumerated(result)).is_err() {
                debug!("Enumeration finished after the controller stopped");
            }
        });
    }

    pub(crate) fn enumerated(&mut self, result: Result<Vec<String>, ServiceError>) -> Vec<MonitorEvent> {
        let paths = match result {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Failed to enumerate block devices: {e}");
                self.populated = true;
                return vec![MonitorEvent::ExternalsPopulated];
            }
        };

        info!(count = paths.len(), "Enumerated block devices");
        self.initial = Some(paths.iter().cloned().collect());
        let mut out = RegistryOutput::default();
        for path in &paths {
            out.extend(self.registry.create_or_update(path, InterfaceMap::new()));
        }
        self.dispatch(out)
    }

    pub(crate) fn fetch_finished(
        &mut self,
        record_path: &str,
        interface: Interface,
        result: Result<PropertyMap, ServiceError>,
    ) -> Vec<MonitorEvent> {
        let out = self.registry.fetch_finished(record_path, interface, result);
        self.dispatch(out)
    }

    pub(crate) fn waiter_expired(&mut self, path: &str, generation: u64) -> Vec<MonitorEvent> {
        let out = self.registry.waiter_expired(path, generation);
        self.dispatch(out)
    }

    pub(crate) fn handle_signal(&mut self, signal: ServiceSignal) -> Vec<MonitorEvent> {
        match signal {
            ServiceSignal::InterfacesAdded {
                object_path,
                interfaces,
            } => {
                if let Some(properties) = interfaces.get(JOB_INTERFACE) {
                    return self.job_added(object_path, properties);
                }

                let interfaces: InterfaceMap = interfaces
                    .into_iter()
                    .filter_map(|(name, properties)| {
                        Interface::from_name(&name).map(|i| (i, properties))
                    })
                    .collect();
                let known = self.registry.record(&object_path).is_some();
                if interfaces.is_empty() || (!known && !interfaces.contains_key(&Interface::Block))
                {
                    return Vec::new();
                }
                let out = self.registry.create_or_update(&object_path, interfaces);
                self.dispatch(out)
            }
            ServiceSignal::InterfacesRemoved {
                object_path,
                interfaces,
            } => {
                if interfaces.iter().any(|name| name == JOB_INTERFACE) {
                    return self.drop_job(&object_path);
                }

                let interfaces: Vec<Interface> = interfaces
                    .iter()
                    .filter_map(|name| Interface::from_name(name))
                    .collect();
                if interfaces.is_empty() {
                    return Vec::new();
                }
                let out = self.registry.remove_interfaces(&object_path, &interfaces);
                self.dispatch(out)
            }
            ServiceSignal::PropertiesChanged {
                object_path,
                interface,
                changed,
                invalidated,
            } => {
                let out =
                    self.registry
                        .update_properties(&object_path, &interface, changed, &invalidated);
                self.dispatch(out)
            }
            ServiceSignal::JobCompleted {
                object_path,
                success,
                message,
            } => self.job_completed(&object_path, success, message),
        }
    }

    fn job_added(&mut self, path: String, properties: &PropertyMap) -> Vec<MonitorEvent> {
        let job = Job::from_properties(path.clone(), properties);
        if let JobOperation::Other(operation) = &job.operation {
            debug!(job = path, operation, "Ignoring job");
            return Vec::new();
        }

        let targets = self.job_targets(&job);
        for (object, _) in &targets {
            if let Some(previous) = self.claims.insert(object.clone(), path.clone())
                && previous != path
            {
                debug!(object, job = path, previous, "Newer job takes over device");
            }
        }
        let device_paths: Vec<String> = targets.iter().map(|(_, device)| device.clone()).collect();
        debug!(job = path, operation = ?job.operation, ?device_paths, "Job started");

        let operation = job.operation.clone();
        self.jobs.insert(path, TrackedJob { job, targets });
        if device_paths.is_empty() {
            return Vec::new();
        }
        vec![MonitorEvent::Job {
            operation,
            device_paths,
            phase: JobPhase::Added,
        }]
    }

    /// Resolve job objects to device paths. Object names are escaped by
    /// the service ("dm_2d0"), so only the registry knows the device.
    fn job_targets(&self, job: &Job) -> Vec<(String, String)> {
        job.objects
            .iter()
            .filter_map(|object| {
                let device = self
                    .registry
                    .device(object)
                    .filter(|device| !device.device_path.is_empty());
                if device.is_none() {
                    debug!(job = job.path, object, "Job object is not a known block device");
                }
                device.map(|device| (object.clone(), device.device_path))
            })
            .collect()
    }

    /// Device paths of `targets` still claimed by the job at `path`; the
    /// claims are released.
    fn release_claims(&mut self, path: &str, targets: Vec<(String, String)>) -> Vec<String> {
        let device_paths = targets
            .into_iter()
            .filter(|(object, _)| self.claims.get(object).is_some_and(|claim| claim == path))
            .map(|(_, device)| device)
            .collect();
        self.claims.retain(|_, claim| claim != path);
        device_paths
    }

    fn job_completed(&mut self, path: &str, success: bool, message: String) -> Vec<MonitorEvent> {
        let Some(TrackedJob { mut job, targets }) = self.jobs.remove(path) else {
            return Vec::new();
        };
        job.complete(success, message);
        let device_paths = self.release_claims(path, targets);

        if !success {
            if job.is_busy_failure() {
                info!(job = path, "Unmount refused, device is busy");
            } else {
                warn!(job = path, operation = ?job.operation, "Job failed: {}", job.message);
            }
        }
        if device_paths.is_empty() {
            return Vec::new();
        }

        vec![MonitorEvent::Job {
            operation: job.operation.clone(),
            device_paths,
            phase: JobPhase::Completed {
                success,
                busy: job.is_busy_failure(),
            },
        }]
    }

    /// A job object went away without a `Completed` signal.
    fn drop_job(&mut self, path: &str) -> Vec<MonitorEvent> {
        let Some(TrackedJob { job, targets }) = self.jobs.remove(path) else {
            self.claims.retain(|_, claim| claim != path);
            return Vec::new();
        };
        debug!(job = path, "Job vanished without completing");

        let device_paths = self.release_claims(path, targets);
        if device_paths.is_empty() {
            return Vec::new();
        }
        vec![MonitorEvent::Job {
            operation: job.operation,
            device_paths,
            phase: JobPhase::Abandoned,
        }]
    }

    /// Check `device_path` against the policy and issue `operation`.
    ///
    /// Rejections are answered on `reply` right away without contacting the
    /// service.
    pub(crate) fn request(
        &mut self,
        device_path: &str,
        operation: DeviceOperation,
        internal_devices: &[String],
        reply: OperationReply,
    ) -> Vec<MonitorEvent> {
        let kind = operation.kind();
        let planned = self
            .policy
            .check(&self.registry, device_path, internal_devices)
            .and_then(|lookup| plan(&lookup, operation));

        let (prelude, request) = match planned {
            Ok(plan) => plan,
            Err(e) => {
                warn!(device = device_path, "Refusing to {kind}: {e}");
                if reply.send(Err(e)).is_err() {
                    debug!("Caller went away before the rejection");
                }
                return Vec::new();
            }
        };

        info!(device = device_path, object = request.object_path(), "Requesting {kind}");
        let mut events = Vec::new();
        if let OperationRequest::Format { object_path, .. } = &request {
            let out = self.registry.set_formatting(object_path, true);
            events = self.dispatch(out);
        }

        let backend = self.backend.clone();
        let control = self.control.clone();
        let object_path = request.object_path().to_string();
        tokio::spawn(async move {
            let result = async {
                if let Some(prelude) = prelude {
                    backend.call(prelude).await?;
                }
                backend.call(request).await
            }
            .await;

            let finished = ControlEvent::OperationFinished {
                kind,
                object_path,
                result,
                reply,
            };
            if control.send(finished).is_err() {
                debug!("Operation finished after the controller stopped");
            }
        });

        events
    }

    pub(crate) fn operation_finished(
        &mut self,
        kind: OperationKind,
        object_path: &str,
        result: Result<(), ServiceError>,
        reply: OperationReply,
    ) -> Vec<MonitorEvent> {
        let mut events = Vec::new();
        if kind == OperationKind::Format {
            let out = self.registry.set_formatting(object_path, false);
            events = self.dispatch(out);
        }

        let result = result.map_err(|e| {
            let error = e.to_operation_error();
            if error.is_retryable() {
                info!(object = object_path, "Device busy, {kind} can be retried");
            } else {
                warn!(object = object_path, "Failed to {kind}: {e}");
            }
            error
        });
        if reply.send(result).is_err() {
            debug!(object = object_path, "Caller went away before {kind} finished");
        }
        events
    }

    fn dispatch(&mut self, out: RegistryOutput) -> Vec<MonitorEvent> {
        for fetch in out.fetches {
            self.spawn_fetch(fetch);
        }

        let mut events: Vec<MonitorEvent> = out
            .events
            .into_iter()
            .filter_map(|event| match event {
                RegistryEvent::Completed(_) => None,
                RegistryEvent::Accepted(device) => Some(MonitorEvent::DeviceAdded(device)),
                RegistryEvent::Updated(device) => Some(MonitorEvent::DeviceChanged(device)),
                RegistryEvent::Removed(device) => Some(MonitorEvent::DeviceRemoved(device)),
                RegistryEvent::Morphed { previous, current } => {
                    Some(MonitorEvent::DeviceMorphed { previous, current })
                }
                RegistryEvent::WaiterStarted {
                    path,
                    generation,
                    timeout,
                } => Some(MonitorEvent::WaiterStarted {
                    path,
                    generation,
                    timeout,
                }),
            })
            .collect();

        if !self.populated
            && let Some(initial) = &self.initial
            && initial.iter().all(|path| self.registry.is_settled(path))
        {
            info!("Initial block devices settled");
            self.populated = true;
            self.initial = None;
            events.push(MonitorEvent::ExternalsPopulated);
        }
        events
    }

    fn spawn_fetch(&self, fetch: FetchRequest) {
        let backend = self.backend.clone();
        let control = self.control.clone();
        tokio::spawn(async move {
            let result = backend.properties(fetch.object_path, fetch.interface).await;
            let finished = ControlEvent::FetchFinished {
                record_path: fetch.record_path,
                interface: fetch.interface,
                result,
            };
            if control.send(finished).is_err() {
                debug!("Fetch finished after the controller stopped");
            }
        });
    }
}

/// The service calls for `operation`: an optional unmount, then the call.
fn plan(
    lookup: &DeviceLookup,
    operation: DeviceOperation,
) -> Result<(Option<OperationRequest>, OperationRequest), OperationError> {
    let device = &lookup.device;
    let mounted = !device.mount_points.is_empty();
    let unmount_first = mounted.then(|| OperationRequest::Unmount {
        object_path: device.object_path.clone(),
    });

    match operation {
        DeviceOperation::Mount => Ok((
            None,
            OperationRequest::Mount {
                object_path: device.object_path.clone(),
            },
        )),
        DeviceOperation::Unmount => Ok((
            None,
            OperationRequest::Unmount {
                object_path: device.object_path.clone(),
            },
        )),
        DeviceOperation::Lock => {
            let Some(backing) = &lookup.backing else {
                return Err(OperationError::new(
                    OperationErrorKind::NotSupported,
                    format!("{} is not an unlocked device", device.device_path),
                ));
            };
            Ok((
                unmount_first,
                OperationRequest::Lock {
                    object_path: backing.object_path.clone(),
                },
            ))
        }
        DeviceOperation::Unlock { passphrase } => {
            if lookup.backing.is_some() {
                return Err(OperationError::new(
                    OperationErrorKind::Failed,
                    format!("{} is already unlocked", device.device_path),
                ));
            }
            if !device.is_encrypted {
                return Err(OperationError::new(
                    OperationErrorKind::NotSupported,
                    format!("{} is not encrypted", device.device_path),
                ));
            }
            Ok((
                None,
                OperationRequest::Unlock {
                    object_path: device.object_path.clone(),
                    passphrase,
                },
            ))
        }
        DeviceOperation::Format {
            filesystem_type,
            options,
        } => Ok((
            unmount_first,
            OperationRequest::Format {
                object_path: device.object_path.clone(),
                filesystem_type,
                options,
            },
        )),
    }
}
