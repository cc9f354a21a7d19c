// SPDX-License-Identifier: GPL-3.0-only

//! The control task.
//!
//! [`Controller::run`] owns the partition manager and the monitor. Caller
//! requests, service signals and results of spawned work all arrive here as
//! messages and are applied one at a time, so neither needs locking.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use storage_sys::{CapacityProbe, MountTable};
use storage_types::{FormatOptions, OperationError, OperationErrorKind, PartitionFilter};
use storage_udisks::{ServiceSignal, ServiceSignalStream, StorageBackend};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::ControlError;
use crate::event::{ControlEvent, OperationReply, PartitionEvent};
use crate::manager::{ManagerOutput, PartitionManager};
use crate::monitor::{DeviceOperation, Monitor, MonitorEvent};
use crate::partition::{Partition, PartitionStore};
use crate::policy::AutomountPolicy;
use crate::probe::ProbePool;

const EVENT_CAPACITY: usize = 64;

enum Request {
    Partitions {
        filter: PartitionFilter,
        reply: oneshot::Sender<Vec<Partition>>,
    },
    Root {
        reply: oneshot::Sender<Partition>,
    },
    Operate {
        device_path: String,
        operation: DeviceOperation,
        reply: OperationReply,
    },
    Refresh,
    WaitPopulated {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable access to a running [`Controller`].
#[derive(Clone)]
pub struct StorageHandle {
    requests: mpsc::UnboundedSender<Request>,
    events: broadcast::Sender<PartitionEvent>,
}

impl StorageHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<PartitionEvent> {
        self.events.subscribe()
    }

    fn send(&self, request: Request) -> Result<(), ControlError> {
        self.requests
            .send(request)
            .map_err(|_| ControlError::ControllerStopped)
    }

    async fn ask<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T, ControlError> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply))?;
        response.await.map_err(|_| ControlError::ControllerStopped)
    }

    pub async fn partitions(&self, filter: PartitionFilter) -> Result<Vec<Partition>, ControlError> {
        self.ask(|reply| Request::Partitions { filter, reply }).await
    }

    pub async fn root(&self) -> Result<Partition, ControlError> {
        self.ask(|reply| Request::Root { reply }).await
    }

    /// Resolves once the initial UDisks2 enumeration has settled.
    pub async fn wait_populated(&self) -> Result<(), ControlError> {
        self.ask(|reply| Request::WaitPopulated { reply }).await
    }

    /// Reconcile every partition against the mount table now.
    pub fn refresh(&self) -> Result<(), ControlError> {
        self.send(Request::Refresh)
    }

    async fn operate(&self, device_path: &str, operation: DeviceOperation) -> Result<(), ControlError> {
        let device_path = device_path.to_string();
        self.ask(|reply| Request::Operate {
            device_path,
            operation,
            reply,
        })
        .await??;
        Ok(())
    }

    pub async fn mount(&self, device_path: &str) -> Result<(), ControlError> {
        self.operate(device_path, DeviceOperation::Mount).await
    }

    pub async fn unmount(&self, device_path: &str) -> Result<(), ControlError> {
        self.operate(device_path, DeviceOperation::Unmount).await
    }

    pub async fn lock(&self, device_path: &str) -> Result<(), ControlError> {
        self.operate(device_path, DeviceOperation::Lock).await
    }

    pub async fn unlock(&self, device_path: &str, passphrase: &str) -> Result<(), ControlError> {
        let passphrase = passphrase.to_string();
        self.operate(device_path, DeviceOperation::Unlock { passphrase })
            .await
    }

    pub async fn format(
        &self,
        device_path: &str,
        filesystem_type: &str,
        options: FormatOptions,
    ) -> Result<(), ControlError> {
        let filesystem_type = filesystem_type.to_string();
        self.operate(
            device_path,
            DeviceOperation::Format {
                filesystem_type,
                options,
            },
        )
        .await
    }
}

pub struct Controller {
    manager: PartitionManager,
    monitor: Option<Monitor>,
    probes: ProbePool,
    control: mpsc::UnboundedSender<ControlEvent>,
    control_rx: mpsc::UnboundedReceiver<ControlEvent>,
    requests: mpsc::UnboundedReceiver<Request>,
    events: broadcast::Sender<PartitionEvent>,
    signals: Option<ServiceSignalStream>,
    populated: bool,
    populated_waiters: Vec<oneshot::Sender<()>>,
}

impl Controller {
    /// Without a `backend` only the internal partitions are served.
    pub fn new(
        config: &ManagerConfig,
        mount_table: Arc<dyn MountTable>,
        probe: Arc<dyn CapacityProbe>,
        backend: Option<Arc<dyn StorageBackend>>,
        signals: Option<ServiceSignalStream>,
    ) -> (Self, StorageHandle) {
        let (control, control_rx) = mpsc::unbounded_channel();
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let store = Arc::new(PartitionStore::new(Some(control.clone())));
        let manager = PartitionManager::new(config, mount_table, store);
        let monitor = backend.map(|backend| {
            Monitor::new(
                backend,
                AutomountPolicy::new(config.excluded_device_prefixes.clone()),
                config.waiter_timeout,
                control.clone(),
            )
        });
        let probes = ProbePool::new(config.probe_workers, probe, control.clone());

        let handle = StorageHandle {
            requests: requests_tx,
            events: events.clone(),
        };
        let controller = Self {
            manager,
            monitor,
            probes,
            control,
            control_rx,
            requests,
            events,
            signals,
            populated: false,
            populated_waiters: Vec::new(),
        };
        (controller, handle)
    }

    /// Run until every [`StorageHandle`] is dropped.
    pub async fn run(mut self) {
        info!("Partition controller started");
        let initial = self.manager.refresh(None);
        self.publish(initial);

        match &self.monitor {
            Some(monitor) => monitor.start(),
            None => {
                info!("Storage service unavailable, serving internal partitions only");
                self.set_populated();
            }
        }

        loop {
            let deadline = self.manager.refresh_deadline();
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                Some(event) = self.control_rx.recv() => self.handle_control(event),
                signal = next_signal(&mut self.signals) => match signal {
                    Some(signal) => self.handle_signal(signal),
                    None => {
                        warn!("Storage service signal stream ended");
                        self.signals = None;
                    }
                },
                () = sleep_until(deadline) => {
                    let out = self.manager.run_scheduled_refresh();
                    self.publish(out);
                }
            }
        }

        info!("Partition controller stopped");
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Partitions { filter, reply } => {
                let _ = reply.send(self.manager.partitions(filter));
            }
            Request::Root { reply } => {
                let _ = reply.send(self.manager.root());
            }
            Request::Operate {
                device_path,
                operation,
                reply,
            } => {
                let Some(monitor) = self.monitor.as_mut() else {
                    let error = OperationError::new(
                        OperationErrorKind::ServiceUnavailable,
                        "storage service unavailable",
                    );
                    let _ = reply.send(Err(error));
                    return;
                };
                let internal = self.manager.internal_device_paths();
                let events = monitor.request(&device_path, operation, &internal, reply);
                self.apply(events);
            }
            Request::Refresh => {
                let out = self.manager.refresh(None);
                self.publish(out);
            }
            Request::WaitPopulated { reply } => {
                if self.populated {
                    let _ = reply.send(());
                } else {
                    self.populated_waiters.push(reply);
                }
            }
        }
    }

    fn handle_control(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::ProbeFinished(result) => {
                for event in self.manager.merge_probe(result) {
                    self.emit(event);
                }
                return;
            }
            ControlEvent::RefreshPartition(id) => {
                let out = self.manager.refresh_partition(id);
                self.publish(out);
                return;
            }
            _ => {}
        }

        let Some(monitor) = self.monitor.as_mut() else {
            return;
        };
        let events = match event {
            ControlEvent::Enumerated(result) => monitor.enumerated(result),
            ControlEvent::FetchFinished {
                record_path,
                interface,
                result,
            } => monitor.fetch_finished(&record_path, interface, result),
            ControlEvent::OperationFinished {
                kind,
                object_path,
                result,
                reply,
            } => monitor.operation_finished(kind, &object_path, result, reply),
            ControlEvent::WaiterExpired { path, generation } => {
                monitor.waiter_expired(&path, generation)
            }
            ControlEvent::ProbeFinished(_) | ControlEvent::RefreshPartition(_) => Vec::new(),
        };
        self.apply(events);
    }

    fn handle_signal(&mut self, signal: ServiceSignal) {
        if let Some(monitor) = self.monitor.as_mut() {
            let events = monitor.handle_signal(signal);
            self.apply(events);
        }
    }

    fn apply(&mut self, events: Vec<MonitorEvent>) {
        for event in events {
            let out = match event {
                MonitorEvent::DeviceAdded(device) => self.manager.add(&device),
                MonitorEvent::DeviceRemoved(device) => self.manager.remove(&[device.device_path]),
                MonitorEvent::DeviceChanged(device) => self.manager.update(&device),
                MonitorEvent::DeviceMorphed { previous, current } => {
                    self.manager.replace(&previous.device_path, &current)
                }
                MonitorEvent::Job {
                    operation,
                    device_paths,
                    phase,
                } => self.manager.apply_job(&operation, &device_paths, phase),
                MonitorEvent::ExternalsPopulated => {
                    self.set_populated();
                    continue;
                }
                MonitorEvent::WaiterStarted {
                    path,
                    generation,
                    timeout,
                } => {
                    self.start_waiter_timer(path, generation, timeout);
                    continue;
                }
            };
            self.publish(out);
        }
    }

    fn start_waiter_timer(&self, path: String, generation: u64, timeout: Duration) {
        debug!(path, generation, "Waiting for partitions to claim device");
        let control = self.control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = control.send(ControlEvent::WaiterExpired { path, generation });
        });
    }

    fn set_populated(&mut self) {
        if self.populated {
            return;
        }
        self.populated = true;
        self.emit(PartitionEvent::ExternalsPopulated);
        for waiter in self.populated_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn publish(&mut self, out: ManagerOutput) {
        for event in out.events {
            self.emit(event);
        }
        for request in out.probes {
            self.probes.submit(request);
        }
    }

    fn emit(&self, event: PartitionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn next_signal(signals: &mut Option<ServiceSignalStream>) -> Option<ServiceSignal> {
    match signals {
        Some(signals) => signals.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use storage_types::{Capacity, PartitionStatus, StorageType};
    use storage_udisks::{Interface, JOB_INTERFACE, PropertyMap};

    use super::*;
    use crate::testing::{
        FakeBackend, FakeMountTable, FixedProbe, USB_DRIVE, block, drive, filesystem, job,
        object_path, partition_of,
    };

    const ROOT_ONLY: &str = "/dev/nvme0n1p2 / ext4 rw 0 0\n";

    fn probe() -> Arc<FixedProbe> {
        Arc::new(FixedProbe(Capacity {
            bytes_total: 1000,
            bytes_available: 300,
            bytes_free: 400,
            read_only: false,
        }))
    }

    fn spawn(
        table: Arc<FakeMountTable>,
        backend: Option<FakeBackend>,
        signals: Option<ServiceSignalStream>,
    ) -> StorageHandle {
        let backend = backend.map(|b| Arc::new(b) as Arc<dyn StorageBackend>);
        let (controller, handle) =
            Controller::new(&ManagerConfig::default(), table, probe(), backend, signals);
        tokio::spawn(controller.run());
        handle
    }

    /// Wait for an event satisfying `matches`.
    async fn until(
        events: &mut broadcast::Receiver<PartitionEvent>,
        matches: impl Fn(&PartitionEvent) -> bool,
    ) -> PartitionEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
                .await
                .expect("timed out waiting for event")
                .expect("event channel closed");
            if matches(&event) {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn internal_only_without_service() {
        let handle = spawn(FakeMountTable::new(ROOT_ONLY), None, None);
        handle.wait_populated().await.unwrap();

        let root = handle.root().await.unwrap();
        assert!(root.is_valid());
        assert_eq!(root.storage_type(), Some(StorageType::Mass));
        assert!(
            handle
                .partitions(PartitionFilter::external())
                .await
                .unwrap()
                .is_empty()
        );

        let error = handle.mount("/dev/sdb1").await.unwrap_err();
        assert_eq!(
            error,
            ControlError::Operation(OperationError::new(
                OperationErrorKind::ServiceUnavailable,
                "storage service unavailable"
            ))
        );
    }

    #[tokio::test]
    async fn root_capacity_arrives_from_the_probe_pool() {
        let handle = spawn(FakeMountTable::new(ROOT_ONLY), None, None);
        let mut events = handle.subscribe();
        let root = handle.root().await.unwrap();

        // The initial probe may have landed before the subscription.
        if root.bytes_total() < 0 {
            until(&mut events, |e| *e == PartitionEvent::Changed(root.clone())).await;
        }
        assert_eq!(root.bytes_total(), 1000);
        assert_eq!(root.bytes_available(), 300);

        let mut events = handle.subscribe();
        root.refresh();
        let event = until(&mut events, |e| matches!(e, PartitionEvent::Changed(_))).await;
        assert_eq!(event, PartitionEvent::Changed(root));
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_disk_is_accepted_after_the_waiter_timeout() {
        let backend = FakeBackend::default();
        backend.add_object(
            &object_path("sdb"),
            HashMap::from([
                (Interface::Block, block("/dev/sdb", USB_DRIVE)),
                (Interface::PartitionTable, PropertyMap::from([(
                    "Type".to_string(),
                    storage_udisks::PropValue::Str("dos".to_string()),
                )])),
            ]),
        );
        backend.add_object(USB_DRIVE, HashMap::from([(Interface::Drive, drive("usb"))]));

        let handle = spawn(FakeMountTable::new(ROOT_ONLY), Some(backend), None);
        let mut events = handle.subscribe();
        handle.wait_populated().await.unwrap();
        let settled = Instant::now();
        assert!(
            handle
                .partitions(PartitionFilter::external())
                .await
                .unwrap()
                .is_empty()
        );

        let added = until(&mut events, |e| matches!(e, PartitionEvent::Added(_))).await;
        assert!(settled.elapsed() >= Duration::from_millis(3000));
        match added {
            PartitionEvent::Added(partition) => {
                assert_eq!(partition.device_path(), "/dev/sdb");
                assert!(partition.snapshot().is_whole_disk);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn mount_job_and_mount_table_agree() {
        let backend = FakeBackend::default();
        backend.add_object(
            &object_path("sdb1"),
            HashMap::from([
                (Interface::Block, block("/dev/sdb1", USB_DRIVE)),
                (Interface::Filesystem, filesystem(&[])),
                (Interface::Partition, partition_of(&object_path("sdb"))),
            ]),
        );
        backend.add_object(USB_DRIVE, HashMap::from([(Interface::Drive, drive("usb"))]));
        let table = FakeMountTable::new(ROOT_ONLY);
        let (signal_tx, signal_rx) = mpsc::channel(16);

        let handle = spawn(
            table.clone(),
            Some(backend.clone()),
            Some(ServiceSignalStream::from_receiver(signal_rx)),
        );
        let mut events = handle.subscribe();
        handle.wait_populated().await.unwrap();

        let stick = handle.partitions(PartitionFilter::external()).await.unwrap()[0].clone();
        assert_eq!(stick.status(), PartitionStatus::Unmounted);
        assert!(stick.snapshot().can_mount);

        handle.mount("/dev/sdb1").await.unwrap();
        let job_path = "/org/freedesktop/UDisks2/jobs/7";
        signal_tx
            .send(ServiceSignal::InterfacesAdded {
                object_path: job_path.to_string(),
                interfaces: HashMap::from([(
                    JOB_INTERFACE.to_string(),
                    job("filesystem-mount", &[object_path("sdb1")]),
                )]),
            })
            .await
            .unwrap();
        until(&mut events, |_| stick.status() == PartitionStatus::Mounting).await;

        table.set(Some(
            "/dev/nvme0n1p2 / ext4 rw 0 0\n/dev/sdb1 /run/media/user/STICK vfat rw 0 0\n",
        ));
        signal_tx
            .send(ServiceSignal::JobCompleted {
                object_path: job_path.to_string(),
                success: true,
                message: String::new(),
            })
            .await
            .unwrap();

        until(&mut events, |_| stick.bytes_total() == 1000).await;
        let snapshot = stick.snapshot();
        assert_eq!(snapshot.status, PartitionStatus::Mounted);
        assert_eq!(snapshot.mount_path, "/run/media/user/STICK");
        assert!(!snapshot.mount_failed);
    }

    #[tokio::test]
    async fn handles_fail_once_the_controller_is_gone() {
        let (controller, handle) = Controller::new(
            &ManagerConfig::default(),
            FakeMountTable::new(ROOT_ONLY),
            probe(),
            None,
            None,
        );
        drop(controller);
        assert_eq!(handle.root().await.unwrap_err(), ControlError::ControllerStopped);
    }
}
