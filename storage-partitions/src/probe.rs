// SPDX-License-Identifier: GPL-3.0-only

//! Capacity probes on a small pool of blocking workers.
//!
//! `statvfs` and `quotactl` can hang on slow or vanished media, so they never
//! run on the control task. Results come back as [`ControlEvent`]s.

use std::sync::Arc;

use storage_sys::{CapacityProbe, SysError};
use tokio::sync::{Semaphore, mpsc};
use tracing::debug;

use crate::event::{ControlEvent, ProbeResult};

pub const DEFAULT_PROBE_WORKERS: usize = 2;

/// The fields a probe needs, detached from the partition record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub mount_path: String,
    pub device_path: String,
}

pub struct ProbePool {
    permits: Arc<Semaphore>,
    probe: Arc<dyn CapacityProbe>,
    control: mpsc::UnboundedSender<ControlEvent>,
}

impl ProbePool {
    pub(crate) fn new(
        workers: usize,
        probe: Arc<dyn CapacityProbe>,
        control: mpsc::UnboundedSender<ControlEvent>,
    ) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
            probe,
            control,
        }
    }

    pub(crate) fn submit(&self, request: ProbeRequest) {
        let permits = self.permits.clone();
        let probe = self.probe.clone();
        let control = self.control.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            let mount_path = request.mount_path.clone();
            let result = tokio::task::spawn_blocking(move || {
                probe.probe(&request.mount_path, &request.device_path)
            })
            .await
            .unwrap_or_else(|e| Err(SysError::Io(std::io::Error::other(e))));

            if control
                .send(ControlEvent::ProbeFinished(ProbeResult { mount_path, result }))
                .is_err()
            {
                debug!("Probe finished after the controller stopped");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use storage_types::Capacity;

    use super::*;

    #[derive(Default)]
    struct CountingProbe {
        running: AtomicUsize,
        max_running: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl CapacityProbe for CountingProbe {
        fn probe(&self, mount_path: &str, _device_path: &str) -> storage_sys::Result<Capacity> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(20));
            self.running.fetch_sub(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push(mount_path.to_string());

            if mount_path == "/broken" {
                return Err(SysError::InvalidPath(mount_path.to_string()));
            }
            Ok(Capacity {
                bytes_total: 1000,
                bytes_available: 300,
                bytes_free: 400,
                read_only: false,
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bounded_pool_reports_every_result() {
        let probe = Arc::new(CountingProbe::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pool = ProbePool::new(2, probe.clone(), tx);

        for path in ["/", "/home", "/broken", "/run/media/user/SDCARD"] {
            pool.submit(ProbeRequest {
                mount_path: path.to_string(),
                device_path: String::new(),
            });
        }

        let mut failed = Vec::new();
        for _ in 0..4 {
            match rx.recv().await {
                Some(ControlEvent::ProbeFinished(result)) => {
                    if result.result.is_err() {
                        failed.push(result.mount_path);
                    }
                }
                other => panic!("unexpected control event: {other:?}"),
            }
        }

        assert_eq!(failed, vec!["/broken".to_string()]);
        assert!(probe.max_running.load(Ordering::SeqCst) <= 2);
        assert_eq!(probe.seen.lock().unwrap().len(), 4);
    }
}
