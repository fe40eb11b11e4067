//! Render devices and their job queues.
//!
//! Each device owns a FIFO of job ids and a consume loop that is the only
//! code touching that FIFO. Other tasks talk to a device by posting
//! [`DeviceMessage`]s into its mailbox, so no lock is shared between
//! devices. A loop runs at most one render node at a time and sleeps on
//! its mailbox while its queue is empty.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::job::JobId;
use crate::shutdown::ShutdownToken;
use crate::telemetry;

/// Zero-based device index, as understood by the engine.
pub type DeviceId = usize;

/// Runs a job on one device when that device's loop reaches it.
#[async_trait]
pub trait DeviceDispatcher: Send + Sync {
    /// Resolves once the node started for `job_id` on `device` is done.
    async fn dispatch(&self, job_id: JobId, device: DeviceId);
}

#[derive(Debug)]
enum DeviceMessage {
    NewJob(JobId),
    RemoveJob(JobId),
    Pending(oneshot::Sender<Vec<JobId>>),
}

/// Handle to one device's consume loop.
#[derive(Clone, Debug)]
pub struct Device {
    id: DeviceId,
    running: Arc<AtomicBool>,
    /// Combined nodes currently using this device outside its own loop.
    claims: Arc<AtomicUsize>,
    mailbox: mpsc::UnboundedSender<DeviceMessage>,
}

impl Device {
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Whether a render node is in flight on this device, either from its
    /// own queue or through a [`DeviceClaim`].
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) || self.claims.load(Ordering::SeqCst) > 0
    }

    pub fn enqueue(&self, job_id: JobId) {
        self.post(DeviceMessage::NewJob(job_id));
    }

    /// Drop `job_id` from the queue if it has not started here yet.
    pub fn remove(&self, job_id: JobId) {
        self.post(DeviceMessage::RemoveJob(job_id));
    }

    /// Snapshot of the jobs waiting on this device, in run order.
    pub async fn pending(&self) -> Vec<JobId> {
        let (reply, rx) = oneshot::channel();
        self.post(DeviceMessage::Pending(reply));
        rx.await.unwrap_or_default()
    }

    fn post(&self, message: DeviceMessage) {
        if self.mailbox.send(message).is_err() {
            warn!(device = self.id, "device loop stopped, message dropped");
        }
    }
}

/// The fixed set of devices discovered at start-up.
pub struct DevicePool {
    devices: Vec<Device>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: ShutdownToken,
}

impl std::fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePool")
            .field("devices", &self.devices.len())
            .field("idle", &self.idle_devices().len())
            .field("stopped", &self.shutdown.is_triggered())
            .finish()
    }
}

impl DevicePool {
    /// Spawn one consume loop per device.
    pub fn start(
        count: usize,
        dispatcher: Arc<dyn DeviceDispatcher>,
        shutdown: ShutdownToken,
    ) -> Self {
        let mut devices = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);

        for id in 0..count {
            let (mailbox, inbox) = mpsc::unbounded_channel();
            let running = Arc::new(AtomicBool::new(false));
            let device_loop = DeviceLoop {
                id,
                queue: VecDeque::new(),
                running: Arc::clone(&running),
                inbox,
                dispatcher: Arc::clone(&dispatcher),
            };
            handles.push(tokio::spawn(device_loop.run(shutdown.clone())));
            devices.push(Device {
                id,
                running,
                claims: Arc::new(AtomicUsize::new(0)),
                mailbox,
            });
        }

        info!(devices = count, "device pool started");
        Self {
            devices,
            handles: Mutex::new(handles),
            shutdown,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.devices.iter().map(Device::id).collect()
    }

    pub fn get(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Devices with no render node in flight.
    pub fn idle_devices(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|device| !device.is_running())
            .map(Device::id)
            .collect()
    }

    /// Append `job_id` to one device's queue. Returns false for an unknown device.
    pub fn enqueue(&self, device: DeviceId, job_id: JobId) -> bool {
        match self.get(device) {
            Some(device) => {
                device.enqueue(job_id);
                true
            }
            None => false,
        }
    }

    pub fn enqueue_all(&self, job_id: JobId) {
        for device in &self.devices {
            device.enqueue(job_id);
        }
    }

    /// Broadcast removal of `job_id` to every device queue.
    pub fn remove_everywhere(&self, job_id: JobId) {
        for device in &self.devices {
            device.remove(job_id);
        }
    }

    /// Mark `ids` busy until the returned claim is dropped. Unknown ids are skipped.
    pub fn claim(&self, ids: &[DeviceId]) -> DeviceClaim {
        let claims = ids
            .iter()
            .filter_map(|id| self.get(*id))
            .map(|device| {
                device.claims.fetch_add(1, Ordering::SeqCst);
                Arc::clone(&device.claims)
            })
            .collect();
        DeviceClaim { claims }
    }

    pub async fn pending(&self, device: DeviceId) -> Option<Vec<JobId>> {
        Some(self.get(device)?.pending().await)
    }

    /// Stop every loop and wait for them to exit.
    ///
    /// Nodes still in flight are dropped, which kills their processes.
    pub async fn stop(&self, grace: Duration) {
        self.shutdown.trigger();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            match tokio::time::timeout(grace, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "device loop panicked"),
                Err(_) => warn!("device loop did not stop in time"),
            }
        }
    }
}

/// Devices held by a node that runs outside the device loops.
#[derive(Debug)]
pub struct DeviceClaim {
    claims: Vec<Arc<AtomicUsize>>,
}

impl Drop for DeviceClaim {
    fn drop(&mut self) {
        for claim in &self.claims {
            claim.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct DeviceLoop {
    id: DeviceId,
    queue: VecDeque<JobId>,
    running: Arc<AtomicBool>,
    inbox: mpsc::UnboundedReceiver<DeviceMessage>,
    dispatcher: Arc<dyn DeviceDispatcher>,
}

impl DeviceLoop {
    async fn run(mut self, shutdown: ShutdownToken) {
        let mut in_flight: Option<BoxFuture<'static, ()>> = None;

        loop {
            if in_flight.is_none() {
                match self.queue.pop_front() {
                    Some(job_id) => {
                        self.running.store(true, Ordering::SeqCst);
                        telemetry::set_queue_depth(self.id, self.queue.len());
                        debug!(device = self.id, job_id = %job_id, "device picked up job");
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let device = self.id;
                        in_flight = Some(
                            async move { dispatcher.dispatch(job_id, device).await }
                                .boxed(),
                        );
                    }
                    None => self.running.store(false, Ordering::SeqCst),
                }
            }

            tokio::select! {
                _ = shutdown.triggered() => break,
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle(message),
                    None => break,
                },
                _ = async {
                    if let Some(node) = in_flight.as_mut() {
                        node.await;
                    }
                }, if in_flight.is_some() => {
                    in_flight = None;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        debug!(device = self.id, "device loop stopped");
    }

    fn handle(&mut self, message: DeviceMessage) {
        match message {
            DeviceMessage::NewJob(job_id) => {
                if self.queue.contains(&job_id) {
                    debug!(device = self.id, job_id = %job_id, "job already queued");
                    return;
                }
                self.queue.push_back(job_id);
            }
            DeviceMessage::RemoveJob(job_id) => {
                self.queue.retain(|queued| *queued != job_id);
            }
            DeviceMessage::Pending(reply) => {
                let _ = reply.send(self.queue.iter().copied().collect());
                return;
            }
        }
        telemetry::set_queue_depth(self.id, self.queue.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Semaphore;
    use tokio::time::{sleep, timeout};
    use uuid::Uuid;

    /// Records each dispatch, then blocks until the test hands out a permit.
    struct GatedDispatcher {
        started: Mutex<Vec<(JobId, DeviceId)>>,
        gate: Semaphore,
    }

    impl GatedDispatcher {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                started: Mutex::new(Vec::new()),
                gate: Semaphore::new(0),
            })
        }

        fn started(&self) -> Vec<(JobId, DeviceId)> {
            self.started.lock().clone()
        }
    }

    #[async_trait]
    impl DeviceDispatcher for GatedDispatcher {
        async fn dispatch(&self, job_id: JobId, device: DeviceId) {
            self.started.lock().push((job_id, device));
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
    }

    fn job(n: u128) -> JobId {
        JobId(Uuid::from_u128(n))
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        timeout(Duration::from_secs(2), async {
            while !condition() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition reached in time");
    }

    #[tokio::test]
    async fn test_device_runs_jobs_in_fifo_order() {
        let dispatcher = GatedDispatcher::new();
        let pool = DevicePool::start(1, dispatcher.clone(), ShutdownToken::new());

        for n in 1..=3 {
            pool.enqueue(0, job(n));
        }
        eventually(|| dispatcher.started().len() == 1).await;
        assert!(pool.devices()[0].is_running());
        assert_eq!(pool.pending(0).await, Some(vec![job(2), job(3)]));

        dispatcher.gate.add_permits(3);
        eventually(|| dispatcher.started().len() == 3).await;
        assert_eq!(
            dispatcher.started(),
            vec![(job(1), 0), (job(2), 0), (job(3), 0)]
        );
        eventually(|| !pool.devices()[0].is_running()).await;

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_removed_job_is_skipped() {
        let dispatcher = GatedDispatcher::new();
        let pool = DevicePool::start(1, dispatcher.clone(), ShutdownToken::new());

        pool.enqueue(0, job(1));
        pool.enqueue(0, job(2));
        pool.enqueue(0, job(3));
        eventually(|| dispatcher.started().len() == 1).await;

        pool.remove_everywhere(job(2));
        assert_eq!(pool.pending(0).await, Some(vec![job(3)]));

        dispatcher.gate.add_permits(2);
        eventually(|| dispatcher.started().len() == 2).await;
        eventually(|| !pool.devices()[0].is_running()).await;
        assert_eq!(dispatcher.started(), vec![(job(1), 0), (job(3), 0)]);

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_devices_work_independently() {
        let dispatcher = GatedDispatcher::new();
        let pool = DevicePool::start(3, dispatcher.clone(), ShutdownToken::new());

        pool.enqueue_all(job(7));
        eventually(|| dispatcher.started().len() == 3).await;
        assert!(pool.idle_devices().is_empty());

        let mut devices: Vec<_> =
            dispatcher.started().into_iter().map(|(_, device)| device).collect();
        devices.sort_unstable();
        assert_eq!(devices, vec![0, 1, 2]);

        dispatcher.gate.add_permits(3);
        eventually(|| pool.idle_devices().len() == 3).await;

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_is_ignored() {
        let dispatcher = GatedDispatcher::new();
        let pool = DevicePool::start(1, dispatcher.clone(), ShutdownToken::new());

        pool.enqueue(0, job(1));
        eventually(|| dispatcher.started().len() == 1).await;
        pool.enqueue(0, job(2));
        pool.enqueue(0, job(2));

        assert_eq!(pool.pending(0).await, Some(vec![job(2)]));
        assert!(!pool.enqueue(5, job(3)));

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_claimed_devices_are_not_idle() {
        let dispatcher = GatedDispatcher::new();
        let pool = DevicePool::start(3, dispatcher.clone(), ShutdownToken::new());

        let first = pool.claim(&[0, 1]);
        let second = pool.claim(&[1, 9]);
        assert_eq!(pool.idle_devices(), vec![2]);

        drop(first);
        assert_eq!(pool.idle_devices(), vec![0, 2]);
        drop(second);
        assert_eq!(pool.idle_devices(), vec![0, 1, 2]);
        assert!(dispatcher.started().is_empty());

        pool.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_stop_ends_every_loop() {
        let dispatcher = GatedDispatcher::new();
        let pool = DevicePool::start(2, dispatcher.clone(), ShutdownToken::new());

        pool.enqueue(0, job(1));
        eventually(|| dispatcher.started().len() == 1).await;

        timeout(Duration::from_secs(2), pool.stop(Duration::from_secs(1)))
            .await
            .expect("pool stopped");
        assert!(!pool.devices()[0].is_running());
        assert_eq!(pool.pending(1).await, Some(Vec::new()));
    }
}
