//! The render farm facade.
//!
//! [`RenderFarm`] owns the job table, the device pool and the node
//! supervisor. Registering a job spawns its preparation: the scene's
//! metadata is queried, then the job is spread over devices according to the
//! configured [`DispatchPolicy`]. Each node completion re-checks whether
//! every node of the job has resolved and exited; the first check that
//! finds so finalises the job exactly once.
//!
//! # Status ownership
//!
//! Status changes go through [`Job::transition`], which refuses to leave a
//! terminal status. A cancel therefore always wins over a node that
//! finishes afterwards, and the finalisation guard on `complete_time`
//! keeps `JobEnd` to a single emission.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{Instrument, debug, error, info, warn};

use crate::archive::Archiver;
use crate::config::{DispatchPolicy, FarmConfig};
use crate::device::{DeviceDispatcher, DeviceId, DevicePool};
use crate::engine::{RenderEngine, SceneData};
use crate::error::FarmError;
use crate::events::{FarmEvent, FarmEventPublisher};
use crate::job::{EngineVariant, Job, JobId, JobStatus, RenderType};
use crate::progress::{self, JobProgress};
use crate::shutdown::ShutdownToken;
use crate::store::{JobStore, SharedJob};
use crate::supervisor::{NodeReport, NodeSupervisor};
use crate::telemetry;

/// Handle to a running render farm. Cheap to clone.
#[derive(Clone)]
pub struct RenderFarm {
    inner: Arc<FarmInner>,
}

impl std::fmt::Debug for RenderFarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderFarm")
            .field("jobs", &self.inner.store.len())
            .field("devices", &self.inner.pool)
            .field("policy", &self.inner.config.dispatch_policy)
            .finish()
    }
}

struct FarmInner {
    config: FarmConfig,
    engine: Arc<dyn RenderEngine>,
    store: JobStore,
    pool: DevicePool,
    supervisor: NodeSupervisor,
    events: Arc<dyn FarmEventPublisher>,
    archiver: Arc<dyn Archiver>,
    archive_lock: tokio::sync::Mutex<()>,
    shutdown: ShutdownToken,
}

/// Routes device-loop dispatches back into the farm without keeping it alive.
struct FarmDispatcher {
    farm: Weak<FarmInner>,
}

#[async_trait]
impl DeviceDispatcher for FarmDispatcher {
    async fn dispatch(&self, job_id: JobId, device: DeviceId) {
        let Some(farm) = self.farm.upgrade() else {
            return;
        };
        farm.render_on_device(job_id, device)
            .instrument(telemetry::dispatch_span(job_id, device))
            .await;
    }
}

impl RenderFarm {
    /// Wire the farm together and start one loop per device.
    pub(crate) fn assemble(
        config: FarmConfig,
        device_count: usize,
        engine: Arc<dyn RenderEngine>,
        archiver: Arc<dyn Archiver>,
        events: Arc<dyn FarmEventPublisher>,
    ) -> Self {
        let inner = Arc::new_cyclic(|farm: &Weak<FarmInner>| {
            let dispatcher: Arc<dyn DeviceDispatcher> =
                Arc::new(FarmDispatcher { farm: farm.clone() });
            let shutdown = ShutdownToken::new();
            let pool = DevicePool::start(device_count, dispatcher, shutdown.clone());
            let supervisor = NodeSupervisor::new(
                Arc::clone(&engine),
                Arc::clone(&events),
                config.output_root.clone(),
            );
            FarmInner {
                config,
                engine,
                store: JobStore::new(),
                pool,
                supervisor,
                events,
                archiver,
                archive_lock: tokio::sync::Mutex::new(()),
                shutdown,
            }
        });
        Self { inner }
    }

    /// Register a job and start preparing it in the background.
    pub fn register(
        &self,
        name: impl Into<String>,
        scene: impl Into<PathBuf>,
        render_type: RenderType,
        variant: EngineVariant,
    ) -> JobId {
        let job = Job::new(name, scene, render_type, variant);
        let id = job.id;
        self.inner.store.insert(job);
        telemetry::record_job_registered(id, render_type);

        let farm = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let shutdown = farm.shutdown.clone();
            tokio::select! {
                _ = shutdown.triggered() => {}
                _ = farm.prepare(id).instrument(telemetry::prepare_span(id, render_type)) => {}
            }
        });
        id
    }

    pub fn job(&self, id: JobId) -> Result<Job, FarmError> {
        self.inner.store.snapshot(id).ok_or(FarmError::NotFound(id))
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.inner.store.all()
    }

    pub fn progress(&self, id: JobId) -> Result<JobProgress, FarmError> {
        Ok(self.job(id)?.progress())
    }

    /// Cancel a job. Returns before its nodes have actually exited.
    pub fn cancel(&self, id: JobId) -> Result<(), FarmError> {
        let _span = telemetry::cancel_span(id).entered();
        self.inner.cancel(id)
    }

    /// Cancel the job if it is still live, then forget it and its artifacts.
    pub async fn delete(&self, id: JobId) -> Result<(), FarmError> {
        let job = self.inner.store.get(id).ok_or(FarmError::NotFound(id))?;
        let (terminal, folder, archive) = {
            let job = job.lock();
            let root = &self.inner.config.output_root;
            (
                job.status.is_terminal(),
                job.output_folder(root),
                job.archive_path(root),
            )
        };
        if !terminal {
            self.inner.cancel(id)?;
        }

        remove_artifact(&folder, true).await;
        remove_artifact(&archive, false).await;
        self.inner.store.remove(id);
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// Path of a finished job's output.
    ///
    /// Stills resolve to the rendered image. Animations are archived on the
    /// first call; later calls return the existing archive.
    pub async fn retrieve_output(&self, id: JobId) -> Result<PathBuf, FarmError> {
        let job = self.job(id)?;
        if job.status != JobStatus::Finished {
            return Err(FarmError::InvalidState {
                id,
                status: job.status,
                expected: JobStatus::Finished,
            });
        }

        let root = &self.inner.config.output_root;
        match job.render_type {
            RenderType::Still => Ok(job.still_output(root)),
            RenderType::Animation => {
                let archive = job.archive_path(root);
                let _guard = self.inner.archive_lock.lock().await;
                if !tokio::fs::try_exists(&archive).await? {
                    self.inner
                        .archiver
                        .archive(&job.output_folder(root), &archive)
                        .await?;
                }
                Ok(archive)
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FarmEvent> {
        self.inner.events.subscribe()
    }

    pub fn devices(&self) -> &DevicePool {
        &self.inner.pool
    }

    pub fn config(&self) -> &FarmConfig {
        &self.inner.config
    }

    /// Stop every device loop. Nodes still rendering are killed.
    pub async fn shutdown(&self) {
        info!("render farm shutting down");
        self.inner.pool.stop(Duration::from_secs(5)).await;
    }
}

impl FarmInner {
    async fn prepare(&self, id: JobId) {
        let Some(job) = self.store.get(id) else {
            return;
        };
        let scene = {
            let mut job = job.lock();
            if !job.transition(JobStatus::GatheringData) {
                debug!(job_id = %id, status = %job.status, "job left pending before preparation");
                return;
            }
            job.scene.clone()
        };

        let data = match self.engine.scene_data(&scene).await {
            Ok(data) => data,
            Err(err) => {
                error!(job_id = %id, error = %err, "failed to gather scene data");
                self.finalize(&job, Some(err.to_string()));
                return;
            }
        };

        let render_type = {
            let mut job = job.lock();
            job.frames = data.frames();
            job.engine_kind = Some(data.engine.clone());
            if !job.transition(JobStatus::Pending) {
                debug!(job_id = %id, status = %job.status, "job canceled while gathering data");
                return;
            }
            job.render_type
        };
        info!(
            job_id = %id,
            start_frame = data.start_frame,
            end_frame = data.end_frame,
            engine = %data.engine,
            "scene data gathered"
        );

        self.dispatch(&job, id, render_type, &data).await;
    }

    async fn dispatch(&self, job: &SharedJob, id: JobId, render_type: RenderType, data: &SceneData) {
        let single_instance = self.config.engine.is_single_instance(&data.engine);
        if render_type == RenderType::Still || single_instance {
            debug!(job_id = %id, single_instance, "rendering on one combined node");
            self.render_combined(job, self.pool.ids()).await;
            return;
        }

        match self.config.dispatch_policy {
            DispatchPolicy::PerDeviceQueue => {
                debug!(job_id = %id, devices = self.pool.len(), "queueing job on every device");
                self.pool.enqueue_all(id);
            }
            DispatchPolicy::SplitWhenEnoughDevices => {
                let frames = data.frames().frame_count();
                let idle = self.pool.idle_devices();
                if frames > 0 && idle.len() >= frames {
                    debug!(job_id = %id, frames, "one node per frame");
                    for device in idle.into_iter().take(frames) {
                        self.pool.enqueue(device, id);
                    }
                } else {
                    let devices = if idle.is_empty() { self.pool.ids() } else { idle };
                    debug!(job_id = %id, frames, ?devices, "fewer idle devices than frames");
                    self.render_combined(job, devices).await;
                }
            }
        }
    }

    async fn render_combined(&self, job: &SharedJob, devices: Vec<DeviceId>) {
        if !self.begin_rendering(job) {
            return;
        }
        let _claim = self.pool.claim(&devices);
        let result = self.supervisor.start_node(job, devices).await;
        self.node_done(job, result);
    }

    async fn render_on_device(&self, id: JobId, device: DeviceId) {
        let Some(job) = self.store.get(id) else {
            debug!(job_id = %id, device, "job deleted before the device reached it");
            return;
        };
        if !self.begin_rendering(&job) {
            debug!(job_id = %id, device, "job already ended, skipping");
            return;
        }
        let result = self.supervisor.start_node(&job, vec![device]).await;
        self.node_done(&job, result);
    }

    /// Move the job to `Rendering`, announcing the first transition.
    /// Returns false when the job has already ended.
    fn begin_rendering(&self, job: &SharedJob) -> bool {
        let mut job = job.lock();
        if job.status.is_terminal() {
            return false;
        }
        if job.transition(JobStatus::Rendering) {
            // published under the lock so JobStart precedes any JobEnd
            self.events.publish(FarmEvent::job_start(job.clone()));
        }
        true
    }

    fn node_done(&self, job: &SharedJob, result: Result<NodeReport, FarmError>) {
        let id = job.lock().id;
        match result {
            Ok(report) => debug!(
                job_id = %id,
                pid = report.pid,
                canceled = report.canceled,
                elapsed_secs = report.duration.as_secs_f64(),
                "render node done"
            ),
            Err(err @ FarmError::NodeExecution { .. }) => {
                error!(job_id = %id, error = %err, "render node failed");
            }
            Err(err) => {
                error!(job_id = %id, error = %err, "failed to run render node");
                let orphaned = job.lock().nodes.is_empty()
                    && self.supervisor.live().pids_for(id).is_empty();
                if orphaned {
                    self.finalize(job, Some(err.to_string()));
                    return;
                }
            }
        }

        // the finishing node left the live table before this check
        let live = self.supervisor.live().pids_for(id).len();
        if progress::is_settled(&job.lock().nodes, live) {
            self.finalize(job, None);
        } else if live > 0 {
            debug!(job_id = %id, live, "waiting for the job's other render nodes");
        }
    }

    /// End the job once: prune it from every device queue, settle its
    /// terminal status, stamp `complete_time` and announce `JobEnd`.
    fn finalize(&self, job: &SharedJob, failure: Option<String>) {
        let id = job.lock().id;
        self.pool.remove_everywhere(id);

        let mut job = job.lock();
        if job.complete_time.is_some() {
            return;
        }
        match failure {
            Some(reason) => {
                if job.transition(JobStatus::Failed) {
                    job.error = Some(reason);
                }
            }
            None if progress::any_failed(&job.nodes) => {
                if job.transition(JobStatus::Failed) {
                    job.error = Some("one or more render nodes failed".into());
                }
            }
            None => {
                job.transition(JobStatus::Finished);
            }
        }
        job.complete_time = Some(Utc::now());

        telemetry::record_job_ended(id, job.render_type, job.status);
        self.events.publish(FarmEvent::job_end(job.clone()));
    }

    fn cancel(&self, id: JobId) -> Result<(), FarmError> {
        let job = self.store.get(id).ok_or(FarmError::NotFound(id))?;
        {
            let mut job = job.lock();
            if !job.transition(JobStatus::Canceled) {
                debug!(job_id = %id, status = %job.status, "cancel of an ended job ignored");
                return Ok(());
            }
        }

        let signalled = self.supervisor.live().terminate_job(id);
        self.pool.remove_everywhere(id);
        info!(job_id = %id, nodes = signalled.len(), "job canceled");

        if self.supervisor.live().pids_for(id).is_empty() {
            self.finalize(&job, None);
        }
        Ok(())
    }
}

async fn remove_artifact(path: &Path, directory: bool) {
    let removed = if directory {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };
    match removed {
        Ok(()) => debug!(path = %path.display(), "artifact removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to remove artifact"),
    }
}
