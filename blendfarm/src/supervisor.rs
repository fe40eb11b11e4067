//! Render node supervision.
//!
//! [`NodeSupervisor::start_node`] owns one engine subprocess from spawn to
//! exit: it records the node in the job's snapshot map, streams progress
//! lines into it, and folds the exit status back into a terminal token.
//! Live nodes are indexed by pid in [`LiveNodes`] so cancellation can reach
//! them from any task.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{Instrument, debug, error, trace, warn};

use crate::device::DeviceId;
use crate::engine::{
    LEGACY_STILL_SIGNAL, NodeExit, NodeSignal, RenderEngine, RenderProcess,
    RenderRequest, TERMINATE_SIGNAL,
};
use crate::error::FarmError;
use crate::events::{FarmEvent, FarmEventPublisher};
use crate::job::{EngineVariant, JobId, JobStatus, NodeId, RenderType};
use crate::output::{self, FAILED, FINISHED, ProgressSnapshot};
use crate::store::SharedJob;
use crate::telemetry;

#[derive(Clone)]
struct LiveNode {
    job_id: JobId,
    signal: Arc<dyn NodeSignal>,
    cancel_requested: Arc<AtomicBool>,
}

/// Table of running render nodes keyed by pid.
#[derive(Clone, Default)]
pub struct LiveNodes {
    inner: Arc<Mutex<HashMap<NodeId, LiveNode>>>,
}

impl std::fmt::Debug for LiveNodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveNodes").field("live", &self.len()).finish()
    }
}

impl LiveNodes {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, pid: NodeId, node: LiveNode) {
        self.inner.lock().insert(pid, node);
    }

    fn remove(&self, pid: NodeId) {
        self.inner.lock().remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn contains(&self, pid: NodeId) -> bool {
        self.inner.lock().contains_key(&pid)
    }

    pub fn pids_for(&self, job_id: JobId) -> Vec<NodeId> {
        self.inner
            .lock()
            .iter()
            .filter(|(_, node)| node.job_id == job_id)
            .map(|(pid, _)| *pid)
            .collect()
    }

    /// Mark a node as cancelled and signal it. Returns false if it is not live.
    pub fn terminate(&self, pid: NodeId) -> Result<bool, FarmError> {
        let Some(node) = self.inner.lock().get(&pid).cloned() else {
            return Ok(false);
        };
        node.cancel_requested.store(true, Ordering::SeqCst);
        node.signal.terminate()?;
        Ok(true)
    }

    /// Signal every live node of a job. Returns the pids that were reached.
    pub fn terminate_job(&self, job_id: JobId) -> Vec<NodeId> {
        let mut signalled = Vec::new();
        for pid in self.pids_for(job_id) {
            match self.terminate(pid) {
                Ok(true) => signalled.push(pid),
                Ok(false) => {}
                Err(err) => warn!(job_id = %job_id, pid, error = %err, "failed to signal render node"),
            }
        }
        signalled
    }
}

/// Removes a node from the live table when its supervision ends, on every path.
struct LiveGuard<'a> {
    live: &'a LiveNodes,
    pid: NodeId,
}

impl Drop for LiveGuard<'_> {
    fn drop(&mut self) {
        self.live.remove(self.pid);
    }
}

/// Summary of a node that exited cleanly.
#[derive(Clone, Debug)]
pub struct NodeReport {
    pub pid: NodeId,
    pub exit: NodeExit,
    pub canceled: bool,
    pub duration: Duration,
}

/// Whether an exit counts as a normal end of the node's work.
///
/// Clean exits are: status 0, the cancellation signal, any exit after a
/// cancellation request, and the crash legacy builds raise after a still.
pub fn is_clean_exit(
    exit: NodeExit,
    cancel_requested: bool,
    variant: EngineVariant,
    render_type: RenderType,
) -> bool {
    exit.is_success()
        || cancel_requested
        || exit.is_signal(TERMINATE_SIGNAL)
        || (variant == EngineVariant::Legacy
            && render_type == RenderType::Still
            && exit.is_signal(LEGACY_STILL_SIGNAL))
}

pub struct NodeSupervisor {
    engine: Arc<dyn RenderEngine>,
    events: Arc<dyn FarmEventPublisher>,
    live: LiveNodes,
    output_root: PathBuf,
}

impl std::fmt::Debug for NodeSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSupervisor")
            .field("live", &self.live)
            .field("output_root", &self.output_root)
            .finish()
    }
}

impl NodeSupervisor {
    pub fn new(
        engine: Arc<dyn RenderEngine>,
        events: Arc<dyn FarmEventPublisher>,
        output_root: PathBuf,
    ) -> Self {
        Self {
            engine,
            events,
            live: LiveNodes::new(),
            output_root,
        }
    }

    pub fn live(&self) -> &LiveNodes {
        &self.live
    }

    /// Run one render node for `job` on `devices` until it exits.
    ///
    /// Errors returned before the node is spawned leave the job's snapshot
    /// map untouched; every later error path marks the node `Failed` first.
    pub async fn start_node(
        &self,
        job: &SharedJob,
        devices: Vec<DeviceId>,
    ) -> Result<NodeReport, FarmError> {
        let (request, job_id, variant, render_type, start_frame) = {
            let job = job.lock();
            let request = RenderRequest {
                scene: job.scene.clone(),
                render_type: job.render_type,
                devices,
                output_folder: job.output_folder(&self.output_root),
                file_name: job.output_name(),
            };
            (request, job.id, job.variant, job.render_type, job.frames.start)
        };

        let mut process = self.engine.spawn_render(&request).await?;
        let pid = process.pid();
        let timing = telemetry::record_node_start(job_id, pid);

        let cancel_requested = Arc::new(AtomicBool::new(false));
        self.live.insert(
            pid,
            LiveNode {
                job_id,
                signal: process.signal(),
                cancel_requested: Arc::clone(&cancel_requested),
            },
        );
        let _live = LiveGuard {
            live: &self.live,
            pid,
        };

        let canceled = {
            let mut job = job.lock();
            job.nodes
                .insert(pid, ProgressSnapshot::placeholder(start_frame));
            job.status == JobStatus::Canceled
        };
        if canceled {
            // cancel ran between spawn and registration
            if let Err(err) = self.live.terminate(pid) {
                warn!(job_id = %job_id, pid, error = %err, "failed to signal render node");
            }
        }

        self.stream_progress(job, pid, process.as_mut())
            .instrument(telemetry::node_span(job_id, pid))
            .await;

        let exit = match process.wait().await {
            Ok(exit) => exit,
            Err(err) => {
                error!(job_id = %job_id, pid, error = %err, "lost track of render node");
                mark(job, pid, FAILED, Some(err.to_string()));
                telemetry::record_node_finished(timing, "failed");
                return Err(err);
            }
        };

        let canceled = cancel_requested.load(Ordering::SeqCst);
        if is_clean_exit(exit, canceled, variant, render_type) {
            let duration = timing.elapsed();
            {
                let mut job = job.lock();
                if let Some(snapshot) = job.nodes.get_mut(&pid) {
                    if !snapshot.is_resolved() {
                        snapshot.information = FINISHED.to_string();
                    }
                }
            }
            telemetry::record_node_finished(
                timing,
                if canceled { "canceled" } else { "finished" },
            );
            Ok(NodeReport {
                pid,
                exit,
                canceled,
                duration,
            })
        } else {
            error!(job_id = %job_id, pid, %exit, "render node exited abnormally");
            mark(job, pid, FAILED, Some(exit.to_string()));
            telemetry::record_node_finished(timing, "failed");
            Err(FarmError::NodeExecution {
                pid,
                code: exit.code,
                signal: exit.signal,
            })
        }
    }

    async fn stream_progress(
        &self,
        job: &SharedJob,
        pid: NodeId,
        process: &mut dyn RenderProcess,
    ) {
        loop {
            match process.next_line().await {
                Ok(Some(line)) => {
                    let Some(snapshot) = output::parse_line(&line) else {
                        trace!(pid, "engine: {line}");
                        continue;
                    };
                    let view = {
                        let mut job = job.lock();
                        job.nodes.insert(pid, snapshot.clone());
                        job.clone()
                    };
                    debug!(
                        pid,
                        frame = snapshot.frame,
                        information = %snapshot.information,
                        "render progress"
                    );
                    self.events.publish(FarmEvent::job_status(view, pid, snapshot));
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(pid, error = %err, "render output stream failed");
                    break;
                }
            }
        }
    }
}

fn mark(job: &SharedJob, pid: NodeId, token: &str, detail: Option<String>) {
    let mut job = job.lock();
    if let Some(snapshot) = job.nodes.get_mut(&pid) {
        snapshot.information = token.to_string();
        snapshot.extra_information = detail;
    }
}
