//! Tracing spans and metric hooks for the job lifecycle.
//!
//! Every helper logs through `tracing` and, with the `metrics` feature,
//! forwards to the Prometheus collectors in [`crate::metrics`]. Without the
//! feature they only log.

use std::time::Instant;

use tracing::{Span, info_span};

use crate::device::DeviceId;
use crate::job::{JobId, JobStatus, NodeId, RenderType};

/// Span covering scene metadata gathering and the dispatch decision.
#[must_use]
pub fn prepare_span(job_id: JobId, render_type: RenderType) -> Span {
    info_span!(
        "farm.prepare",
        job_id = %job_id,
        render_type = %render_type,
    )
}

/// Span covering one device's work on a job.
#[must_use]
pub fn dispatch_span(job_id: JobId, device: DeviceId) -> Span {
    info_span!("farm.dispatch", job_id = %job_id, device = device)
}

/// Span covering a render node from spawn to exit.
#[must_use]
pub fn node_span(job_id: JobId, pid: NodeId) -> Span {
    info_span!("farm.node", job_id = %job_id, pid = pid)
}

#[must_use]
pub fn cancel_span(job_id: JobId) -> Span {
    info_span!("farm.cancel", job_id = %job_id)
}

pub fn record_job_registered(job_id: JobId, render_type: RenderType) {
    tracing::info!(job_id = %job_id, render_type = %render_type, "job registered");

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_registered(render_type.as_str());
}

pub fn record_job_ended(job_id: JobId, render_type: RenderType, status: JobStatus) {
    if status == JobStatus::Failed {
        tracing::warn!(job_id = %job_id, render_type = %render_type, status = %status, "job ended");
    } else {
        tracing::info!(job_id = %job_id, render_type = %render_type, status = %status, "job ended");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_job_ended(render_type.as_str(), status.as_str());
}

pub fn set_queue_depth(device: DeviceId, depth: usize) {
    tracing::trace!(device = device, depth = depth, "device queue depth updated");

    #[cfg(feature = "metrics")]
    crate::metrics::set_device_queue_depth(device, depth as f64);
}

/// Start timing a render node. Pass the handle to [`record_node_finished`].
pub fn record_node_start(job_id: JobId, pid: NodeId) -> NodeTimingHandle {
    NodeTimingHandle {
        job_id,
        pid,
        start: Instant::now(),
    }
}

/// Log the node's exit and observe its duration.
pub fn record_node_finished(handle: NodeTimingHandle, outcome: &'static str) {
    tracing::info!(
        job_id = %handle.job_id,
        pid = handle.pid,
        outcome = outcome,
        "render node exited"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_node_finished(outcome);

    observe_node_duration(outcome, handle.start.elapsed().as_secs_f64());
}

pub fn observe_node_duration(outcome: &str, duration_secs: f64) {
    tracing::debug!(outcome = outcome, duration_secs = duration_secs, "node duration observed");

    #[cfg(feature = "metrics")]
    crate::metrics::observe_node_duration(outcome, duration_secs);
}

#[derive(Debug)]
pub struct NodeTimingHandle {
    job_id: JobId,
    pid: NodeId,
    start: Instant,
}

impl NodeTimingHandle {
    #[must_use]
    pub fn elapsed(&self) -> std::time::Duration {
        self.start.elapsed()
    }
}
