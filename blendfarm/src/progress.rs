//! Job-level progress derived from per-node snapshots.

use std::collections::HashMap;

use serde::Serialize;

use crate::job::{Job, JobStatus, NodeId, RenderType};
use crate::output::ProgressSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct JobProgress {
    /// Every node has reported a terminal token.
    pub complete: bool,
    /// Fraction of the work done, within `[0, 1]`.
    pub fraction: f64,
}

/// A job's nodes are complete once there is at least one and all of them
/// have either finished or failed.
pub fn is_complete(nodes: &HashMap<NodeId, ProgressSnapshot>) -> bool {
    !nodes.is_empty() && nodes.values().all(ProgressSnapshot::is_resolved)
}

/// Whether a job can be retired: complete, with none of its nodes still
/// running. Animation nodes print `Finished` after every frame, so the
/// token alone does not mean the process is done.
pub fn is_settled(nodes: &HashMap<NodeId, ProgressSnapshot>, live_nodes: usize) -> bool {
    live_nodes == 0 && is_complete(nodes)
}

pub fn any_failed(nodes: &HashMap<NodeId, ProgressSnapshot>) -> bool {
    nodes.values().any(ProgressSnapshot::is_failed)
}

pub fn progress(job: &Job) -> JobProgress {
    let complete = is_complete(&job.nodes);
    if job.status == JobStatus::Finished {
        return JobProgress {
            complete,
            fraction: 1.0,
        };
    }

    let fraction = match job.render_type {
        RenderType::Still => still_fraction(&job.nodes),
        RenderType::Animation => animation_fraction(job),
    };

    JobProgress {
        complete,
        fraction: fraction.clamp(0.0, 1.0),
    }
}

fn still_fraction(nodes: &HashMap<NodeId, ProgressSnapshot>) -> f64 {
    if nodes.is_empty() {
        return 0.0;
    }
    let total: f64 = nodes.values().map(node_fraction).sum();
    total / nodes.len() as f64
}

fn node_fraction(snapshot: &ProgressSnapshot) -> f64 {
    if snapshot.is_finished() {
        return 1.0;
    }
    let Some(remaining) = snapshot.remaining_time_ms else {
        return 0.0;
    };
    let total = snapshot.render_time_ms + remaining;
    if total == 0 {
        return 0.0;
    }
    1.0 - remaining as f64 / total as f64
}

fn animation_fraction(job: &Job) -> f64 {
    let frame_count = job.frames.frame_count();
    if job.nodes.is_empty() || frame_count == 0 {
        return 0.0;
    }
    let mean_frame = job.nodes.values().map(|s| s.frame as f64).sum::<f64>()
        / job.nodes.len() as f64;
    (mean_frame - job.frames.start as f64) / frame_count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EngineVariant, FrameRange};
    use crate::output::{FAILED, FINISHED};

    fn snapshot(frame: i64, render_ms: u64, remaining_ms: Option<u64>) -> ProgressSnapshot {
        ProgressSnapshot {
            render_time_ms: render_ms,
            remaining_time_ms: remaining_ms,
            information: "Rendering".into(),
            ..ProgressSnapshot::placeholder(frame)
        }
    }

    fn job(render_type: RenderType) -> Job {
        let mut job = Job::new("shot", "/scenes/shot.blend", render_type, EngineVariant::Current);
        job.status = JobStatus::Rendering;
        job.frames = FrameRange::new(1, 10);
        job
    }

    #[test]
    fn test_still_progress_uses_remaining_time() {
        let mut job = job(RenderType::Still);
        job.nodes.insert(100, snapshot(1, 2_000, Some(2_000)));

        let progress = progress(&job);
        assert!((progress.fraction - 0.5).abs() < 1e-9);
        assert!(!progress.complete);
    }

    #[test]
    fn test_still_progress_without_remaining_time_is_zero() {
        let mut job = job(RenderType::Still);
        job.nodes.insert(100, snapshot(1, 2_000, None));

        assert_eq!(progress(&job).fraction, 0.0);
    }

    #[test]
    fn test_animation_progress_uses_mean_frame() {
        let mut job = job(RenderType::Animation);
        job.nodes.insert(100, snapshot(3, 0, None));
        job.nodes.insert(101, snapshot(5, 0, None));

        assert!((progress(&job).fraction - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_animation_progress_is_clamped() {
        let mut job = job(RenderType::Animation);
        job.nodes.insert(100, snapshot(-40, 0, None));
        assert_eq!(progress(&job).fraction, 0.0);

        job.nodes.insert(100, snapshot(400, 0, None));
        assert_eq!(progress(&job).fraction, 1.0);
    }

    #[test]
    fn test_finished_job_reports_full_progress() {
        let mut job = job(RenderType::Animation);
        job.status = JobStatus::Finished;

        assert_eq!(progress(&job).fraction, 1.0);
    }

    #[test]
    fn test_completion_needs_every_node_resolved() {
        let mut nodes = HashMap::new();
        assert!(!is_complete(&nodes));

        nodes.insert(1, ProgressSnapshot::placeholder(1));
        nodes.insert(2, ProgressSnapshot {
            information: FINISHED.into(),
            ..ProgressSnapshot::placeholder(1)
        });
        assert!(!is_complete(&nodes));

        nodes.insert(1, ProgressSnapshot {
            information: FAILED.into(),
            ..ProgressSnapshot::placeholder(1)
        });
        assert!(is_complete(&nodes));
        assert!(any_failed(&nodes));

        nodes.insert(3, ProgressSnapshot::placeholder(1));
        assert!(!is_complete(&nodes));
    }

    #[test]
    fn test_still_halfway_by_remaining_time() {
        let mut job = job(RenderType::Still);
        job.nodes.insert(100, snapshot(1, 50_000, Some(50_000)));

        assert_eq!(progress(&job).fraction, 0.5);
    }

    #[test]
    fn test_live_node_blocks_retirement() {
        let mut nodes = HashMap::new();
        nodes.insert(1, ProgressSnapshot {
            information: FINISHED.into(),
            ..ProgressSnapshot::placeholder(1)
        });
        nodes.insert(2, ProgressSnapshot {
            information: FINISHED.into(),
            ..ProgressSnapshot::placeholder(4)
        });
        assert!(is_complete(&nodes));

        // node 1 printed Finished for a frame and is still rendering the next
        assert!(!is_settled(&nodes, 1));
        assert!(is_settled(&nodes, 0));
        assert!(!is_settled(&HashMap::new(), 0));
    }
}
