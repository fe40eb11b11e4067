use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::output::ProgressSnapshot;
use crate::progress::{self, JobProgress};

/// Operating-system process id of a render node.
pub type NodeId = u32;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Derive an id from the scene path and the instant the job was registered.
    pub fn derive(scene: &Path, registered_at: DateTime<Utc>) -> Self {
        let seed = format!(
            "{}@{}",
            scene.display(),
            registered_at.timestamp_nanos_opt().unwrap_or_default()
        );
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()))
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderType {
    Still,
    Animation,
}

impl RenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RenderType::Still => "still",
            RenderType::Animation => "animation",
        }
    }
}

impl Display for RenderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build flavour of the engine a job targets.
///
/// Legacy builds crash with a segmentation fault after writing a still
/// image; the supervisor treats that exit as success.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EngineVariant {
    #[default]
    Current,
    Legacy,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: i64,
    pub end: i64,
}

impl FrameRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Number of frames in the inclusive range, zero when it is inverted.
    pub fn frame_count(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::try_from(self.end - self.start + 1).unwrap_or(usize::MAX)
        }
    }
}

/// Lifecycle of a render job.
///
/// `Pending -> GatheringData -> Pending -> Rendering -> {Finished | Failed}`,
/// with `Canceled` reachable from every non-terminal state. Terminal states
/// are never left again.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    GatheringData,
    Rendering,
    Finished,
    Canceled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Canceled | JobStatus::Failed
        )
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::GatheringData => 1,
            JobStatus::Rendering => 2,
            JobStatus::Finished | JobStatus::Canceled | JobStatus::Failed => 3,
        }
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            // metadata gathered, waiting for a device
            (JobStatus::GatheringData, JobStatus::Pending) => true,
            (from, to) => to.rank() > from.rank(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::GatheringData => "Gathering data",
            JobStatus::Rendering => "Rendering",
            JobStatus::Finished => "Finished",
            JobStatus::Canceled => "Canceled",
            JobStatus::Failed => "Failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A render job and everything observed about it so far.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub render_type: RenderType,
    pub scene: PathBuf,
    pub frames: FrameRange,
    /// Engine kind reported by the scene (e.g. `CYCLES`), known after metadata.
    pub engine_kind: Option<String>,
    pub variant: EngineVariant,
    /// Latest snapshot per live or finished render node, keyed by pid.
    pub nodes: HashMap<NodeId, ProgressSnapshot>,
    pub init_time: DateTime<Utc>,
    pub complete_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        name: impl Into<String>,
        scene: impl Into<PathBuf>,
        render_type: RenderType,
        variant: EngineVariant,
    ) -> Self {
        let scene = scene.into();
        let init_time = Utc::now();
        Self {
            id: JobId::derive(&scene, init_time),
            name: name.into(),
            status: JobStatus::Pending,
            render_type,
            scene,
            frames: FrameRange::default(),
            engine_kind: None,
            variant,
            nodes: HashMap::new(),
            init_time,
            complete_time: None,
            error: None,
        }
    }

    /// Move to `next` if the lifecycle allows it. Returns whether it moved.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Base name shared by the output folder, the rendered files and the archive.
    pub fn output_name(&self) -> String {
        let name: String = self
            .name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{name}_{}", self.id)
    }

    pub fn output_folder(&self, root: &Path) -> PathBuf {
        root.join(self.output_name())
    }

    /// Path of the image a still job writes.
    pub fn still_output(&self, root: &Path) -> PathBuf {
        self.output_folder(root)
            .join(format!("{}.png", self.output_name()))
    }

    /// Path of the archive bundling an animation's frames.
    pub fn archive_path(&self, root: &Path) -> PathBuf {
        root.join(format!("{}.zip", self.output_name()))
    }

    pub fn progress(&self) -> JobProgress {
        progress::progress(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_moves_forward_only() {
        use JobStatus::*;

        assert!(Pending.can_transition_to(GatheringData));
        assert!(GatheringData.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Rendering));
        assert!(Rendering.can_transition_to(Finished));
        assert!(!Rendering.can_transition_to(Pending));
        assert!(!Rendering.can_transition_to(GatheringData));
    }

    #[test]
    fn test_terminal_status_is_never_left() {
        use JobStatus::*;

        for terminal in [Finished, Canceled, Failed] {
            for next in [Pending, GatheringData, Rendering, Finished, Canceled, Failed]
            {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn test_cancel_is_reachable_from_every_live_status() {
        use JobStatus::*;

        for live in [Pending, GatheringData, Rendering] {
            assert!(live.can_transition_to(Canceled));
        }
    }

    #[test]
    fn test_late_finish_does_not_override_cancel() {
        let mut job =
            Job::new("shot", "/scenes/shot.blend", RenderType::Still, EngineVariant::Current);
        assert!(job.transition(JobStatus::Rendering));
        assert!(job.transition(JobStatus::Canceled));
        assert!(!job.transition(JobStatus::Finished));
        assert_eq!(job.status, JobStatus::Canceled);
    }

    #[test]
    fn test_output_paths_share_a_sanitised_base_name() {
        let job = Job::new(
            "../my shot",
            "/scenes/shot.blend",
            RenderType::Animation,
            EngineVariant::Current,
        );
        let root = Path::new("/srv/renders");
        let base = job.output_name();

        assert!(base.starts_with(".._my_shot_"));
        assert!(!base.contains('/'));
        assert_eq!(job.output_folder(root), root.join(&base));
        assert_eq!(job.archive_path(root), root.join(format!("{base}.zip")));
        assert_eq!(
            job.still_output(root),
            root.join(&base).join(format!("{base}.png"))
        );
    }

    #[test]
    fn test_ids_differ_by_scene_and_time() {
        let at = Utc::now();
        let a = JobId::derive(Path::new("/a.blend"), at);
        let b = JobId::derive(Path::new("/b.blend"), at);
        let later = JobId::derive(Path::new("/a.blend"), at + chrono::Duration::nanoseconds(1));

        assert_ne!(a, b);
        assert_ne!(a, later);
        assert_eq!(a, JobId::derive(Path::new("/a.blend"), at));
    }

    #[test]
    fn test_frame_count_is_inclusive() {
        assert_eq!(FrameRange::new(1, 10).frame_count(), 10);
        assert_eq!(FrameRange::new(5, 5).frame_count(), 1);
        assert_eq!(FrameRange::new(5, 4).frame_count(), 0);
    }
}
