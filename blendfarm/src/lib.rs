//! Blendfarm - render Blender scenes across every GPU of one host.
//!
//! A render job names a scene file and whether a still or an animation is
//! wanted. The farm queries the scene, spreads the work over render devices
//! by launching engine subprocesses ("render nodes"), follows their stdout
//! to report progress, and bundles the result once every node is done.
//!
//! # Core Concepts
//!
//! - **Job**: a [`Job`] carries its lifecycle [`JobStatus`] and the latest
//!   [`ProgressSnapshot`] of every node it ran, keyed by pid.
//!
//! - **Devices**: the [`DevicePool`] holds one FIFO queue and one consume
//!   loop per device. A loop runs at most one node at a time.
//!
//! - **Nodes**: the [`NodeSupervisor`] spawns a node through the
//!   [`RenderEngine`] seam, streams its output through the parser in
//!   [`output`], and maps its exit status to a terminal token.
//!
//! - **Farm**: the [`RenderFarm`] registers, dispatches, cancels, deletes
//!   and archives jobs, publishing [`FarmEvent`]s to observers.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use blendfarm::*;
//!
//! let farm = RenderFarm::with_blender(FarmConfig::load(path).await?).await?;
//! let mut events = farm.subscribe();
//! let id = farm.register("shot", "/scenes/shot.blend", RenderType::Animation, EngineVariant::Current);
//! ```

/// Output archiving for finished animations.
pub mod archive;

/// Construction of a [`RenderFarm`] from explicit dependencies.
pub mod builder;

/// Farm, engine and dispatch-policy configuration loaded from TOML.
pub mod config;

/// Render devices, their FIFO queues and consume loops.
///
/// Queues are only touched by their own loop; everything else posts
/// messages into the loop's mailbox.
pub mod device;

/// The [`RenderFarm`] facade: preparation, dispatch, finalisation,
/// cancellation, deletion and output retrieval.
pub mod dispatcher;

/// The engine seam ([`RenderEngine`], [`RenderProcess`], [`NodeSignal`])
/// and the Blender implementation of it.
pub mod engine;

pub mod error;

/// Lifecycle events published to observers.
///
/// - [`FarmEvent`] and [`FarmEventPayload`] for event data
/// - [`FarmEventPublisher`] for sinks
/// - [`InProcEventBus`] for in-process broadcasting
pub mod events;

/// The job data model:
/// - [`JobId`] - id derived from scene path and registration time
/// - [`JobStatus`] - lifecycle states and their allowed transitions
/// - [`RenderType`], [`EngineVariant`], [`FrameRange`]
/// - [`Job`] - a job with its per-node snapshots
pub mod job;

#[cfg(feature = "metrics")]
/// Prometheus collectors, compiled with the `metrics` feature.
pub mod metrics;

/// Parser for the engine's per-frame status lines.
pub mod output;

/// Job progress and completion derived from node snapshots.
pub mod progress;

pub mod shutdown;

/// Job table shared by the farm and its nodes.
pub mod store;

/// Render node launch, progress streaming and exit handling.
pub mod supervisor;

/// Tracing spans and metric recording helpers.
pub mod telemetry;

pub use archive::{Archiver, ZipArchiver};
pub use builder::RenderFarmBuilder;
pub use config::{DispatchPolicy, EngineConfig, FarmConfig};
pub use device::{Device, DeviceClaim, DeviceDispatcher, DeviceId, DevicePool};
pub use dispatcher::RenderFarm;
pub use engine::{
    BlenderEngine, NodeExit, NodeSignal, RenderEngine, RenderProcess, RenderRequest,
    SceneData,
};
pub use error::FarmError;
pub use events::{EventMeta, FarmEvent, FarmEventPayload, FarmEventPublisher, InProcEventBus};
pub use job::{EngineVariant, FrameRange, Job, JobId, JobStatus, NodeId, RenderType};
pub use output::ProgressSnapshot;
pub use progress::JobProgress;
pub use shutdown::ShutdownToken;
pub use store::{JobStore, SharedJob};
pub use supervisor::{LiveNodes, NodeReport, NodeSupervisor};
