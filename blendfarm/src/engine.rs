//! The render engine seam.
//!
//! [`RenderEngine`] hides how render nodes are launched so the farm can be
//! driven by the real Blender binary ([`BlenderEngine`]) or by a scripted
//! fake in tests. Engine invocations follow one convention: the engine runs
//! headless with a Python script, and query scripts answer by printing a
//! single `render_farm_data=<json>` line on stdout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

pub use nix::sys::signal::Signal;

use crate::config::EngineConfig;
use crate::device::DeviceId;
use crate::error::FarmError;
use crate::job::{FrameRange, NodeId, RenderType};

/// Prefix of the stdout line query scripts answer with.
pub const DATA_PREFIX: &str = "render_farm_data=";

/// Signal sent to render nodes of a canceled job.
pub const TERMINATE_SIGNAL: Signal = Signal::SIGTERM;

/// Signal legacy engine builds die with after writing a still.
pub const LEGACY_STILL_SIGNAL: Signal = Signal::SIGSEGV;

/// Scene metadata answered by the data query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneData {
    pub start_frame: i64,
    pub end_frame: i64,
    /// Engine kind the scene renders with, e.g. `CYCLES`.
    pub engine: String,
}

impl SceneData {
    pub fn frames(&self) -> FrameRange {
        FrameRange::new(self.start_frame, self.end_frame)
    }
}

/// Everything needed to launch one render node.
///
/// Serializes to the JSON argument handed to the render script.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    #[serde(skip)]
    pub scene: PathBuf,
    #[serde(rename = "type")]
    pub render_type: RenderType,
    pub devices: Vec<DeviceId>,
    pub output_folder: PathBuf,
    pub file_name: String,
}

/// How a render node exited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl NodeExit {
    pub fn success() -> Self {
        Self::code(0)
    }

    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: Signal) -> Self {
        Self {
            code: None,
            signal: Some(signal as i32),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn is_signal(&self, signal: Signal) -> bool {
        self.signal == Some(signal as i32)
    }
}

impl std::fmt::Display for NodeExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => match Signal::try_from(signal) {
                Ok(signal) => write!(f, "signal {signal}"),
                Err(_) => write!(f, "signal {signal}"),
            },
            (None, None) => f.write_str("unknown exit"),
        }
    }
}

impl From<std::process::ExitStatus> for NodeExit {
    fn from(status: std::process::ExitStatus) -> Self {
        use std::os::unix::process::ExitStatusExt;

        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// Handle able to ask a running node to stop.
pub trait NodeSignal: Send + Sync {
    fn terminate(&self) -> Result<(), FarmError>;
}

/// A launched render node.
#[async_trait]
pub trait RenderProcess: Send {
    fn pid(&self) -> NodeId;

    fn signal(&self) -> Arc<dyn NodeSignal>;

    /// Next stdout line, `None` once the stream is closed.
    async fn next_line(&mut self) -> Result<Option<String>, FarmError>;

    async fn wait(&mut self) -> Result<NodeExit, FarmError>;
}

#[async_trait]
pub trait RenderEngine: Send + Sync {
    /// Number of render devices available on this host.
    async fn device_count(&self) -> Result<usize, FarmError>;

    async fn scene_data(&self, scene: &Path) -> Result<SceneData, FarmError>;

    async fn spawn_render(
        &self,
        request: &RenderRequest,
    ) -> Result<Box<dyn RenderProcess>, FarmError>;
}

/// Extract the payload of a query answer line, if `line` is one.
pub fn parse_data_line<T: DeserializeOwned>(
    line: &str,
) -> Option<Result<T, FarmError>> {
    let payload = line.trim().strip_prefix(DATA_PREFIX)?;
    Some(serde_json::from_str(payload).map_err(FarmError::from))
}

/// Drives the Blender binary in background mode.
#[derive(Clone, Debug)]
pub struct BlenderEngine {
    config: EngineConfig,
}

impl BlenderEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn command(&self, scene: Option<&Path>, script: &Path) -> Command {
        let mut cmd = Command::new(&self.config.executable);
        cmd.arg("-b");
        if let Some(scene) = scene {
            cmd.arg(scene);
        }
        cmd.arg("-P").arg(script);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }

    fn spawn(&self, cmd: &mut Command) -> Result<Child, FarmError> {
        cmd.spawn().map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound
            | std::io::ErrorKind::PermissionDenied => {
                FarmError::Configuration(format!(
                    "engine executable {} is not runnable: {source}",
                    self.config.executable.display()
                ))
            }
            _ => FarmError::Spawn {
                executable: self.config.executable.clone(),
                source,
            },
        })
    }

    /// Run a query and return the first data line it prints.
    ///
    /// The query is killed as soon as the answer is read; engines tend to
    /// linger after their script finished.
    async fn query<T: DeserializeOwned>(
        &self,
        mut cmd: Command,
        what: &str,
    ) -> Result<T, FarmError> {
        cmd.stdout(Stdio::piped()).stderr(Stdio::null());
        let mut child = self.spawn(&mut cmd)?;
        let stdout = child.stdout.take().ok_or_else(|| {
            FarmError::InvalidEngineOutput(format!("{what} query has no stdout"))
        })?;

        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            if let Some(answer) = parse_data_line(&line) {
                if let Err(err) = child.start_kill() {
                    debug!(error = %err, "{what} query already exited");
                }
                let _ = child.wait().await;
                return answer;
            }
        }

        let status = child.wait().await?;
        Err(FarmError::InvalidEngineOutput(format!(
            "{what} query exited ({}) without a `{DATA_PREFIX}` line",
            NodeExit::from(status)
        )))
    }
}

#[async_trait]
impl RenderEngine for BlenderEngine {
    async fn device_count(&self) -> Result<usize, FarmError> {
        let cmd = self.command(None, &self.config.devices_script_path());
        self.query(cmd, "device").await
    }

    async fn scene_data(&self, scene: &Path) -> Result<SceneData, FarmError> {
        let cmd = self.command(Some(scene), &self.config.data_script_path());
        self.query(cmd, "scene data").await
    }

    async fn spawn_render(
        &self,
        request: &RenderRequest,
    ) -> Result<Box<dyn RenderProcess>, FarmError> {
        let argument = serde_json::to_string(request)?;
        let mut cmd =
            self.command(Some(&request.scene), &self.config.render_script_path());
        cmd.arg("--")
            .arg(argument)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = self.spawn(&mut cmd)?;
        let pid = child.id().ok_or_else(|| {
            FarmError::InvalidEngineOutput("render node exited before reporting a pid".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            FarmError::InvalidEngineOutput(format!("render node {pid} has no stdout"))
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(pid, "engine stderr: {line}");
                }
            });
        }

        debug!(pid, devices = ?request.devices, "render node spawned");
        Ok(Box::new(BlenderProcess {
            pid,
            child,
            stdout: BufReader::new(stdout).lines(),
        }))
    }
}

struct BlenderProcess {
    pid: NodeId,
    child: Child,
    stdout: Lines<BufReader<ChildStdout>>,
}

#[async_trait]
impl RenderProcess for BlenderProcess {
    fn pid(&self) -> NodeId {
        self.pid
    }

    fn signal(&self) -> Arc<dyn NodeSignal> {
        Arc::new(PidSignal { pid: self.pid })
    }

    async fn next_line(&mut self) -> Result<Option<String>, FarmError> {
        Ok(self.stdout.next_line().await?)
    }

    async fn wait(&mut self) -> Result<NodeExit, FarmError> {
        Ok(self.child.wait().await?.into())
    }
}

/// Terminates a process by pid.
#[derive(Clone, Copy, Debug)]
pub struct PidSignal {
    pid: NodeId,
}

impl PidSignal {
    pub fn new(pid: NodeId) -> Self {
        Self { pid }
    }
}

impl NodeSignal for PidSignal {
    fn terminate(&self) -> Result<(), FarmError> {
        let raw = i32::try_from(self.pid).map_err(|_| FarmError::Signal {
            pid: self.pid,
            reason: "pid out of range".into(),
        })?;
        match kill(Pid::from_raw(raw), TERMINATE_SIGNAL) {
            Ok(()) => Ok(()),
            // already gone
            Err(Errno::ESRCH) => {
                warn!(pid = self.pid, "render node exited before it could be signalled");
                Ok(())
            }
            Err(errno) => Err(FarmError::Signal {
                pid: self.pid,
                reason: errno.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_line_is_extracted() {
        let data: SceneData = parse_data_line(
            r#"render_farm_data={"startFrame":1,"endFrame":250,"engine":"CYCLES"}"#,
        )
        .expect("data line")
        .expect("valid json");

        assert_eq!(data.frames(), FrameRange::new(1, 250));
        assert_eq!(data.engine, "CYCLES");
    }

    #[test]
    fn test_other_lines_are_not_data_lines() {
        assert!(parse_data_line::<usize>("Blender 4.1.0").is_none());
        assert!(matches!(
            parse_data_line::<usize>("render_farm_data=not json"),
            Some(Err(FarmError::Json(_)))
        ));
    }

    #[test]
    fn test_render_request_argument_shape() {
        let request = RenderRequest {
            scene: PathBuf::from("/scenes/shot.blend"),
            render_type: RenderType::Animation,
            devices: vec![0, 2],
            output_folder: PathBuf::from("/srv/renders/shot_1"),
            file_name: "shot_1".into(),
        };

        let value = serde_json::to_value(&request).expect("serializes");
        assert_eq!(
            value,
            serde_json::json!({
                "type": "animation",
                "devices": [0, 2],
                "outputFolder": "/srv/renders/shot_1",
                "fileName": "shot_1",
            })
        );
    }

    #[test]
    fn test_node_exit_classification() {
        assert!(NodeExit::success().is_success());
        assert!(!NodeExit::code(1).is_success());
        assert!(NodeExit::signaled(Signal::SIGTERM).is_signal(TERMINATE_SIGNAL));
        assert_eq!(NodeExit::signaled(Signal::SIGSEGV).to_string(), "signal SIGSEGV");
    }

    #[tokio::test]
    async fn test_query_reads_data_line_from_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executable = dir.path().join("fake-engine.sh");
        std::fs::write(
            &executable,
            "#!/bin/sh\necho 'Blender (fake)'\necho 'render_farm_data=3'\n",
        )
        .expect("write script");
        set_executable(&executable);

        let engine = BlenderEngine::new(EngineConfig {
            executable,
            scripts_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        });

        assert_eq!(engine.device_count().await.expect("query answers"), 3);
    }

    #[tokio::test]
    async fn test_query_without_data_line_is_invalid_output() {
        let dir = tempfile::tempdir().expect("tempdir");
        let executable = dir.path().join("fake-engine.sh");
        std::fs::write(&executable, "#!/bin/sh\necho 'nothing useful'\n")
            .expect("write script");
        set_executable(&executable);

        let engine = BlenderEngine::new(EngineConfig {
            executable,
            scripts_dir: dir.path().to_path_buf(),
            ..EngineConfig::default()
        });

        let err = engine
            .scene_data(Path::new("/scenes/shot.blend"))
            .await
            .expect_err("no data line");
        assert!(matches!(err, FarmError::InvalidEngineOutput(_)));
    }

    #[tokio::test]
    async fn test_missing_binary_is_a_configuration_error() {
        let engine = BlenderEngine::new(EngineConfig {
            executable: PathBuf::from("/nonexistent/blender"),
            ..EngineConfig::default()
        });

        let err = engine.device_count().await.expect_err("binary missing");
        assert!(err.is_fatal());
    }

    fn set_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;

        let mut permissions = std::fs::metadata(path).expect("metadata").permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(path, permissions).expect("chmod");
    }
}
