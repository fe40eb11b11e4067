use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use blendfarm::engine::{
    NodeExit, NodeSignal, RenderEngine, RenderProcess, RenderRequest, SceneData, Signal,
};
use blendfarm::{FarmError, NodeId};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// What a fake render node does once launched.
#[derive(Clone, Debug)]
pub enum NodeScript {
    /// Print `lines` on stdout, then exit with `exit`.
    Lines { lines: Vec<String>, exit: NodeExit },
    /// Stay alive until terminated, or until the test calls
    /// [`FakeEngine::emit`] / [`FakeEngine::exit`].
    Hold,
}

impl NodeScript {
    pub fn succeed() -> Self {
        NodeScript::Lines {
            lines: Vec::new(),
            exit: NodeExit::success(),
        }
    }

    pub fn fail(code: i32) -> Self {
        NodeScript::Lines {
            lines: Vec::new(),
            exit: NodeExit::code(code),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LaunchRecord {
    pub pid: NodeId,
    pub request: RenderRequest,
}

#[derive(Debug)]
enum FakeOutput {
    Line(String),
    Exit(NodeExit),
}

struct FakeState {
    device_count: usize,
    scene: Result<SceneData, String>,
    scripts: VecDeque<NodeScript>,
    default_script: NodeScript,
    spawn_error: Option<String>,
    next_pid: NodeId,
    launches: Vec<LaunchRecord>,
    terminated: Vec<NodeId>,
    controls: HashMap<NodeId, mpsc::UnboundedSender<FakeOutput>>,
}

/// In-memory [`RenderEngine`] with scripted nodes.
///
/// Launches consume queued scripts in order and fall back to the default
/// script, which exits successfully without output unless replaced.
#[derive(Clone)]
pub struct FakeEngine {
    state: Arc<Mutex<FakeState>>,
}

impl std::fmt::Debug for FakeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FakeEngine")
            .field("device_count", &state.device_count)
            .field("launches", &state.launches.len())
            .field("terminated", &state.terminated)
            .finish()
    }
}

impl FakeEngine {
    pub fn new(device_count: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                device_count,
                scene: Ok(SceneData {
                    start_frame: 1,
                    end_frame: 10,
                    engine: "CYCLES".into(),
                }),
                scripts: VecDeque::new(),
                default_script: NodeScript::succeed(),
                spawn_error: None,
                next_pid: 10_000,
                launches: Vec::new(),
                terminated: Vec::new(),
                controls: HashMap::new(),
            })),
        }
    }

    pub fn with_scene(self, start_frame: i64, end_frame: i64, engine: &str) -> Self {
        self.state.lock().scene = Ok(SceneData {
            start_frame,
            end_frame,
            engine: engine.into(),
        });
        self
    }

    /// Make the scene data query fail as if no data line was printed.
    pub fn with_scene_error(self, reason: &str) -> Self {
        self.state.lock().scene = Err(reason.into());
        self
    }

    pub fn with_default_script(self, script: NodeScript) -> Self {
        self.state.lock().default_script = script;
        self
    }

    /// Make every launch fail before a process exists.
    pub fn with_spawn_error(self, reason: &str) -> Self {
        self.state.lock().spawn_error = Some(reason.into());
        self
    }

    /// Queue a script for the next launch.
    pub fn push_script(&self, script: NodeScript) {
        self.state.lock().scripts.push_back(script);
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.state.lock().launches.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.state.lock().launches.len()
    }

    /// Pids that received the termination signal, in order.
    pub fn terminated(&self) -> Vec<NodeId> {
        self.state.lock().terminated.clone()
    }

    /// Print a line on a held node's stdout. Returns false if the node is gone.
    pub fn emit(&self, pid: NodeId, line: impl Into<String>) -> bool {
        self.send(pid, FakeOutput::Line(line.into()))
    }

    /// Make a held node exit.
    pub fn exit(&self, pid: NodeId, exit: NodeExit) -> bool {
        self.send(pid, FakeOutput::Exit(exit))
    }

    fn send(&self, pid: NodeId, output: FakeOutput) -> bool {
        match self.state.lock().controls.get(&pid) {
            Some(control) => control.send(output).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl RenderEngine for FakeEngine {
    async fn device_count(&self) -> Result<usize, FarmError> {
        Ok(self.state.lock().device_count)
    }

    async fn scene_data(&self, _scene: &Path) -> Result<SceneData, FarmError> {
        self.state
            .lock()
            .scene
            .clone()
            .map_err(FarmError::InvalidEngineOutput)
    }

    async fn spawn_render(
        &self,
        request: &RenderRequest,
    ) -> Result<Box<dyn RenderProcess>, FarmError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.spawn_error {
            return Err(FarmError::Spawn {
                executable: "fake-engine".into(),
                source: std::io::Error::other(reason.clone()),
            });
        }

        let pid = state.next_pid;
        state.next_pid += 1;
        let script = match state.scripts.pop_front() {
            Some(script) => script,
            None => state.default_script.clone(),
        };

        let (control, output) = mpsc::unbounded_channel();
        if let NodeScript::Lines { lines, exit } = script {
            for line in lines {
                let _ = control.send(FakeOutput::Line(line));
            }
            let _ = control.send(FakeOutput::Exit(exit));
        }

        state.controls.insert(pid, control.clone());
        state.launches.push(LaunchRecord {
            pid,
            request: request.clone(),
        });

        Ok(Box::new(FakeProcess {
            pid,
            output,
            exit: None,
            signal: Arc::new(FakeSignal {
                pid,
                control,
                state: Arc::clone(&self.state),
            }),
        }))
    }
}

struct FakeProcess {
    pid: NodeId,
    output: mpsc::UnboundedReceiver<FakeOutput>,
    exit: Option<NodeExit>,
    signal: Arc<FakeSignal>,
}

#[async_trait]
impl RenderProcess for FakeProcess {
    fn pid(&self) -> NodeId {
        self.pid
    }

    fn signal(&self) -> Arc<dyn NodeSignal> {
        self.signal.clone()
    }

    async fn next_line(&mut self) -> Result<Option<String>, FarmError> {
        if self.exit.is_some() {
            return Ok(None);
        }
        match self.output.recv().await {
            Some(FakeOutput::Line(line)) => Ok(Some(line)),
            Some(FakeOutput::Exit(exit)) => {
                self.exit = Some(exit);
                Ok(None)
            }
            None => {
                self.exit = Some(NodeExit::signaled(Signal::SIGKILL));
                Ok(None)
            }
        }
    }

    async fn wait(&mut self) -> Result<NodeExit, FarmError> {
        while self.exit.is_none() {
            self.next_line().await?;
        }
        let exit = self.exit.unwrap_or_else(NodeExit::success);
        self.signal.state.lock().controls.remove(&self.pid);
        Ok(exit)
    }
}

struct FakeSignal {
    pid: NodeId,
    control: mpsc::UnboundedSender<FakeOutput>,
    state: Arc<Mutex<FakeState>>,
}

impl NodeSignal for FakeSignal {
    fn terminate(&self) -> Result<(), FarmError> {
        self.state.lock().terminated.push(self.pid);
        let _ = self
            .control
            .send(FakeOutput::Exit(NodeExit::signaled(Signal::SIGTERM)));
        Ok(())
    }
}
