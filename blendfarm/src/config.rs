use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::FarmError;

/// How an animation on a multi-instance engine is spread over devices.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Queue the job on every device; each device runs one node when it
    /// reaches the job.
    #[default]
    PerDeviceQueue,
    /// Start one node per idle device when there are at least as many idle
    /// devices as frames, otherwise a single node on the idle devices.
    SplitWhenEnoughDevices,
}

/// Top-level farm configuration, usually loaded from TOML.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    /// Directory holding per-job output folders and archives.
    pub output_root: PathBuf,
    pub dispatch_policy: DispatchPolicy,
    /// Buffered events per subscriber before it starts lagging.
    pub event_capacity: usize,
    pub engine: EngineConfig,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("renders"),
            dispatch_policy: DispatchPolicy::default(),
            event_capacity: 1024,
            engine: EngineConfig::default(),
        }
    }
}

impl FarmConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, FarmError> {
        Ok(toml::from_str(raw)?)
    }

    pub async fn load(path: &Path) -> Result<Self, FarmError> {
        let raw = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), FarmError> {
        if self.event_capacity == 0 {
            return Err(FarmError::Configuration(
                "event_capacity must be greater than zero".into(),
            ));
        }
        self.engine.validate()
    }
}

/// Location of the engine binary and the scripts it is driven with.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub executable: PathBuf,
    pub scripts_dir: PathBuf,
    /// Prints the scene's frame range and engine kind.
    pub data_script: String,
    /// Prints the number of render devices on this host.
    pub devices_script: String,
    /// Renders a still or an animation from a JSON argument.
    pub render_script: String,
    /// Engine kinds that cannot run several instances at once.
    pub single_instance_engines: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("/usr/bin/blender"),
            scripts_dir: PathBuf::from("engine-scripts"),
            data_script: "get_data.py".into(),
            devices_script: "get_devices.py".into(),
            render_script: "render.py".into(),
            single_instance_engines: vec![
                "BLENDER_EEVEE".into(),
                "BLENDER_EEVEE_NEXT".into(),
            ],
        }
    }
}

impl EngineConfig {
    pub fn data_script_path(&self) -> PathBuf {
        self.scripts_dir.join(&self.data_script)
    }

    pub fn devices_script_path(&self) -> PathBuf {
        self.scripts_dir.join(&self.devices_script)
    }

    pub fn render_script_path(&self) -> PathBuf {
        self.scripts_dir.join(&self.render_script)
    }

    /// Whether scenes using `engine_kind` must render in a single process.
    pub fn is_single_instance(&self, engine_kind: &str) -> bool {
        self.single_instance_engines
            .iter()
            .any(|kind| kind.eq_ignore_ascii_case(engine_kind))
    }

    pub fn validate(&self) -> Result<(), FarmError> {
        if !self.executable.is_file() {
            return Err(FarmError::Configuration(format!(
                "engine executable {} does not exist",
                self.executable.display()
            )));
        }
        for script in [
            self.data_script_path(),
            self.devices_script_path(),
            self.render_script_path(),
        ] {
            if !script.is_file() {
                return Err(FarmError::Configuration(format!(
                    "engine script {} does not exist",
                    script.display()
                )));
            }
        }
        Ok(())
    }
}
