use std::fmt;
use std::sync::Arc;

use tracing::info;

use crate::archive::{Archiver, ZipArchiver};
use crate::config::FarmConfig;
use crate::dispatcher::RenderFarm;
use crate::engine::{BlenderEngine, RenderEngine};
use crate::error::FarmError;
use crate::events::{FarmEventPublisher, InProcEventBus};

/// Builder for a [`RenderFarm`] with explicit dependencies.
///
/// The engine is required. The archiver defaults to [`ZipArchiver`] and the
/// event sink to an [`InProcEventBus`] sized by `event_capacity`.
///
/// ```ignore
/// let farm = RenderFarmBuilder::new(config)
///     .with_engine(Arc::new(BlenderEngine::new(config.engine.clone())))
///     .build()
///     .await?;
/// ```
pub struct RenderFarmBuilder {
    config: FarmConfig,
    engine: Option<Arc<dyn RenderEngine>>,
    archiver: Option<Arc<dyn Archiver>>,
    events: Option<Arc<dyn FarmEventPublisher>>,
}

impl fmt::Debug for RenderFarmBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderFarmBuilder")
            .field("config", &self.config)
            .field("engine_set", &self.engine.is_some())
            .field("archiver_set", &self.archiver.is_some())
            .field("events_set", &self.events.is_some())
            .finish()
    }
}

impl RenderFarmBuilder {
    pub fn new(config: FarmConfig) -> Self {
        Self {
            config,
            engine: None,
            archiver: None,
            events: None,
        }
    }

    pub fn with_engine(mut self, engine: Arc<dyn RenderEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn FarmEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Probe the engine's devices and start the farm.
    ///
    /// # Errors
    ///
    /// `Configuration` when the engine is missing or reports no devices,
    /// plus whatever the device query fails with.
    pub async fn build(self) -> Result<RenderFarm, FarmError> {
        let engine = self
            .engine
            .ok_or_else(|| FarmError::Configuration("engine dependency missing".into()))?;
        let archiver: Arc<dyn Archiver> = match self.archiver {
            Some(archiver) => archiver,
            None => Arc::new(ZipArchiver),
        };
        let events: Arc<dyn FarmEventPublisher> = match self.events {
            Some(events) => events,
            None => Arc::new(InProcEventBus::new(self.config.event_capacity)),
        };

        let device_count = engine.device_count().await?;
        if device_count == 0 {
            return Err(FarmError::Configuration(
                "engine reported no render devices".into(),
            ));
        }
        info!(
            devices = device_count,
            output_root = %self.config.output_root.display(),
            policy = ?self.config.dispatch_policy,
            "render farm starting"
        );

        Ok(RenderFarm::assemble(
            self.config,
            device_count,
            engine,
            archiver,
            events,
        ))
    }
}

impl RenderFarm {
    /// Validate `config` and start a farm driving the Blender binary it names.
    pub async fn with_blender(config: FarmConfig) -> Result<Self, FarmError> {
        config.validate()?;
        let engine = Arc::new(BlenderEngine::new(config.engine.clone()));
        RenderFarmBuilder::new(config).with_engine(engine).build().await
    }
}
