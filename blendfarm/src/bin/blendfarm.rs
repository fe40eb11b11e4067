use std::path::PathBuf;

use anyhow::{Context, bail};
use blendfarm::engine::BlenderEngine;
use blendfarm::{
    EngineVariant, FarmConfig, FarmEvent, FarmEventPayload, JobStatus, RenderEngine, RenderFarm,
    RenderType,
};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "blendfarm")]
#[command(about = "Render Blender scenes across every GPU on this host")]
struct Cli {
    /// Farm configuration file (TOML). Defaults apply when it does not exist.
    #[arg(short, long, env = "BLENDFARM_CONFIG", default_value = "blendfarm.toml")]
    config: PathBuf,

    /// Folder receiving job output (overrides config)
    #[arg(long, env = "BLENDFARM_OUTPUT_ROOT")]
    output_root: Option<PathBuf>,

    /// Blender executable (overrides config)
    #[arg(long, env = "BLENDFARM_ENGINE")]
    engine: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the number of render devices the engine reports
    Devices,
    /// Render one scene and print the path of the result
    Render(RenderArgs),
}

#[derive(ClapArgs, Debug)]
struct RenderArgs {
    #[arg(long)]
    name: String,

    #[arg(long)]
    scene: PathBuf,

    #[arg(long = "type", value_enum, default_value_t = RenderKind::Still)]
    render_type: RenderKind,

    /// Target a legacy engine build
    #[arg(long)]
    legacy: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RenderKind {
    Still,
    Animation,
}

impl From<RenderKind> for RenderType {
    fn from(kind: RenderKind) -> Self {
        match kind {
            RenderKind::Still => RenderType::Still,
            RenderKind::Animation => RenderType::Animation,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,blendfarm=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = if cli.config.exists() {
        FarmConfig::load(&cli.config)
            .await
            .with_context(|| format!("failed to load {}", cli.config.display()))?
    } else {
        info!(path = %cli.config.display(), "config file not found, using defaults");
        FarmConfig::default()
    };
    if let Some(output_root) = cli.output_root {
        config.output_root = output_root;
    }
    if let Some(engine) = cli.engine {
        config.engine.executable = engine;
    }

    match cli.command {
        Command::Devices => {
            config.engine.validate().context("invalid engine configuration")?;
            let count = BlenderEngine::new(config.engine)
                .device_count()
                .await
                .context("device query failed")?;
            println!("{count}");
            Ok(())
        }
        Command::Render(args) => render(config, args).await,
    }
}

async fn render(config: FarmConfig, args: RenderArgs) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.output_root)
        .await
        .with_context(|| format!("failed to create {}", config.output_root.display()))?;

    let farm = RenderFarm::with_blender(config)
        .await
        .context("failed to start render farm")?;
    let mut events = farm.subscribe();

    let variant = if args.legacy {
        EngineVariant::Legacy
    } else {
        EngineVariant::Current
    };
    let id = farm.register(args.name, args.scene, args.render_type.into(), variant);
    info!(job_id = %id, "job registered");

    let job = loop {
        tokio::select! {
            interrupt = tokio::signal::ctrl_c() => {
                interrupt.context("failed to listen for ctrl-c")?;
                warn!(job_id = %id, "interrupted, canceling job");
                farm.cancel(id)?;
            }
            event = events.recv() => match event {
                Ok(FarmEvent { meta, payload }) if meta.job_id == id => match payload {
                    FarmEventPayload::JobStart { .. } => info!(job_id = %id, "rendering started"),
                    FarmEventPayload::JobStatus { job, node, snapshot } => info!(
                        job_id = %id,
                        node,
                        frame = snapshot.frame,
                        information = %snapshot.information,
                        progress = job.progress().fraction,
                        "progress"
                    ),
                    FarmEventPayload::JobEnd { job } => break job,
                },
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress events dropped"),
                Err(RecvError::Closed) => bail!("event stream closed before the job ended"),
            },
        }
    };

    if job.status != JobStatus::Finished {
        farm.shutdown().await;
        bail!(
            "job ended as {}: {}",
            job.status,
            job.error.as_deref().unwrap_or("no error recorded")
        );
    }

    let output = farm.retrieve_output(id).await?;
    farm.shutdown().await;
    println!("{}", output.display());
    Ok(())
}
