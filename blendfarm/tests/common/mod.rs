#![allow(dead_code)]

use std::sync::Arc;

use blendfarm::engine::NodeExit;
use blendfarm::{DeviceId, FarmConfig, JobId, JobStatus, RenderFarm, RenderFarmBuilder};
use blendfarm_testkit::{CountingArchiver, FakeEngine, WAIT};
use tempfile::TempDir;
use tokio::time::{Instant, sleep};

pub struct TestFarm {
    pub farm: RenderFarm,
    pub engine: FakeEngine,
    pub archiver: CountingArchiver,
    pub root: TempDir,
}

pub async fn start(engine: FakeEngine) -> TestFarm {
    start_with(engine, |_| {}).await
}

pub async fn start_with(engine: FakeEngine, configure: impl FnOnce(&mut FarmConfig)) -> TestFarm {
    let root = tempfile::tempdir().expect("tempdir");
    let mut config = FarmConfig {
        output_root: root.path().to_path_buf(),
        ..FarmConfig::default()
    };
    configure(&mut config);

    let archiver = CountingArchiver::new();
    let farm = RenderFarmBuilder::new(config)
        .with_engine(Arc::new(engine.clone()))
        .with_archiver(Arc::new(archiver.clone()))
        .build()
        .await
        .expect("farm starts");

    TestFarm {
        farm,
        engine,
        archiver,
        root,
    }
}

/// Wait until a device's queue holds exactly `expected`.
pub async fn wait_pending(farm: &RenderFarm, device: DeviceId, expected: &[JobId]) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if farm.devices().pending(device).await.as_deref() == Some(expected) {
            return true;
        }
        sleep(std::time::Duration::from_millis(5)).await;
    }
    false
}

pub async fn wait_status(farm: &RenderFarm, id: JobId, status: JobStatus) -> bool {
    blendfarm_testkit::wait_for(
        || farm.job(id).map(|job| job.status == status).unwrap_or(false),
        WAIT,
    )
    .await
}

/// Let every node launched so far exit successfully.
pub fn release_all(engine: &FakeEngine) {
    for launch in engine.launches() {
        engine.exit(launch.pid, NodeExit::success());
    }
}
