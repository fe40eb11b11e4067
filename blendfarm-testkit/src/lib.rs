//! Test doubles for blendfarm: a scripted engine, a counting archiver and
//! small async helpers.

mod archiver;
mod engine;

use std::time::Duration;

use blendfarm::{FarmEvent, FarmEventPayload, Job, JobId};
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep, timeout};

pub use archiver::{ArchiveRecord, CountingArchiver};
pub use engine::{FakeEngine, LaunchRecord, NodeScript};

/// Default bound for waits in tests.
pub const WAIT: Duration = Duration::from_secs(5);

/// A well-formed engine progress line.
pub fn progress_line(frame: i64, information: &str) -> String {
    format!(
        "Fra:{frame} Mem:12.00M (0.00M, Peak 24.00M) | Time:00:01.50 | Remaining:00:03.25 | Mem:8.00M, Peak:8.00M | Scene, View Layer | {information}"
    )
}

/// Poll `condition` until it holds or `within` elapses. Returns whether it held.
pub async fn wait_for(mut condition: impl FnMut() -> bool, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(5)).await;
    }
}

/// Next event for `id` matching `accept`, skipping everything else.
pub async fn next_event(
    events: &mut broadcast::Receiver<FarmEvent>,
    id: JobId,
    mut accept: impl FnMut(&FarmEvent) -> bool,
) -> Option<FarmEvent> {
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) if event.meta.job_id == id && accept(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// The job carried by `id`'s `JobEnd` event.
pub async fn next_job_end(
    events: &mut broadcast::Receiver<FarmEvent>,
    id: JobId,
) -> Option<Job> {
    let event = next_event(events, id, |event| {
        matches!(event.payload, FarmEventPayload::JobEnd { .. })
    })
    .await?;
    match event.payload {
        FarmEventPayload::JobEnd { job } => Some(job),
        _ => None,
    }
}
