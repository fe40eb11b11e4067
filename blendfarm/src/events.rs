use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::job::{Job, JobId, NodeId};
use crate::output::ProgressSnapshot;

/// Metadata attached to every farm event.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    pub version: u16,
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(job_id: JobId) -> Self {
        Self {
            version: 1,
            job_id,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct FarmEvent {
    pub meta: EventMeta,
    pub payload: FarmEventPayload,
}

/// Lifecycle notifications, each carrying a copy of the job at publish time.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum FarmEventPayload {
    /// First transition into `Rendering`; sent once per job.
    JobStart { job: Job },
    /// A render node reported a new progress line.
    JobStatus {
        job: Job,
        node: NodeId,
        snapshot: ProgressSnapshot,
    },
    /// The job reached a terminal status; sent once per job.
    JobEnd { job: Job },
}

impl FarmEvent {
    pub fn job_start(job: Job) -> Self {
        Self {
            meta: EventMeta::new(job.id),
            payload: FarmEventPayload::JobStart { job },
        }
    }

    pub fn job_status(job: Job, node: NodeId, snapshot: ProgressSnapshot) -> Self {
        Self {
            meta: EventMeta::new(job.id),
            payload: FarmEventPayload::JobStatus {
                job,
                node,
                snapshot,
            },
        }
    }

    pub fn job_end(job: Job) -> Self {
        Self {
            meta: EventMeta::new(job.id),
            payload: FarmEventPayload::JobEnd { job },
        }
    }

    pub fn job(&self) -> &Job {
        match &self.payload {
            FarmEventPayload::JobStart { job }
            | FarmEventPayload::JobStatus { job, .. }
            | FarmEventPayload::JobEnd { job } => job,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self.payload {
            FarmEventPayload::JobStart { .. } => "job_start",
            FarmEventPayload::JobStatus { .. } => "job_status",
            FarmEventPayload::JobEnd { .. } => "job_end",
        }
    }
}

/// Sink for farm events.
///
/// Publishing never blocks and never fails from the caller's point of
/// view; the farm publishes while holding a job lock.
pub trait FarmEventPublisher: Send + Sync {
    fn publish(&self, event: FarmEvent);

    fn subscribe(&self) -> broadcast::Receiver<FarmEvent>;
}

/// In-process fan-out bus backed by a tokio broadcast channel.
///
/// Slow subscribers observe `RecvError::Lagged` instead of holding up the
/// farm. Events published while nobody is subscribed are dropped.
pub struct InProcEventBus {
    sender: broadcast::Sender<FarmEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl FarmEventPublisher for InProcEventBus {
    fn publish(&self, event: FarmEvent) {
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> broadcast::Receiver<FarmEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EngineVariant, RenderType};
    use std::time::Duration;
    use tokio::time::timeout;

    fn job() -> Job {
        Job::new("shot", "/scenes/shot.blend", RenderType::Still, EngineVariant::Current)
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_each_event() {
        let bus = InProcEventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        let job = job();

        bus.publish(FarmEvent::job_start(job.clone()));

        for rx in [&mut first, &mut second] {
            let event = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("event delivered")
                .expect("channel open");
            assert_eq!(event.kind(), "job_start");
            assert_eq!(event.meta.job_id, job.id);
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = InProcEventBus::new(4);
        bus.publish(FarmEvent::job_end(job()));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_events_serialize_with_a_tag() {
        let event = FarmEvent::job_status(job(), 42, ProgressSnapshot::placeholder(1));
        let value = serde_json::to_value(&event).expect("serializes");

        assert_eq!(value["payload"]["event"], "jobStatus");
        assert_eq!(value["payload"]["node"], 42);
        assert_eq!(value["meta"]["version"], 1);
    }
}
