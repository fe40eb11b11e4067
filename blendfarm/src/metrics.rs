//! Prometheus collectors for the render farm.
//!
//! ## Counters
//! - `blendfarm_jobs_registered_total` - jobs registered, by render type
//! - `blendfarm_jobs_ended_total` - jobs reaching a terminal status
//! - `blendfarm_nodes_finished_total` - render node exits, by outcome
//!
//! ## Gauges
//! - `blendfarm_device_queue_depth` - jobs waiting per device
//!
//! ## Histograms
//! - `blendfarm_node_duration_seconds` - render node wall time
#![cfg(feature = "metrics")]

use std::sync::LazyLock;

use prometheus::{
    CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    exponential_buckets,
};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static JOBS_REGISTERED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "blendfarm_jobs_registered_total",
        "Total number of render jobs registered",
    );
    CounterVec::new(opts, &["render_type"])
        .expect("blendfarm_jobs_registered_total metric creation failed")
});

pub static JOBS_ENDED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "blendfarm_jobs_ended_total",
        "Total number of render jobs reaching a terminal status",
    );
    CounterVec::new(opts, &["render_type", "status"])
        .expect("blendfarm_jobs_ended_total metric creation failed")
});

pub static NODES_FINISHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "blendfarm_nodes_finished_total",
        "Total number of render node exits",
    );
    CounterVec::new(opts, &["outcome"])
        .expect("blendfarm_nodes_finished_total metric creation failed")
});

pub static DEVICE_QUEUE_DEPTH: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "blendfarm_device_queue_depth",
        "Jobs waiting in each device queue",
    );
    GaugeVec::new(opts, &["device"])
        .expect("blendfarm_device_queue_depth metric creation failed")
});

/// Render wall time, from one second up to roughly nine hours.
pub static NODE_DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    let buckets =
        exponential_buckets(1.0, 2.0, 16).expect("bucket creation failed");
    let opts = HistogramOpts::new(
        "blendfarm_node_duration_seconds",
        "Render node wall time in seconds",
    )
    .buckets(buckets);
    HistogramVec::new(opts, &["outcome"])
        .expect("blendfarm_node_duration_seconds metric creation failed")
});

/// Register every collector with [`REGISTRY`]. Safe to call repeatedly.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_REGISTERED_TOTAL.clone())
            as Box<dyn prometheus::core::Collector>,
        Box::new(JOBS_ENDED_TOTAL.clone()),
        Box::new(NODES_FINISHED_TOTAL.clone()),
        Box::new(DEVICE_QUEUE_DEPTH.clone()),
        Box::new(NODE_DURATION_SECONDS.clone()),
    ] {
        if let Err(err) = registry.register(metric) {
            if !matches!(err, prometheus::Error::AlreadyReg) {
                return Err(err.into());
            }
        }
    }

    Ok(())
}

pub fn record_job_registered(render_type: &str) {
    JOBS_REGISTERED_TOTAL.with_label_values(&[render_type]).inc();
}

pub fn record_job_ended(render_type: &str, status: &str) {
    JOBS_ENDED_TOTAL
        .with_label_values(&[render_type, status])
        .inc();
}

pub fn record_node_finished(outcome: &str) {
    NODES_FINISHED_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn observe_node_duration(outcome: &str, duration_secs: f64) {
    NODE_DURATION_SECONDS
        .with_label_values(&[outcome])
        .observe(duration_secs);
}

pub fn set_device_queue_depth(device: usize, depth: f64) {
    DEVICE_QUEUE_DEPTH
        .with_label_values(&[device.to_string().as_str()])
        .set(depth);
}

/// Render every registered collector in the Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode_to_string(&REGISTRY.gather())
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics().expect("first registration");
        init_metrics().expect("second registration");
    }

    #[test]
    fn test_gather_includes_recorded_series() {
        init_metrics().expect("metrics initialization should succeed");

        record_job_registered("animation");
        record_job_ended("animation", "Finished");
        record_node_finished("finished");
        observe_node_duration("finished", 12.5);
        set_device_queue_depth(0, 3.0);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("blendfarm_jobs_registered_total"));
        assert!(output.contains("blendfarm_jobs_ended_total"));
        assert!(output.contains("blendfarm_node_duration_seconds"));
        assert!(output.contains("blendfarm_device_queue_depth"));
    }
}
