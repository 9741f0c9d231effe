use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

use crate::Result;

pub struct EtlMetrics {
    pub events_processed: IntCounterVec,
    pub messages_published: IntCounterVec,
    pub transform_failures: IntCounterVec,
    pub publish_retries: IntCounterVec,
    pub tasks_faulted: IntCounter,
    pub running_tasks: IntGauge,
    pub transform_latency: Histogram,
    pub registry: Registry,
}

impl EtlMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let events_processed = IntCounterVec::new(
            Opts::new("etl_events_processed_total", "Change events fully processed"),
            &["task"],
        )?;

        let messages_published = IntCounterVec::new(
            Opts::new("etl_messages_published_total", "Messages accepted by a broker"),
            &["task"],
        )?;

        let transform_failures = IntCounterVec::new(
            Opts::new(
                "etl_transform_failures_total",
                "Transformation runs that failed and were skipped",
            ),
            &["task", "transform"],
        )?;

        let publish_retries = IntCounterVec::new(
            Opts::new("etl_publish_retries_total", "Publish attempts that were retried"),
            &["task"],
        )?;

        let tasks_faulted = IntCounter::new("etl_tasks_faulted_total", "Tasks that entered faulted state")?;

        let running_tasks = IntGauge::new("etl_running_tasks", "Number of running ETL tasks")?;

        let transform_latency = Histogram::with_opts(HistogramOpts::new(
            "etl_transform_latency_seconds",
            "Time spent running one transformation on one event",
        ))?;

        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(messages_published.clone()))?;
        registry.register(Box::new(transform_failures.clone()))?;
        registry.register(Box::new(publish_retries.clone()))?;
        registry.register(Box::new(tasks_faulted.clone()))?;
        registry.register(Box::new(running_tasks.clone()))?;
        registry.register(Box::new(transform_latency.clone()))?;

        Ok(Arc::new(Self {
            events_processed,
            messages_published,
            transform_failures,
            publish_retries,
            tasks_faulted,
            running_tasks,
            transform_latency,
            registry,
        }))
    }

    /// Prometheus text exposition of all ETL metrics.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
