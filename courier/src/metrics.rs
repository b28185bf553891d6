/// Metrics module: a process-scoped Prometheus registry and the decorators that feed it.
///
/// Each decorator wraps one seam of a delivery pipeline (publisher, runner builder,
/// message handler) and forwards every call unchanged, recording counts and
/// latencies on the way through.
use crate::{
    broker::{PublishError, Publisher},
    consumer::Handler,
    message::DecodeError,
    runner::{Outcome, Runner, RunnerBuilder, Task},
};
use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use bytes::Bytes;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::{sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;

const HTTP_BUCKETS: &[f64] = &[1.0, 1.5, 2.0, 2.5, 3.0, 3.5, 4.0, 5.0, 10.0, 50.0, 100.0];
const RUNNER_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 50.0, 100.0, 150.0, 250.0, 500.0, 1000.0];

fn counter_vec(
    registry: &Registry,
    namespace: &str,
    subsystem: &str,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let counter = IntCounterVec::new(
        Opts::new(name, help)
            .namespace(namespace)
            .subsystem(subsystem),
        labels,
    )?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn histogram_vec(
    registry: &Registry,
    namespace: &str,
    subsystem: &str,
    help: &str,
    buckets: &[f64],
    labels: &[&str],
) -> prometheus::Result<HistogramVec> {
    let histogram = HistogramVec::new(
        HistogramOpts::new("duration_milliseconds", help)
            .namespace(namespace)
            .subsystem(subsystem)
            .buckets(buckets.to_vec()),
        labels,
    )?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

pub struct Metrics {
    registry: Registry,
    publisher_topic: IntCounterVec,
    publisher_service: IntCounterVec,
    runner_total: IntCounterVec,
    runner_success: IntCounterVec,
    runner_failed: IntCounterVec,
    runner_latency: HistogramVec,
    consumer_requests: IntCounterVec,
    consumer_failed: IntCounterVec,
    consumer_latency: HistogramVec,
    http_latency: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let runner_labels = &["service", "attempt"];

        Ok(Self {
            publisher_topic: counter_vec(
                &registry,
                "publisher",
                "topic",
                "count",
                "Number of messages published, by topic.",
                &["topic"],
            )?,
            publisher_service: counter_vec(
                &registry,
                "publisher",
                "service",
                "count",
                "Number of messages published, by service.",
                &["service"],
            )?,
            runner_total: counter_vec(
                &registry,
                "runner",
                "service",
                "count",
                "Number of tasks executed.",
                runner_labels,
            )?,
            runner_success: counter_vec(
                &registry,
                "runner",
                "service",
                "success_count",
                "Number of tasks that succeeded.",
                runner_labels,
            )?,
            runner_failed: counter_vec(
                &registry,
                "runner",
                "service",
                "failed_count",
                "Number of tasks that failed for good.",
                runner_labels,
            )?,
            runner_latency: histogram_vec(
                &registry,
                "runner",
                "service",
                "Total duration of a task execution in milliseconds, retries included.",
                RUNNER_BUCKETS,
                runner_labels,
            )?,
            consumer_requests: counter_vec(
                &registry,
                "consumer",
                "service",
                "requests_count",
                "Number of messages handled.",
                &["service"],
            )?,
            consumer_failed: counter_vec(
                &registry,
                "consumer",
                "service",
                "requests_failed_count",
                "Number of messages that could not be handled.",
                &["service"],
            )?,
            consumer_latency: histogram_vec(
                &registry,
                "consumer",
                "service",
                "Time spent handling a message in milliseconds.",
                RUNNER_BUCKETS,
                &["service"],
            )?,
            http_latency: histogram_vec(
                &registry,
                "http",
                "request",
                "HTTP request latency in milliseconds.",
                HTTP_BUCKETS,
                &["method", "endpoint"],
            )?,
            registry,
        })
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn gather(&self) -> prometheus::Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn observe_http(&self, method: &str, endpoint: &str, start: Instant) {
        self.http_latency
            .with_label_values(&[method, endpoint])
            .observe(elapsed_ms(start));
    }
}

/// axum middleware recording `http_request_duration_milliseconds`.
pub async fn track_http_latency(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let endpoint = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    metrics.observe_http(&method, &endpoint, start);
    response
}

/// Counts successful publishes by topic and by service.
pub struct InstrumentedPublisher {
    inner: Arc<dyn Publisher>,
    topic: String,
    service: String,
    metrics: Arc<Metrics>,
}

impl InstrumentedPublisher {
    pub fn new(
        inner: Arc<dyn Publisher>,
        topic: impl Into<String>,
        service: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner,
            topic: topic.into(),
            service: service.into(),
            metrics,
        }
    }
}

#[async_trait]
impl Publisher for InstrumentedPublisher {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        self.inner.publish(payload).await?;
        self.metrics
            .publisher_topic
            .with_label_values(&[self.topic.as_str()])
            .inc();
        self.metrics
            .publisher_service
            .with_label_values(&[self.service.as_str()])
            .inc();
        Ok(())
    }
}

/// Wraps the runners of another builder in `InstrumentedRunner`.
pub struct InstrumentedBuilder {
    inner: Box<dyn RunnerBuilder>,
    service: String,
    metrics: Arc<Metrics>,
}

impl InstrumentedBuilder {
    pub fn new(
        inner: Box<dyn RunnerBuilder>,
        service: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner,
            service: service.into(),
            metrics,
        }
    }
}

impl RunnerBuilder for InstrumentedBuilder {
    fn create_runner(&self) -> Box<dyn Runner> {
        Box::new(InstrumentedRunner {
            inner: self.inner.create_runner(),
            service: self.service.clone(),
            metrics: self.metrics.clone(),
        })
    }
}

pub struct InstrumentedRunner {
    inner: Box<dyn Runner>,
    service: String,
    metrics: Arc<Metrics>,
}

#[async_trait]
impl Runner for InstrumentedRunner {
    async fn execute(&self, cancel: &CancellationToken, task: Option<Task>) -> Outcome {
        let start = Instant::now();
        let outcome = self.inner.execute(cancel, task).await;

        let attempt = outcome.attempts.to_string();
        let labels = [self.service.as_str(), attempt.as_str()];
        self.metrics.runner_total.with_label_values(&labels).inc();
        if outcome.is_success() {
            self.metrics.runner_success.with_label_values(&labels).inc();
        } else {
            self.metrics.runner_failed.with_label_values(&labels).inc();
        }
        self.metrics
            .runner_latency
            .with_label_values(&labels)
            .observe(elapsed_ms(start));

        outcome
    }
}

/// Counts and times message handling for one service.
pub struct InstrumentedHandler {
    inner: Box<dyn Handler>,
    service: String,
    metrics: Arc<Metrics>,
}

impl InstrumentedHandler {
    pub fn new(inner: Box<dyn Handler>, service: impl Into<String>, metrics: Arc<Metrics>) -> Self {
        Self {
            inner,
            service: service.into(),
            metrics,
        }
    }
}

#[async_trait]
impl Handler for InstrumentedHandler {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), DecodeError> {
        let start = Instant::now();
        let result = self.inner.handle(cancel, payload).await;

        let labels = [self.service.as_str()];
        self.metrics.consumer_requests.with_label_values(&labels).inc();
        if result.is_err() {
            self.metrics.consumer_failed.with_label_values(&labels).inc();
        }
        self.metrics
            .consumer_latency
            .with_label_values(&labels)
            .observe(elapsed_ms(start));

        result
    }
}
