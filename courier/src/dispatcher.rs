use crate::{
    broker::Publisher,
    client::{self, Sender},
    consumer::Handler,
    message::{DecodeError, Decoder, DeliveryRequest},
    pool::RunnerPool,
    runner::{RunnerError, Task},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context of a delivery that ran out of attempts, published to the error topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    pub target: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailureReport {
    pub fn new(target: &str, attempts: u32, error: &RunnerError) -> Self {
        Self {
            target: target.to_string(),
            attempts,
            error: error.to_string(),
            failed_at: Utc::now(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        // a struct of strings and integers always serializes
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// Dispatcher turns each consumed message into a delivery on a pooled runner.
///
/// `process` only waits for decoding and for a free runner; the delivery itself runs
/// on its own task, so a slow endpoint holds one runner, not the consumer.
///
/// # Fields
/// * `decoder` - Decodes the raw record payload into a `DeliveryRequest`.
/// * `sender` - Performs the HTTP call inside every attempt.
/// * `error_publisher` - Receives a `FailureReport` when a delivery fails for good.
/// * `pool` - Bounds the number of deliveries in flight.
#[derive(Clone)]
pub struct Dispatcher {
    decoder: Arc<dyn Decoder>,
    sender: Arc<dyn Sender>,
    error_publisher: Arc<dyn Publisher>,
    pool: Arc<RunnerPool>,
}

impl Dispatcher {
    pub fn new(
        decoder: Arc<dyn Decoder>,
        sender: Arc<dyn Sender>,
        error_publisher: Arc<dyn Publisher>,
        pool: Arc<RunnerPool>,
    ) -> Self {
        Self {
            decoder,
            sender,
            error_publisher,
            pool,
        }
    }

    /// Decodes `payload`, waits for a runner, and launches the delivery.
    ///
    /// Only decoding can fail here. Delivery failures are reported to the error
    /// publisher from the launched task and never reach the caller.
    pub async fn process(
        &self,
        cancel: &CancellationToken,
        payload: &[u8],
    ) -> Result<(), DecodeError> {
        let request = self.decoder.decode(payload).inspect_err(|e| {
            tracing::error!(
                error = %e,
                data = %String::from_utf8_lossy(payload),
                "unable to decode message"
            );
        })?;

        tracing::info!(url = %request.target, "process");

        let runner = self.pool.acquire().await;
        let task = self.create_task(&request);
        let error_publisher = self.error_publisher.clone();
        let cancel = cancel.clone();

        tokio::spawn(async move {
            // `runner` goes back to the pool when this task ends, however it ends
            let outcome = runner.execute(&cancel, Some(task)).await;
            if let Some(error) = outcome.error {
                tracing::error!(
                    url = %request.target,
                    attempt = outcome.attempts,
                    error = %error,
                    "delivery failed"
                );
                let report = FailureReport::new(&request.target, outcome.attempts, &error);
                report_failure(error_publisher.as_ref(), &report).await;
            }
        });

        Ok(())
    }

    fn create_task(&self, request: &DeliveryRequest) -> Task {
        let sender = self.sender.clone();
        let url = request.target.clone();
        Box::new(move || {
            let sender = sender.clone();
            let url = url.clone();
            Box::pin(async move { client::send(sender.as_ref(), &url).await })
        })
    }
}

// Best effort: a failed publish is logged and dropped.
async fn report_failure(publisher: &dyn Publisher, report: &FailureReport) {
    if let Err(e) = publisher.publish(report.to_bytes()).await {
        tracing::error!(error = %e, url = %report.target, "unable to publish failure report");
    }
}

#[async_trait]
impl Handler for Dispatcher {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), DecodeError> {
        self.process(cancel, payload).await
    }
}
