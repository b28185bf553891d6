/// Consumer module: feeds records from a topic into a handler.
///
/// A `Listener` owns one subscription and hands every record to its `Handler` in
/// order. Handler errors are logged and the listener moves on to the next record.
use crate::{broker::TopicReceiver, dispatcher::FailureReport, message::DecodeError, runnable::Runnable};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

const _LISTENER_NAME_PREFIX: &str = "listener";
const _FAILURE_LOG_NAME_PREFIX: &str = "failure-log";

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, cancel: &CancellationToken, payload: &[u8]) -> Result<(), DecodeError>;
}

pub struct Listener {
    name: String,
    receiver: TopicReceiver,
    handler: Box<dyn Handler>,
    cancel: CancellationToken,
}

impl Listener {
    pub fn new(receiver: TopicReceiver, handler: Box<dyn Handler>, cancel: CancellationToken) -> Self {
        Self {
            name: format!("{}-{}", _LISTENER_NAME_PREFIX, receiver.topic()),
            receiver,
            handler,
            cancel,
        }
    }
}

#[async_trait]
impl Runnable for Listener {
    async fn run(&mut self) {
        tracing::info!("{} started", self.name);
        loop {
            let record = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::debug!("{} received shutdown signal", self.name);
                    break;
                }
                record = self.receiver.receive() => record,
            };

            let Some(record) = record else {
                tracing::debug!("{} topic closed", self.name);
                break;
            };

            if let Err(e) = self.handler.handle(&self.cancel, &record.payload).await {
                tracing::error!(topic = %record.topic, error = %e, "failed to handle message");
            }
        }
        tracing::info!("{} stopped", self.name);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Drains an error topic into the log.
pub struct FailureLog {
    name: String,
    receiver: TopicReceiver,
    cancel: CancellationToken,
}

impl FailureLog {
    pub fn new(receiver: TopicReceiver, cancel: CancellationToken) -> Self {
        Self {
            name: format!("{}-{}", _FAILURE_LOG_NAME_PREFIX, receiver.topic()),
            receiver,
            cancel,
        }
    }
}

#[async_trait]
impl Runnable for FailureLog {
    async fn run(&mut self) {
        loop {
            let record = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                record = self.receiver.receive() => record,
            };
            let Some(record) = record else {
                break;
            };

            match serde_json::from_slice::<FailureReport>(&record.payload) {
                Ok(report) => tracing::warn!(
                    topic = %record.topic,
                    url = %report.target,
                    attempts = report.attempts,
                    error = %report.error,
                    failed_at = %report.failed_at,
                    "delivery gave up"
                ),
                Err(_) => tracing::warn!(
                    topic = %record.topic,
                    data = %String::from_utf8_lossy(&record.payload),
                    "delivery gave up"
                ),
            }
        }
        tracing::debug!("{} stopped", self.name);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, Publisher};
    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    // Records every payload; fails on payloads starting with "bad".
    struct RecordingHandler(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn handle(
            &self,
            _cancel: &CancellationToken,
            payload: &[u8],
        ) -> Result<(), DecodeError> {
            let _ = self.0.send(payload.to_vec());
            if payload.starts_with(b"bad") {
                return Err(DecodeError::EmptyTarget);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_listener_handles_records_in_order_past_errors() {
        let broker = Broker::new(8);
        let publisher = broker.publisher("acme-billing");
        let cancel = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = Listener::new(
            broker.subscribe("acme-billing"),
            Box::new(RecordingHandler(tx)),
            cancel.clone(),
        );
        assert_eq!(listener.name(), "listener-acme-billing");

        let handle = tokio::spawn(async move { listener.run().await });
        for payload in ["one", "bad two", "three"] {
            publisher.publish(Bytes::from(payload)).await.unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let payload = timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(String::from_utf8(payload).unwrap());
        }
        assert_eq!(seen, vec!["one", "bad two", "three"]);

        cancel.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener should stop on cancel")
            .unwrap();
    }

    #[tokio::test]
    async fn test_listener_stops_when_broker_shuts_down() {
        let broker = Broker::new(8);
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut listener = Listener::new(
            broker.subscribe("jobs"),
            Box::new(RecordingHandler(tx)),
            CancellationToken::new(),
        );

        let handle = tokio::spawn(async move { listener.run().await });
        broker.shutdown();

        timeout(Duration::from_secs(1), handle)
            .await
            .expect("listener should stop when the topic closes")
            .unwrap();
    }

    #[tokio::test]
    async fn test_failure_log_drains_topic() {
        let broker = Broker::new(2);
        let publisher = broker.publisher("acme-billing-error");
        let cancel = CancellationToken::new();
        let mut failure_log = FailureLog::new(broker.subscribe("acme-billing-error"), cancel.clone());
        assert_eq!(failure_log.name(), "failure-log-acme-billing-error");

        let handle = tokio::spawn(async move { failure_log.run().await });

        // more records than the topic holds: publishing only completes if they are drained
        for _ in 0..5 {
            let report = FailureReport::new(
                "http://example.com",
                3,
                &crate::runner::RunnerError::TaskFailed,
            );
            timeout(Duration::from_secs(1), publisher.publish(report.to_bytes()))
                .await
                .unwrap()
                .unwrap();
        }
        publisher
            .publish(Bytes::from_static(b"not a report"))
            .await
            .unwrap();

        cancel.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
