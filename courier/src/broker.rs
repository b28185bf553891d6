use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A message stored on a topic.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("topic {topic} is closed")]
    Closed { topic: String },
}

/// Sink for encoded messages: service topics and error topics alike.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError>;
}

#[derive(Debug)]
struct TopicHolder {
    tx: mpsc::Sender<Record>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Record>>>,
}

impl TopicHolder {
    fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        }
    }
}

// The Broker is an in-process message hub of named topics. Each topic is a bounded
// FIFO queue; every subscriber of a topic competes for the same queue, so a record is
// consumed exactly once.
#[derive(Debug)]
pub struct Broker {
    capacity: usize,
    topics: Mutex<HashMap<String, TopicHolder>>,
    shutdown: CancellationToken,
}

impl Broker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn with_topic<T>(&self, topic: &str, f: impl FnOnce(&TopicHolder) -> T) -> T {
        let mut topics = self.topics.lock().expect("Failed to lock broker topics");
        let holder = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicHolder::new(self.capacity));
        f(holder)
    }

    pub fn publisher(&self, topic: &str) -> TopicPublisher {
        let tx = self.with_topic(topic, |holder| holder.tx.clone());
        TopicPublisher {
            topic: topic.to_string(),
            tx,
            shutdown: self.shutdown.clone(),
        }
    }

    pub fn subscribe(&self, topic: &str) -> TopicReceiver {
        let rx = self.with_topic(topic, |holder| holder.rx.clone());
        TopicReceiver {
            topic: topic.to_string(),
            rx,
            shutdown: self.shutdown.clone(),
        }
    }

    /// Closes every topic: publishes fail and receivers return `None`.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

#[derive(Debug, Clone)]
pub struct TopicPublisher {
    topic: String,
    tx: mpsc::Sender<Record>,
    shutdown: CancellationToken,
}

impl TopicPublisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Publisher for TopicPublisher {
    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        let closed = || PublishError::Closed {
            topic: self.topic.clone(),
        };
        if self.shutdown.is_cancelled() {
            return Err(closed());
        }

        let record = Record {
            topic: self.topic.clone(),
            payload,
            timestamp: Utc::now(),
        };

        tracing::debug!(topic = %self.topic, bytes = record.payload.len(), "new message");

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(closed()),
            res = self.tx.send(record) => res.map_err(|_| closed()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TopicReceiver {
    topic: String,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Record>>>,
    shutdown: CancellationToken,
}

impl TopicReceiver {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next record. Returns `None` once the broker shuts down.
    pub async fn receive(&self) -> Option<Record> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            record = async {
                let mut guard = self.rx.lock().await;
                guard.recv().await
            } => record,
        }
    }
}
