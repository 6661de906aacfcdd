//! Forwarding events to a message broker.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{DeliveryError, PublishError};
use crate::eventbus::{Event, Forwarder, Topic};

/// Transport used to publish one serialized event.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;
}

#[derive(Debug)]
struct QueuedMessage {
    topic: String,
    payload: Vec<u8>,
}

/// Serializes events to JSON under a topic prefix and queues them for the
/// [`QueueRunner`]. When the queue is full the event is dropped.
pub struct BrokerForwarder {
    topic_prefix: String,
    queue: mpsc::Sender<QueuedMessage>,
}

impl BrokerForwarder {
    /// Create the forwarder and the runner draining its queue.
    pub fn new(topic_prefix: impl Into<String>, queue_size: usize) -> (Self, QueueRunner) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let forwarder = Self {
            topic_prefix: topic_prefix.into(),
            queue: tx,
        };
        (forwarder, QueueRunner { queue: rx })
    }
}

impl Forwarder for BrokerForwarder {
    fn broadcast(&self, topic: &Topic, event: &Event) -> Result<(), DeliveryError> {
        // Task logs would generate too much broker traffic.
        if matches!(event, Event::TaskLog(_)) {
            return Ok(());
        }

        let full_topic = format!("{}{}", self.topic_prefix, topic);
        let payload = serde_json::to_vec(event).map_err(|e| DeliveryError::Serialization {
            topic: full_topic.clone(),
            reason: e.to_string(),
        })?;

        self.queue
            .try_send(QueuedMessage {
                topic: full_topic,
                payload,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(msg) => DeliveryError::QueueFull { topic: msg.topic },
                mpsc::error::TrySendError::Closed(msg) => DeliveryError::Rejected {
                    topic: msg.topic,
                    reason: "queue runner stopped".to_string(),
                },
            })
    }
}

/// Publishes queued events one by one.
pub struct QueueRunner {
    queue: mpsc::Receiver<QueuedMessage>,
}

impl QueueRunner {
    /// Run until cancelled or until the forwarder is dropped.
    pub async fn run(mut self, publisher: Arc<dyn MessagePublisher>, cancel: CancellationToken) {
        debug!("Broker queue runner started");
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = self.queue.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match publisher.publish(&message.topic, &message.payload).await {
                Ok(()) => debug!(topic = %message.topic, "Event sent to broker"),
                Err(e) => error!(topic = %message.topic, error = %e, "Error publishing event"),
            }
        }
        debug!("Broker queue runner stopped");
    }
}
