//! AMQP transport for the broker forwarder.
//!
//! Events go to one durable topic exchange. The routing key is the event
//! topic with `/` replaced by `.`, so consumers can bind patterns such as
//! `flamenco.jobs.#`.

use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::PublishError;
use crate::eventbus::MessagePublisher;

/// Publishes forwarded events to an AMQP broker such as RabbitMQ.
pub struct AmqpPublisher {
    connection: Connection,
    channel: Mutex<Channel>,
    exchange: String,
}

impl AmqpPublisher {
    /// Connect, declare the exchange and turn on publisher confirms.
    pub async fn connect(url: &str, exchange: impl Into<String>) -> Result<Self, PublishError> {
        let exchange = exchange.into();
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| PublishError::Connect(e.to_string()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| PublishError::Connect(format!("could not open channel: {e}")))?;

        channel
            .exchange_declare(
                &exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PublishError::Connect(format!("could not declare exchange {exchange}: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PublishError::Connect(format!("could not enable confirms: {e}")))?;

        info!(exchange = %exchange, "Connected to message broker");
        Ok(Self {
            connection,
            channel: Mutex::new(channel),
            exchange,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) {
        if !self.is_connected() {
            return;
        }
        match self.connection.close(200, "manager shutting down").await {
            Ok(()) => info!("Message broker connection closed"),
            Err(e) => warn!(error = %e, "Error closing message broker connection"),
        }
    }
}

#[async_trait]
impl MessagePublisher for AmqpPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        let failed = |reason: String| PublishError::Failed {
            topic: topic.to_string(),
            reason,
        };

        let key = routing_key(topic);
        let channel = self.channel.lock().await;
        let confirm = channel
            .basic_publish(
                &self.exchange,
                &key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(|e| failed(e.to_string()))?;
        let confirmation = confirm.await.map_err(|e| failed(e.to_string()))?;
        if confirmation.is_nack() {
            return Err(failed("broker refused the message".to_string()));
        }

        debug!(routing_key = %key, bytes = payload.len(), "Event published");
        Ok(())
    }
}

/// AMQP routing key for an event topic.
pub fn routing_key(topic: &str) -> String {
    topic.trim_matches('/').replace('/', ".")
}
