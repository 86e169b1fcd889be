//! RabbitMQ implementation of MessageTransport

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use cashflow_core::{Delivery, DeliveryStream, MessageTransport, StatusUpdateMessage, TransportError};

/// RabbitMQ transport settings
#[derive(Debug, Clone)]
pub struct RabbitMqConfig {
    pub url: String,
    pub queue: String,
    /// Unacknowledged deliveries the broker may push at once
    pub prefetch: u16,
}

impl RabbitMqConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            queue: "payments".to_string(),
            prefetch: 10,
        }
    }
}

struct RabbitMqDelivery(lapin::message::Delivery);

#[async_trait]
impl Delivery for RabbitMqDelivery {
    fn body(&self) -> &[u8] {
        &self.0.data
    }

    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        self.0
            .acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Acknowledge(e.to_string()))
    }

    async fn nack_requeue(self: Box<Self>) -> Result<(), TransportError> {
        self.0
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Acknowledge(e.to_string()))
    }

    async fn nack_drop(self: Box<Self>) -> Result<(), TransportError> {
        self.0
            .acker
            .nack(BasicNackOptions {
                requeue: false,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Acknowledge(e.to_string()))
    }
}

/// Durable-queue transport with publisher confirms and manual acks
pub struct RabbitMqTransport {
    connection: Connection,
    publish_channel: Channel,
    config: RabbitMqConfig,
}

impl RabbitMqTransport {
    /// Connect and declare the durable queue
    pub async fn connect(config: RabbitMqConfig) -> Result<Self, TransportError> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Connection(format!("failed to connect to RabbitMQ: {e}")))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("failed to open channel: {e}")))?;

        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| TransportError::Connection(format!("failed to enable confirms: {e}")))?;

        declare_queue(&publish_channel, &config.queue).await?;

        info!(queue = %config.queue, "Connected to RabbitMQ");
        Ok(Self {
            connection,
            publish_channel,
            config,
        })
    }
}

async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), TransportError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                exclusive: false,
                auto_delete: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| TransportError::Connection(format!("failed to declare queue {queue}: {e}")))?;
    debug!(%queue, "Queue declared");
    Ok(())
}

#[async_trait]
impl MessageTransport for RabbitMqTransport {
    #[instrument(skip(self))]
    async fn publish(&self, payment_id: Uuid) -> Result<(), TransportError> {
        let body = StatusUpdateMessage::new(payment_id).to_bytes()?;

        let confirm = self
            .publish_channel
            .basic_publish(
                "",
                &self.config.queue,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| TransportError::Publish(format!("publish confirmation failed: {e}")))?;
        if confirmation.is_nack() {
            return Err(TransportError::Publish(
                "broker rejected the message".to_string(),
            ));
        }

        debug!(queue = %self.config.queue, "Status update published");
        Ok(())
    }

    async fn consume(&self) -> Result<DeliveryStream, TransportError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Consume(format!("failed to open channel: {e}")))?;

        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Consume(format!("failed to set prefetch: {e}")))?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                &format!("cashflow-worker-{}", Uuid::new_v4()),
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Consume(format!("failed to start consumer: {e}")))?;

        info!(queue = %self.config.queue, "Consuming status updates");
        let stream = consumer.map(|delivery| {
            delivery
                .map(|d| Box::new(RabbitMqDelivery(d)) as Box<dyn Delivery>)
                .map_err(|e| TransportError::Consume(e.to_string()))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.connection
            .close(200, "worker shutdown")
            .await
            .map_err(|e| TransportError::Connection(format!("failed to close connection: {e}")))?;
        info!("RabbitMQ connection closed");
        Ok(())
    }
}
