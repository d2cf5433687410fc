//! The RabbitMQ-backed [`MessageSource`].

use crate::config::{WorkerConfig, PREFETCH_COUNT};
use crate::connection::BrokerConnection;
use crate::delivery::{delivery_count, DeliveryLedger, DeliveryTag, Message, MessageSource};
use crate::dlq::{DeadLetterPublisher, DeadLetterRecord};
use crate::error::WorkerError;
use crate::routing::RoutingKey;
use crate::service::Connector;
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicConsumeOptions, BasicRejectOptions},
    types::FieldTable,
    Channel, Consumer,
};

/// A consumer subscription on its own connection and channel.
pub struct AmqpSource {
    connection: BrokerConnection,
    channel: Channel,
    consumer: Consumer,
    ledger: DeliveryLedger,
    dead_letter: Option<DeadLetterPublisher>,
}

impl AmqpSource {
    /// Connects, declares the topology, limits the channel to one unacked
    /// delivery and subscribes.
    pub async fn open(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let connection = BrokerConnection::connect(&config.endpoint).await?;
        match Self::subscribe(&connection, config).await {
            Ok((channel, consumer, dead_letter)) => Ok(Self {
                connection,
                channel,
                consumer,
                ledger: DeliveryLedger::new(),
                dead_letter,
            }),
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    log::warn!("Failed to close connection after setup error: {}", close_err);
                }
                Err(err)
            }
        }
    }

    async fn subscribe(
        connection: &BrokerConnection,
        config: &WorkerConfig,
    ) -> Result<(Channel, Consumer, Option<DeadLetterPublisher>), WorkerError> {
        let channel = connection.open_channel().await?;
        let mut binding = config.binding().declare(&channel).await?;
        binding.set_prefetch(PREFETCH_COUNT).await?;

        let consumer = channel
            .basic_consume(
                &config.queue_name,
                &config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!(
            "Consumer started with tag '{}'. Waiting for messages...",
            consumer.tag().as_str()
        );
        Ok((channel, consumer, binding.take_dead_letter()))
    }
}

#[async_trait]
impl MessageSource for AmqpSource {
    async fn recv(&mut self) -> Result<Option<Message>, WorkerError> {
        let delivery = match self.consumer.next().await {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => return Err(WorkerError::ConnectionLost(err.to_string())),
            None => return Ok(None),
        };

        self.ledger.open(delivery.delivery_tag);
        Ok(Some(Message {
            delivery_tag: delivery.delivery_tag,
            routing_key: RoutingKey::new(delivery.routing_key.as_str()),
            exchange: delivery.exchange.as_str().to_string(),
            delivery_count: delivery_count(delivery.properties.headers().as_ref()),
            redelivered: delivery.redelivered,
            payload: delivery.data,
        }))
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), WorkerError> {
        self.ledger.settle(tag)?;
        self.channel
            .basic_ack(tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), WorkerError> {
        self.ledger.settle(tag)?;
        self.channel
            .basic_reject(tag, BasicRejectOptions { requeue })
            .await?;
        Ok(())
    }

    async fn dead_letter(&mut self, record: &DeadLetterRecord) -> Result<bool, WorkerError> {
        match &self.dead_letter {
            Some(publisher) => {
                publisher.publish(record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn close(&mut self) -> Result<(), WorkerError> {
        // Unsettled tags die with the channel; the broker requeues them.
        self.ledger.clear();
        self.connection.close().await
    }
}

/// Opens [`AmqpSource`]s for one [`WorkerConfig`].
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    config: WorkerConfig,
}

impl AmqpConnector {
    pub fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    type Source = AmqpSource;

    async fn open(&self) -> Result<AmqpSource, WorkerError> {
        AmqpSource::open(&self.config).await
    }
}
