//! Exchange, queue and binding declarations for the work queue.

use crate::dlq::{DeadLetterNames, DeadLetterPublisher};
use crate::error::{is_precondition_failed, WorkerError};
use lapin::{
    options::{BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    Channel, ExchangeKind,
};
use serde::Deserialize;

/// The RabbitMQ queue implementation to request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    #[default]
    Classic,
    /// Replicated queue; the broker tracks `x-delivery-count` per message.
    Quorum,
}

/// Describes the exchange/queue pair a consumer reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    pub topic_pattern: String,
    pub durable: bool,
    pub queue_type: QueueType,
    pub dead_letter: Option<DeadLetterNames>,
}

impl QueueBinding {
    /// A durable classic queue bound to a durable topic exchange.
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        topic_pattern: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            topic_pattern: topic_pattern.into(),
            durable: true,
            queue_type: QueueType::Classic,
            dead_letter: None,
        }
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    pub fn dead_letter(mut self, names: DeadLetterNames) -> Self {
        self.dead_letter = Some(names);
        self
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        for (field, value) in [
            ("exchange", &self.exchange),
            ("queue", &self.queue),
            ("topic pattern", &self.topic_pattern),
        ] {
            if value.trim().is_empty() {
                return Err(WorkerError::config(format!("{} name must not be empty", field)));
            }
        }
        if self.queue_type == QueueType::Quorum && !self.durable {
            return Err(WorkerError::config(format!(
                "quorum queue '{}' must be durable",
                self.queue
            )));
        }
        Ok(())
    }

    fn queue_arguments(&self) -> FieldTable {
        let mut args = FieldTable::default();
        if self.queue_type == QueueType::Quorum {
            args.insert("x-queue-type".into(), AMQPValue::LongString("quorum".into()));
        }
        args
    }

    /// Declares the exchange, the queue, the binding and, when configured,
    /// the dead-letter topology.
    ///
    /// Declaring identical topology again is a no-op on the broker; differing
    /// parameters fail with [`WorkerError::TopologyConflict`].
    pub async fn declare(&self, channel: &Channel) -> Result<Binding, WorkerError> {
        self.validate()?;

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable: self.durable, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(format!("exchange '{}'", self.exchange), e))?;

        channel
            .queue_declare(
                &self.queue,
                QueueDeclareOptions { durable: self.durable, ..Default::default() },
                self.queue_arguments(),
            )
            .await
            .map_err(|e| declare_error(format!("queue '{}'", self.queue), e))?;

        channel
            .queue_bind(
                &self.queue,
                &self.exchange,
                &self.topic_pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let dead_letter = match &self.dead_letter {
            Some(names) => {
                let publisher = DeadLetterPublisher::new(channel.clone(), names.clone());
                publisher.setup_infrastructure(self.durable).await?;
                Some(publisher)
            }
            None => None,
        };

        log::info!(
            "Queue '{}' bound to exchange '{}' on '{}'",
            self.queue,
            self.exchange,
            self.topic_pattern
        );

        Ok(Binding {
            channel: channel.clone(),
            dead_letter,
        })
    }
}

/// Declared topology on a live channel.
pub struct Binding {
    channel: Channel,
    dead_letter: Option<DeadLetterPublisher>,
}

impl Binding {
    /// Bounds the number of unacknowledged deliveries on this channel.
    ///
    /// With `count == 1` the broker sends nothing new until the current
    /// delivery is acked or rejected.
    pub async fn set_prefetch(&mut self, count: u16) -> Result<(), WorkerError> {
        if count == 0 {
            return Err(WorkerError::config("prefetch count must be at least 1"));
        }
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await?;
        log::info!("QoS prefetch count set to {}", count);
        Ok(())
    }

    pub(crate) fn take_dead_letter(&mut self) -> Option<DeadLetterPublisher> {
        self.dead_letter.take()
    }
}

/// Maps a failed declaration, singling out parameter conflicts.
pub(crate) fn declare_error(object: String, err: lapin::Error) -> WorkerError {
    if is_precondition_failed(&err) {
        WorkerError::TopologyConflict {
            object,
            reason: err.to_string(),
        }
    } else {
        WorkerError::Lapin(err)
    }
}
