//! Dead-letter topology and records for messages that will never succeed.

use crate::delivery::{Message, DELIVERY_COUNT_HEADER};
use crate::error::WorkerError;
use crate::topology::declare_error;
use chrono::{DateTime, Utc};
use lapin::{
    options::{BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use serde::Serialize;
use std::fmt;

/// Names of the dead-letter exchange, queue and routing key for a work queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterNames {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl DeadLetterNames {
    pub fn for_queue(base_name: &str) -> Self {
        Self {
            exchange: format!("{}_dlx", base_name),
            queue: format!("{}_dlq", base_name),
            routing_key: format!("{}.failed", base_name),
        }
    }
}

/// Why a message was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeadLetterReason {
    /// The handler failed with an error outside the recoverable set.
    UnrecognizedError,
    /// A recoverable failure repeated until the delivery limit.
    DeliveryLimitReached,
    /// The routing key has no action segments.
    MissingAction,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::UnrecognizedError => "unrecognized-error",
            DeadLetterReason::DeliveryLimitReached => "delivery-limit-reached",
            DeadLetterReason::MissingAction => "missing-action",
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope published to the dead-letter queue.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetterRecord {
    pub original_message: String,
    pub original_routing_key: String,
    pub original_exchange: String,
    pub reason: DeadLetterReason,
    pub error: String,
    pub delivery_count: u32,
    pub dlq_timestamp: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(message: &Message, reason: DeadLetterReason, error: impl fmt::Display) -> Self {
        Self {
            original_message: String::from_utf8_lossy(&message.payload).into_owned(),
            original_routing_key: message.routing_key.to_string(),
            original_exchange: message.exchange.clone(),
            reason,
            error: error.to_string(),
            delivery_count: message.delivery_count.saturating_add(1),
            dlq_timestamp: Utc::now(),
        }
    }

    /// The AMQP headers attached to the published record.
    pub fn headers(&self) -> FieldTable {
        let mut headers = FieldTable::default();
        headers.insert(
            "x-dlq-reason".into(),
            AMQPValue::LongString(self.reason.as_str().into()),
        );
        headers.insert(
            "x-last-exception".into(),
            AMQPValue::LongString(self.error.clone().into()),
        );
        headers.insert(
            DELIVERY_COUNT_HEADER.into(),
            AMQPValue::LongLongInt(i64::from(self.delivery_count)),
        );
        headers
    }
}

/// Publishes dead-letter records on the consumer's channel.
#[derive(Clone)]
pub struct DeadLetterPublisher {
    channel: Channel,
    names: DeadLetterNames,
}

impl DeadLetterPublisher {
    pub fn new(channel: Channel, names: DeadLetterNames) -> Self {
        Self { channel, names }
    }

    /// Declares the dead-letter exchange and queue, and binds them.
    pub async fn setup_infrastructure(&self, durable: bool) -> Result<(), WorkerError> {
        self.channel
            .exchange_declare(
                &self.names.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions { durable, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(format!("exchange '{}'", self.names.exchange), e))?;

        self.channel
            .queue_declare(
                &self.names.queue,
                QueueDeclareOptions { durable, ..Default::default() },
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(format!("queue '{}'", self.names.queue), e))?;

        self.channel
            .queue_bind(
                &self.names.queue,
                &self.names.exchange,
                &self.names.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!(
            "Dead-letter queue '{}' bound to exchange '{}'",
            self.names.queue,
            self.names.exchange
        );
        Ok(())
    }

    /// Publishes the record and waits for the broker to take it.
    pub async fn publish(&self, record: &DeadLetterRecord) -> Result<(), WorkerError> {
        let body = serde_json::to_vec(record)?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_headers(record.headers());

        self.channel
            .basic_publish(
                &self.names.exchange,
                &self.names.routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await?
            .await?;

        log::warn!(
            "Message from '{}' dead-lettered to '{}' ({})",
            record.original_routing_key,
            self.names.queue,
            record.reason
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::RoutingKey;

    fn message() -> Message {
        Message {
            delivery_tag: 4,
            routing_key: RoutingKey::new("ns.request.build"),
            exchange: "ns_exchange".into(),
            payload: b"{\"id\":1}".to_vec(),
            redelivered: true,
            delivery_count: 2,
        }
    }

    #[test]
    fn test_names_for_queue() {
        let names = DeadLetterNames::for_queue("jobs");
        assert_eq!(names.exchange, "jobs_dlx");
        assert_eq!(names.queue, "jobs_dlq");
        assert_eq!(names.routing_key, "jobs.failed");
    }

    #[test]
    fn test_record_counts_current_delivery() {
        let record = DeadLetterRecord::new(&message(), DeadLetterReason::DeliveryLimitReached, "db down");
        assert_eq!(record.delivery_count, 3);
        assert_eq!(record.original_routing_key, "ns.request.build");
        assert_eq!(record.original_message, "{\"id\":1}");
    }

    #[test]
    fn test_record_serializes_reason_in_kebab_case() {
        let record = DeadLetterRecord::new(&message(), DeadLetterReason::UnrecognizedError, "boom");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["reason"], "unrecognized-error");
        assert_eq!(json["error"], "boom");
        assert_eq!(json["original_exchange"], "ns_exchange");
    }

    #[test]
    fn test_record_headers() {
        let record = DeadLetterRecord::new(&message(), DeadLetterReason::MissingAction, "no action");
        let headers = record.headers();
        assert_eq!(
            headers.inner().get("x-dlq-reason"),
            Some(&AMQPValue::LongString("missing-action".into()))
        );
        assert_eq!(
            headers.inner().get(DELIVERY_COUNT_HEADER),
            Some(&AMQPValue::LongLongInt(3))
        );
    }
}
