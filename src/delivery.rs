//! Deliveries and the seam between the consumer loop and the broker.

use crate::dlq::DeadLetterRecord;
use crate::error::WorkerError;
use crate::routing::RoutingKey;
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable};
use std::collections::HashSet;

/// Broker-assigned handle for one delivery on one channel.
pub type DeliveryTag = u64;

/// Header carrying the number of earlier deliveries (set by quorum queues).
pub const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";

/// A message handed to the consumer by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub delivery_tag: DeliveryTag,
    pub routing_key: RoutingKey,
    pub exchange: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
    /// How many times this message was delivered before this delivery.
    pub delivery_count: u32,
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    Requeued,
    DeadLettered,
}

/// A source of deliveries that can also settle them.
///
/// Every tag returned by `recv` must be passed to exactly one of `ack` or
/// `reject`. Implementations reject any other tag with
/// [`WorkerError::UnknownDeliveryTag`].
#[async_trait]
pub trait MessageSource: Send {
    /// Waits for the next delivery. `Ok(None)` means the broker ended the
    /// consumer stream. Must be cancel-safe.
    async fn recv(&mut self) -> Result<Option<Message>, WorkerError>;

    /// Removes the message from the queue for good.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), WorkerError>;

    /// Returns the message to the queue (`requeue`) or drops it.
    async fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), WorkerError>;

    /// Stores a copy of a message that is about to be rejected for good.
    ///
    /// Returns `false` when no dead-letter destination exists.
    async fn dead_letter(&mut self, record: &DeadLetterRecord) -> Result<bool, WorkerError>;

    /// Releases the underlying connection. Unsettled deliveries go back to
    /// the queue.
    async fn close(&mut self) -> Result<(), WorkerError> {
        Ok(())
    }
}

/// Tracks outstanding delivery tags so each is settled exactly once.
#[derive(Debug, Default)]
pub struct DeliveryLedger {
    outstanding: HashSet<DeliveryTag>,
}

impl DeliveryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, tag: DeliveryTag) {
        if !self.outstanding.insert(tag) {
            log::warn!("Delivery tag {} was handed out twice", tag);
        }
    }

    pub fn settle(&mut self, tag: DeliveryTag) -> Result<(), WorkerError> {
        if self.outstanding.remove(&tag) {
            Ok(())
        } else {
            Err(WorkerError::UnknownDeliveryTag(tag))
        }
    }

    pub fn in_flight(&self) -> usize {
        self.outstanding.len()
    }

    /// Forgets every outstanding tag. Tags die with their channel.
    pub fn clear(&mut self) {
        self.outstanding.clear();
    }
}

/// Reads the delivery count header, accepting any integer encoding.
pub(crate) fn delivery_count(headers: Option<&FieldTable>) -> u32 {
    let Some(headers) = headers else {
        return 0;
    };
    match headers.inner().get(DELIVERY_COUNT_HEADER) {
        Some(AMQPValue::LongLongInt(count)) => clamp_count(*count),
        Some(AMQPValue::LongInt(count)) => clamp_count(i64::from(*count)),
        Some(AMQPValue::ShortInt(count)) => clamp_count(i64::from(*count)),
        Some(AMQPValue::LongUInt(count)) => *count,
        Some(AMQPValue::ShortUInt(count)) => u32::from(*count),
        _ => 0,
    }
}

fn clamp_count(count: i64) -> u32 {
    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}
