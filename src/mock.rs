//! In-memory broker for testing consumers without RabbitMQ.
//!
//! Behaves like a single AMQP queue with prefetch 1: requeued messages go
//! back to the head with `redelivered` set and a bumped delivery count, and
//! a severed connection returns unacked messages to the queue.

use crate::delivery::{DeliveryTag, Message, MessageSource};
use crate::dlq::DeadLetterRecord;
use crate::error::WorkerError;
use crate::routing::RoutingKey;
use crate::service::Connector;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

const MOCK_EXCHANGE: &str = "mock_exchange";
const PREFETCH: usize = 1;

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Rejected { requeue: bool },
}

/// One delivery handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub tag: DeliveryTag,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub redelivered: bool,
}

/// One ack or reject accepted by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub tag: DeliveryTag,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
struct Queued {
    routing_key: String,
    payload: Vec<u8>,
    redelivered: bool,
    delivery_count: u32,
}

impl Queued {
    fn returned(mut self) -> Self {
        self.redelivered = true;
        self.delivery_count += 1;
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum StreamEnd {
    ConnectionLost,
    Cancelled,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Queued>,
    outstanding: HashMap<DeliveryTag, Queued>,
    next_tag: DeliveryTag,
    generation: u64,
    last_end: Option<StreamEnd>,
    connect_failures: usize,
    connect_attempts: usize,
    topology_conflict: bool,
    dead_letter_enabled: bool,
    deliveries: Vec<DeliveryRecord>,
    settlements: Vec<Settlement>,
    dead_letters: Vec<DeadLetterRecord>,
    max_in_flight: usize,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mock broker for testing.
#[derive(Clone)]
pub struct MockBroker {
    shared: Arc<Shared>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    /// A broker with a dead-letter queue.
    pub fn new() -> Self {
        let broker = Self {
            shared: Arc::new(Shared::default()),
        };
        broker.shared.lock().dead_letter_enabled = true;
        broker
    }

    /// A broker where dead-lettering is a no-op, like a queue without a DLQ.
    pub fn without_dead_letter_queue() -> Self {
        let broker = Self::new();
        broker.shared.lock().dead_letter_enabled = false;
        broker
    }

    fn notify(&self) {
        self.shared.changed.notify_waiters();
    }

    /// Appends a fresh message to the back of the queue.
    pub fn publish(&self, routing_key: &str, payload: impl Into<Vec<u8>>) {
        self.shared.lock().ready.push_back(Queued {
            routing_key: routing_key.to_string(),
            payload: payload.into(),
            redelivered: false,
            delivery_count: 0,
        });
        self.notify();
    }

    /// A source on the current connection, bypassing failure injection.
    pub fn source(&self) -> MockSource {
        MockSource {
            shared: Arc::clone(&self.shared),
            generation: self.shared.lock().generation,
        }
    }

    /// The next `n` connection attempts fail as unreachable.
    pub fn fail_next_connects(&self, n: usize) {
        self.shared.lock().connect_failures = n;
    }

    /// Every connection attempt fails with a topology conflict.
    pub fn refuse_topology(&self) {
        self.shared.lock().topology_conflict = true;
    }

    /// Drops the connection: unacked messages return to the queue and every
    /// open source fails with [`WorkerError::ConnectionLost`].
    pub fn sever_connection(&self) {
        self.end_streams(StreamEnd::ConnectionLost);
    }

    /// Ends every open consumer stream, as a broker-side `basic.cancel` does.
    pub fn cancel_consumers(&self) {
        self.end_streams(StreamEnd::Cancelled);
    }

    fn end_streams(&self, end: StreamEnd) {
        {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.last_end = Some(end);
            let mut returned: Vec<(DeliveryTag, Queued)> = state.outstanding.drain().collect();
            returned.sort_by_key(|(tag, _)| *tag);
            for (_, queued) in returned.into_iter().rev() {
                state.ready.push_front(queued.returned());
            }
        }
        self.notify();
    }

    /// Every delivery handed to a consumer, in order.
    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.shared.lock().deliveries.clone()
    }

    /// Every ack or reject, in order.
    pub fn settlements(&self) -> Vec<Settlement> {
        self.shared.lock().settlements.clone()
    }

    /// Just the outcome of each settlement.
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.shared
            .lock()
            .settlements
            .iter()
            .map(|s| s.outcome)
            .collect()
    }

    /// Records published to the dead-letter queue.
    pub fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.shared.lock().dead_letters.clone()
    }

    /// Messages waiting to be delivered.
    pub fn ready_count(&self) -> usize {
        self.shared.lock().ready.len()
    }

    /// The most deliveries that were ever unsettled at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.shared.lock().max_in_flight
    }

    /// Calls to [`Connector::open`], failed ones included.
    pub fn connect_attempts(&self) -> usize {
        self.shared.lock().connect_attempts
    }

    /// Waits until at least `n` settlements have been recorded.
    pub async fn wait_for_settlements(&self, n: usize) {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if self.shared.lock().settlements.len() >= n {
                return;
            }
            changed.await;
        }
    }
}

#[async_trait]
impl Connector for MockBroker {
    type Source = MockSource;

    async fn open(&self) -> Result<MockSource, WorkerError> {
        let mut state = self.shared.lock();
        state.connect_attempts += 1;
        if state.topology_conflict {
            return Err(WorkerError::TopologyConflict {
                object: "queue 'mock'".to_string(),
                reason: "PRECONDITION_FAILED - inequivalent arg 'durable'".to_string(),
            });
        }
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(WorkerError::Unreachable {
                endpoint: "mock:5672".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(MockSource {
            shared: Arc::clone(&self.shared),
            generation: state.generation,
        })
    }
}

/// A consumer's view of the [`MockBroker`].
pub struct MockSource {
    shared: Arc<Shared>,
    generation: u64,
}

impl MockSource {
    fn check_alive(&self, state: &State) -> Result<(), WorkerError> {
        if state.generation == self.generation {
            return Ok(());
        }
        Err(WorkerError::ConnectionLost("mock connection closed".to_string()))
    }

    fn try_take(&self) -> Result<Option<Option<Message>>, WorkerError> {
        let mut state = self.shared.lock();
        if state.generation != self.generation {
            return match state.last_end {
                Some(StreamEnd::Cancelled) => Ok(Some(None)),
                _ => Err(WorkerError::ConnectionLost("mock connection severed".to_string())),
            };
        }
        if state.outstanding.len() >= PREFETCH {
            return Ok(None);
        }
        let Some(queued) = state.ready.pop_front() else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        state.deliveries.push(DeliveryRecord {
            tag,
            routing_key: queued.routing_key.clone(),
            payload: queued.payload.clone(),
            redelivered: queued.redelivered,
        });
        let message = Message {
            delivery_tag: tag,
            routing_key: RoutingKey::new(queued.routing_key.clone()),
            exchange: MOCK_EXCHANGE.to_string(),
            payload: queued.payload.clone(),
            redelivered: queued.redelivered,
            delivery_count: queued.delivery_count,
        };
        state.outstanding.insert(tag, queued);
        state.max_in_flight = state.max_in_flight.max(state.outstanding.len());
        Ok(Some(Some(message)))
    }

    fn settle(&self, tag: DeliveryTag, outcome: Outcome) -> Result<(), WorkerError> {
        {
            let mut state = self.shared.lock();
            self.check_alive(&state)?;
            let queued = state
                .outstanding
                .remove(&tag)
                .ok_or(WorkerError::UnknownDeliveryTag(tag))?;
            state.settlements.push(Settlement {
                tag,
                routing_key: queued.routing_key.clone(),
                payload: queued.payload.clone(),
                outcome,
            });
            if outcome == (Outcome::Rejected { requeue: true }) {
                state.ready.push_front(queued.returned());
            }
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl MessageSource for MockSource {
    async fn recv(&mut self) -> Result<Option<Message>, WorkerError> {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if let Some(received) = self.try_take()? {
                return Ok(received);
            }
            changed.await;
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), WorkerError> {
        self.settle(tag, Outcome::Acked)
    }

    async fn reject(&mut self, tag: DeliveryTag, requeue: bool) -> Result<(), WorkerError> {
        self.settle(tag, Outcome::Rejected { requeue })
    }

    async fn dead_letter(&mut self, record: &DeadLetterRecord) -> Result<bool, WorkerError> {
        let mut state = self.shared.lock();
        self.check_alive(&state)?;
        if !state.dead_letter_enabled {
            return Ok(false);
        }
        state.dead_letters.push(record.clone());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = MockBroker::new();
        broker.publish("ns.request.ping", "a");
        let mut source = broker.source();

        let message = source.recv().await.unwrap().unwrap();
        source.ack(message.delivery_tag).await.unwrap();

        let err = source.ack(message.delivery_tag).await.unwrap_err();
        assert!(matches!(err, WorkerError::UnknownDeliveryTag(tag) if tag == message.delivery_tag));
        let err = source.reject(message.delivery_tag, true).await.unwrap_err();
        assert!(matches!(err, WorkerError::UnknownDeliveryTag(_)));
        assert_eq!(broker.outcomes(), vec![Outcome::Acked]);
    }

    #[tokio::test]
    async fn test_prefetch_holds_back_second_message() {
        let broker = MockBroker::new();
        broker.publish("ns.request.a", "1");
        broker.publish("ns.request.b", "2");
        let mut source = broker.source();

        let first = source.recv().await.unwrap().unwrap();
        let blocked =
            tokio::time::timeout(std::time::Duration::from_millis(20), source.recv()).await;
        assert!(blocked.is_err());

        source.ack(first.delivery_tag).await.unwrap();
        let second = source.recv().await.unwrap().unwrap();
        assert_eq!(second.payload, b"2");
        assert_eq!(broker.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn test_requeue_redelivers_at_head() {
        let broker = MockBroker::new();
        broker.publish("ns.request.a", "1");
        broker.publish("ns.request.b", "2");
        let mut source = broker.source();

        let first = source.recv().await.unwrap().unwrap();
        source.reject(first.delivery_tag, true).await.unwrap();

        let again = source.recv().await.unwrap().unwrap();
        assert_eq!(again.payload, b"1");
        assert!(again.redelivered);
        assert_eq!(again.delivery_count, 1);
        assert_ne!(again.delivery_tag, first.delivery_tag);
    }

    #[tokio::test]
    async fn test_sever_returns_unacked_and_fails_stale_source() {
        let broker = MockBroker::new();
        broker.publish("ns.request.a", "1");
        let mut source = broker.source();
        let message = source.recv().await.unwrap().unwrap();

        broker.sever_connection();

        assert!(matches!(
            source.ack(message.delivery_tag).await,
            Err(WorkerError::ConnectionLost(_))
        ));
        assert!(matches!(source.recv().await, Err(WorkerError::ConnectionLost(_))));
        assert_eq!(broker.ready_count(), 1);

        let mut fresh = broker.open().await.unwrap();
        let again = fresh.recv().await.unwrap().unwrap();
        assert!(again.redelivered);
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let broker = MockBroker::new();
        broker.fail_next_connects(1);

        assert!(matches!(broker.open().await, Err(WorkerError::Unreachable { .. })));
        assert!(broker.open().await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }
}
