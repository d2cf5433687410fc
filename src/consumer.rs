//! The receive → dispatch → resolve loop.
//!
//! One message is in flight at a time. A delivery is settled only after its
//! handler returns, so the broker keeps every message until the consumer has
//! decided its fate (at-least-once delivery).

use crate::config::{UnrecognizedErrorPolicy, WorkerConfig};
use crate::delivery::{DeliveryTag, Message, MessageSource, Resolution};
use crate::dlq::{DeadLetterReason, DeadLetterRecord};
use crate::error::WorkerError;
use crate::handler::{Dispatch, HandlerError};
use crate::routing::ActionId;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Failure handling knobs for the loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub unrecognized_errors: UnrecognizedErrorPolicy,
    pub max_deliveries: Option<u32>,
}

impl From<&WorkerConfig> for ConsumerOptions {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            unrecognized_errors: config.unrecognized_errors,
            max_deliveries: config.max_deliveries,
        }
    }
}

/// Per-message progress of the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    /// No message in flight.
    Waiting,
    /// A handler is running for this delivery.
    Processing { tag: DeliveryTag, action: ActionId },
    /// The delivery was acked or rejected.
    Resolved { tag: DeliveryTag, resolution: Resolution },
}

/// Resolutions counted since the loop was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    /// Messages resolved in any way.
    pub fn handled(&self) -> u64 {
        self.acked + self.requeued + self.dead_lettered
    }

    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Acked => self.acked += 1,
            Resolution::Requeued => self.requeued += 1,
            Resolution::DeadLettered => self.dead_lettered += 1,
        }
    }
}

/// Why [`ConsumerLoop::run`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    /// The broker ended the consumer stream.
    StreamClosed,
}

/// Receives from a [`MessageSource`] and settles every delivery according to
/// what the [`Dispatch`] target returns.
pub struct ConsumerLoop<S, D: ?Sized> {
    source: S,
    dispatcher: Arc<D>,
    options: ConsumerOptions,
    state: ConsumerState,
    stats: ConsumerStats,
}

impl<S, D> ConsumerLoop<S, D>
where
    S: MessageSource,
    D: Dispatch + ?Sized,
{
    /// Creates a loop in the `Waiting` state. Nothing is received until
    /// [`run`](Self::run) or [`process_next`](Self::process_next).
    pub fn new(source: S, dispatcher: Arc<D>, options: ConsumerOptions) -> Self {
        Self {
            source,
            dispatcher,
            options,
            state: ConsumerState::Waiting,
            stats: ConsumerStats::default(),
        }
    }

    /// Where the loop is with the current message.
    pub fn state(&self) -> &ConsumerState {
        &self.state
    }

    /// Resolution counters so far.
    pub fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Hands the source back, e.g. to close it.
    pub fn into_source(self) -> S {
        self.source
    }

    /// Consumes until cancelled, until the stream ends, or until a fatal
    /// error.
    ///
    /// Cancellation is only observed while waiting for a delivery; a message
    /// that is already being handled is always resolved first.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<LoopExit, WorkerError> {
        loop {
            self.state = ConsumerState::Waiting;
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::info!("Consumer cancelled, leaving the receive loop");
                    return Ok(LoopExit::Cancelled);
                }
                received = self.source.recv() => received?,
            };
            let Some(message) = received else {
                log::warn!("Broker closed the consumer stream");
                return Ok(LoopExit::StreamClosed);
            };
            self.process(message).await?;
        }
    }

    /// Receives and resolves exactly one message. `Ok(None)` when the stream
    /// has ended.
    pub async fn process_next(&mut self) -> Result<Option<Resolution>, WorkerError> {
        self.state = ConsumerState::Waiting;
        match self.source.recv().await? {
            Some(message) => self.process(message).await.map(Some),
            None => Ok(None),
        }
    }

    async fn process(&mut self, message: Message) -> Result<Resolution, WorkerError> {
        let tag = message.delivery_tag;
        let action = message.routing_key.action();
        self.state = ConsumerState::Processing {
            tag,
            action: action.clone(),
        };

        let outcome = if action.is_empty() {
            Err(HandlerError::MissingAction(message.routing_key.to_string()))
        } else {
            invoke(self.dispatcher.as_ref(), &action, &message.payload).await
        };

        let resolution = match outcome {
            Ok(()) => {
                self.source.ack(tag).await?;
                log::info!("Message processed successfully. Tag: {}, action: `{}`", tag, action);
                Resolution::Acked
            }
            Err(err) if err.is_recoverable() => {
                if self.delivery_limit_reached(&message) {
                    log::error!(
                        "Message gave up after {} deliveries. Tag: {}, action: `{}`, error: {}",
                        message.delivery_count + 1,
                        tag,
                        action,
                        err
                    );
                    self.dead_letter(&message, DeadLetterReason::DeliveryLimitReached, &err)
                        .await?
                } else {
                    self.source.reject(tag, true).await?;
                    log::warn!(
                        "Message requeued after recoverable failure. Tag: {}, action: `{}`, error: {}",
                        tag,
                        action,
                        err
                    );
                    Resolution::Requeued
                }
            }
            Err(err @ HandlerError::MissingAction(_)) => {
                log::warn!("Rejecting malformed message. Tag: {}, error: {}", tag, err);
                self.dead_letter(&message, DeadLetterReason::MissingAction, &err)
                    .await?
            }
            Err(err) => match self.options.unrecognized_errors {
                UnrecognizedErrorPolicy::DeadLetter => {
                    log::error!(
                        "Handler failed with an unrecognized error. Tag: {}, action: `{}`, error: {}",
                        tag,
                        action,
                        err
                    );
                    self.dead_letter(&message, DeadLetterReason::UnrecognizedError, &err)
                        .await?
                }
                UnrecognizedErrorPolicy::Halt => {
                    self.source.reject(tag, true).await?;
                    self.resolved(tag, Resolution::Requeued);
                    log::error!(
                        "Handler failed with an unrecognized error, halting consumer. Tag: {}, action: `{}`, error: {}",
                        tag,
                        action,
                        err
                    );
                    return Err(WorkerError::HandlerHalted { action, source: err });
                }
            },
        };

        self.resolved(tag, resolution);
        Ok(resolution)
    }

    fn resolved(&mut self, tag: DeliveryTag, resolution: Resolution) {
        self.stats.record(resolution);
        self.state = ConsumerState::Resolved { tag, resolution };
    }

    fn delivery_limit_reached(&self, message: &Message) -> bool {
        self.options
            .max_deliveries
            .is_some_and(|max| message.delivery_count.saturating_add(1) >= max)
    }

    async fn dead_letter(
        &mut self,
        message: &Message,
        reason: DeadLetterReason,
        err: &HandlerError,
    ) -> Result<Resolution, WorkerError> {
        let record = DeadLetterRecord::new(message, reason, err);
        if !self.source.dead_letter(&record).await? {
            log::warn!(
                "No dead-letter queue configured, dropping message. Tag: {}",
                message.delivery_tag
            );
        }
        self.source.reject(message.delivery_tag, false).await?;
        Ok(Resolution::DeadLettered)
    }
}

/// Runs the handler, turning a panic into [`HandlerError::Panicked`].
async fn invoke<D: Dispatch + ?Sized>(
    dispatcher: &D,
    action: &ActionId,
    payload: &[u8],
) -> Result<(), HandlerError> {
    match AssertUnwindSafe(dispatcher.dispatch(action, payload))
        .catch_unwind()
        .await
    {
        Ok(outcome) => outcome,
        Err(panic) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerRegistry;
    use crate::mock::{MockBroker, Outcome};

    fn registry() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(["ok"], |_| async { Ok(()) })
            .register_fn(["flaky"], |_| async {
                Err(HandlerError::Environment("cache warming up".into()))
            })
            .register_fn(["broken"], |_| async {
                Err(HandlerError::Other("unexpected state".into()))
            })
            .register_fn(["panics"], |payload: Vec<u8>| async move {
                assert!(payload.is_empty(), "handler bug");
                Ok(())
            });
        registry
    }

    fn consumer(
        broker: &MockBroker,
        options: ConsumerOptions,
    ) -> ConsumerLoop<crate::mock::MockSource, HandlerRegistry> {
        ConsumerLoop::new(broker.source(), Arc::new(registry()), options)
    }

    #[tokio::test]
    async fn test_success_is_acked() {
        let broker = MockBroker::new();
        broker.publish("ns.request.ok", "a");
        let mut consumer = consumer(&broker, ConsumerOptions::default());

        assert_eq!(consumer.process_next().await.unwrap(), Some(Resolution::Acked));
        assert_eq!(broker.outcomes(), vec![Outcome::Acked]);
        assert_eq!(
            consumer.state(),
            &ConsumerState::Resolved { tag: 1, resolution: Resolution::Acked }
        );
    }

    #[tokio::test]
    async fn test_recoverable_error_is_requeued() {
        let broker = MockBroker::new();
        broker.publish("ns.request.flaky", "a");
        let mut consumer = consumer(&broker, ConsumerOptions::default());

        assert_eq!(consumer.process_next().await.unwrap(), Some(Resolution::Requeued));
        assert_eq!(broker.outcomes(), vec![Outcome::Rejected { requeue: true }]);
        assert_eq!(broker.ready_count(), 1);
        assert_eq!(consumer.stats().requeued, 1);
        assert_eq!(consumer.stats().handled(), 1);
    }

    #[tokio::test]
    async fn test_delivery_limit_dead_letters() {
        let broker = MockBroker::new();
        broker.publish("ns.request.flaky", "a");
        let options = ConsumerOptions {
            max_deliveries: Some(2),
            ..ConsumerOptions::default()
        };
        let mut consumer = consumer(&broker, options);

        assert_eq!(consumer.process_next().await.unwrap(), Some(Resolution::Requeued));
        assert_eq!(consumer.process_next().await.unwrap(), Some(Resolution::DeadLettered));

        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::DeliveryLimitReached);
        assert_eq!(dead[0].delivery_count, 2);
        assert_eq!(broker.ready_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_action_is_dead_lettered_not_requeued() {
        let broker = MockBroker::new();
        broker.publish("ns.request", "a");
        let mut consumer = consumer(&broker, ConsumerOptions::default());

        assert_eq!(consumer.process_next().await.unwrap(), Some(Resolution::DeadLettered));
        assert_eq!(broker.outcomes(), vec![Outcome::Rejected { requeue: false }]);
        assert_eq!(broker.dead_letters()[0].reason, DeadLetterReason::MissingAction);
    }

    #[tokio::test]
    async fn test_unrecognized_error_dead_letters_by_default() {
        let broker = MockBroker::new();
        broker.publish("ns.request.broken", "a");
        broker.publish("ns.request.ok", "b");
        let mut consumer = consumer(&broker, ConsumerOptions::default());

        assert_eq!(consumer.process_next().await.unwrap(), Some(Resolution::DeadLettered));
        assert_eq!(consumer.process_next().await.unwrap(), Some(Resolution::Acked));
        assert_eq!(broker.dead_letters()[0].error, "unexpected state");
    }

    #[tokio::test]
    async fn test_unknown_action_is_unrecognized() {
        let broker = MockBroker::new();
        broker.publish("ns.request.nobody.home", "a");
        let mut consumer = consumer(&broker, ConsumerOptions::default());

        assert_eq!(consumer.process_next().await.unwrap(), Some(Resolution::DeadLettered));
        assert_eq!(broker.dead_letters()[0].reason, DeadLetterReason::UnrecognizedError);
    }

    #[tokio::test]
    async fn test_halt_policy_requeues_and_stops() {
        let broker = MockBroker::new();
        broker.publish("ns.request.broken", "a");
        let options = ConsumerOptions {
            unrecognized_errors: UnrecognizedErrorPolicy::Halt,
            ..ConsumerOptions::default()
        };
        let mut consumer = consumer(&broker, options);

        let err = consumer.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, WorkerError::HandlerHalted { ref action, .. } if *action == ActionId::from(["broken"])));
        assert_eq!(broker.outcomes(), vec![Outcome::Rejected { requeue: true }]);
        assert_eq!(broker.ready_count(), 1);
        assert!(broker.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let broker = MockBroker::new();
        broker.publish("ns.request.panics", "a");
        let mut consumer = consumer(&broker, ConsumerOptions::default());

        assert_eq!(consumer.process_next().await.unwrap(), Some(Resolution::DeadLettered));
        assert_eq!(broker.dead_letters()[0].error, "handler panicked: handler bug");
    }

    #[tokio::test]
    async fn test_without_dead_letter_queue_message_is_dropped() {
        let broker = MockBroker::without_dead_letter_queue();
        broker.publish("ns.request.broken", "a");
        let mut consumer = consumer(&broker, ConsumerOptions::default());

        assert_eq!(consumer.process_next().await.unwrap(), Some(Resolution::DeadLettered));
        assert!(broker.dead_letters().is_empty());
        assert_eq!(broker.ready_count(), 0);
    }

    #[tokio::test]
    async fn test_run_returns_on_cancellation() {
        let broker = MockBroker::new();
        let mut consumer = consumer(&broker, ConsumerOptions::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(consumer.run(&cancel).await.unwrap(), LoopExit::Cancelled);
        assert_eq!(consumer.state(), &ConsumerState::Waiting);
    }

    #[tokio::test]
    async fn test_run_reports_closed_stream() {
        let broker = MockBroker::new();
        let mut consumer = consumer(&broker, ConsumerOptions::default());
        broker.publish("ns.request.ok", "a");
        broker.cancel_consumers();

        assert_eq!(
            consumer.run(&CancellationToken::new()).await.unwrap(),
            LoopExit::StreamClosed
        );
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42_u8), "non-string panic payload");
    }
}
