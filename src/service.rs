//! Runs a [`ConsumerLoop`] in the background and keeps it connected.
//!
//! Transient failures (unreachable broker, dropped connection, cancelled
//! consumer stream) are retried with exponential backoff. Anything else stops
//! the service and is returned from [`ServiceHandle::join`].

use crate::amqp::AmqpConnector;
use crate::config::WorkerConfig;
use crate::consumer::{ConsumerLoop, ConsumerOptions, ConsumerStats, LoopExit};
use crate::delivery::MessageSource;
use crate::error::WorkerError;
use crate::handler::Dispatch;
use crate::retry::ReconnectConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Opens a fresh, fully set-up consumer subscription.
#[async_trait]
pub trait Connector: Send + Sync {
    type Source: MessageSource + 'static;

    async fn open(&self) -> Result<Self::Source, WorkerError>;
}

/// Where the supervisor currently is, published through a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    /// Spawned, not yet connecting.
    Starting,
    Connecting,
    /// Subscribed and running the consumer loop.
    Consuming,
    /// Waiting `delay` before connection attempt number `attempt + 1`.
    Reconnecting { attempt: usize, delay: Duration },
    /// Shut down on request.
    Stopped,
    /// Stopped by a fatal error, or by running out of reconnect attempts.
    Failed(String),
}

/// A consumer that owns its connection lifecycle.
///
/// Nothing connects until [`start`](Self::start) or [`run`](Self::run).
pub struct ConsumerService<C, D: ?Sized> {
    connector: C,
    dispatcher: Arc<D>,
    options: ConsumerOptions,
    reconnect: ReconnectConfig,
}

impl<D> ConsumerService<AmqpConnector, D>
where
    D: Dispatch + ?Sized + 'static,
{
    /// A service consuming from RabbitMQ as described by `config`.
    pub fn new(config: WorkerConfig, dispatcher: Arc<D>) -> Result<Self, WorkerError> {
        config.validate()?;
        let options = ConsumerOptions::from(&config);
        let reconnect = config.reconnect.clone();
        Ok(Self::with_connector(
            AmqpConnector::new(config),
            dispatcher,
            options,
            reconnect,
        ))
    }
}

impl<C, D> ConsumerService<C, D>
where
    C: Connector + 'static,
    D: Dispatch + ?Sized + 'static,
{
    /// A service over any [`Connector`], e.g. [`MockBroker`](crate::mock::MockBroker).
    pub fn with_connector(
        connector: C,
        dispatcher: Arc<D>,
        options: ConsumerOptions,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            connector,
            dispatcher,
            options,
            reconnect,
        }
    }

    /// Spawns the service onto the current tokio runtime.
    pub fn start(self) -> ServiceHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ServiceState::Starting);
        let task = tokio::spawn(self.supervise(cancel.clone(), state_tx));
        ServiceHandle {
            state: state_rx,
            cancel,
            task,
        }
    }

    /// Runs the service on the current task until `cancel` fires or a fatal
    /// error occurs.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let (state_tx, _state_rx) = watch::channel(ServiceState::Starting);
        self.supervise(cancel, state_tx).await
    }

    async fn supervise(
        self,
        cancel: CancellationToken,
        state: watch::Sender<ServiceState>,
    ) -> Result<(), WorkerError> {
        let mut backoff = self.reconnect.schedule();
        let mut attempt = 0;

        loop {
            state.send_replace(ServiceState::Connecting);
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return stopped(&state),
                opened = self.connector.open() => opened,
            };

            let failure = match opened {
                Ok(source) => {
                    state.send_replace(ServiceState::Consuming);
                    let connected = Instant::now();
                    let (result, stats) = self.consume(source, &cancel).await;
                    // A connection that drops straight away counts as a failed attempt.
                    if stats.handled() > 0 || connected.elapsed() >= self.reconnect.stable_after() {
                        backoff = self.reconnect.schedule();
                        attempt = 0;
                    }
                    match result {
                        Ok(LoopExit::Cancelled) => return stopped(&state),
                        Ok(LoopExit::StreamClosed) => {
                            WorkerError::ConnectionLost("consumer stream closed by the broker".into())
                        }
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };

            if !failure.is_transient() {
                log::error!("Consumer stopped by a fatal error: {}", failure);
                state.send_replace(ServiceState::Failed(failure.to_string()));
                return Err(failure);
            }
            let Some(delay) = backoff.next() else {
                log::error!(
                    "Giving up after {} reconnect attempts: {}",
                    attempt,
                    failure
                );
                state.send_replace(ServiceState::Failed(failure.to_string()));
                return Err(failure);
            };

            attempt += 1;
            log::warn!(
                "Broker unavailable ({}), reconnect attempt {} in {:?}",
                failure,
                attempt,
                delay
            );
            state.send_replace(ServiceState::Reconnecting { attempt, delay });
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return stopped(&state),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn consume(
        &self,
        source: C::Source,
        cancel: &CancellationToken,
    ) -> (Result<LoopExit, WorkerError>, ConsumerStats) {
        let mut consumer =
            ConsumerLoop::new(source, Arc::clone(&self.dispatcher), self.options.clone());
        let result = consumer.run(cancel).await;

        let stats = consumer.stats();
        log::info!(
            "Consumer loop ended: {} acked, {} requeued, {} dead-lettered",
            stats.acked,
            stats.requeued,
            stats.dead_lettered
        );
        if let Err(err) = consumer.into_source().close().await {
            log::warn!("Failed to close consumer connection: {}", err);
        }
        (result, stats)
    }
}

fn stopped(state: &watch::Sender<ServiceState>) -> Result<(), WorkerError> {
    log::info!("Consumer service stopped");
    state.send_replace(ServiceState::Stopped);
    Ok(())
}

/// Controls a service started with [`ConsumerService::start`].
pub struct ServiceHandle {
    state: watch::Receiver<ServiceState>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), WorkerError>>,
}

impl ServiceHandle {
    /// The latest published state.
    pub fn state(&self) -> ServiceState {
        self.state.borrow().clone()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ServiceState> {
        self.state.clone()
    }

    /// Waits until the state satisfies `predicate`. `None` if the service
    /// ended first without ever reaching such a state.
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ServiceState) -> bool,
    ) -> Option<ServiceState> {
        let mut state = self.state.clone();
        let reached = state.wait_for(predicate).await.ok().map(|s| s.clone());
        reached
    }

    /// Cancelling this token has the same effect as [`shutdown`](Self::shutdown)
    /// without waiting for the task.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stops consuming once the message in flight, if any, is resolved.
    pub async fn shutdown(self) -> Result<(), WorkerError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the service to end and returns its final result.
    pub async fn join(self) -> Result<(), WorkerError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(WorkerError::TaskFailed(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnrecognizedErrorPolicy;
    use crate::handler::{HandlerError, HandlerRegistry};
    use crate::mock::{MockBroker, Outcome};

    fn quick_reconnect(max_attempts: usize) -> ReconnectConfig {
        ReconnectConfig {
            min_delay_ms: 1,
            max_delay_ms: 5,
            max_attempts: Some(max_attempts),
            jitter: false,
        }
    }

    fn service(
        broker: &MockBroker,
        options: ConsumerOptions,
        reconnect: ReconnectConfig,
    ) -> ConsumerService<MockBroker, HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn(["ok"], |_| async { Ok(()) })
            .register_fn(["broken"], |_| async {
                Err(HandlerError::Other("unexpected state".into()))
            });
        ConsumerService::with_connector(broker.clone(), Arc::new(registry), options, reconnect)
    }

    #[tokio::test]
    async fn test_retries_until_broker_is_reachable() {
        let broker = MockBroker::new();
        broker.fail_next_connects(2);
        broker.publish("ns.request.ok", "a");

        let handle = service(&broker, ConsumerOptions::default(), quick_reconnect(5)).start();
        broker.wait_for_settlements(1).await;
        let state = handle.watch_state();
        handle.shutdown().await.unwrap();

        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.outcomes(), vec![Outcome::Acked]);
        assert_eq!(*state.borrow(), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let broker = MockBroker::new();
        broker.fail_next_connects(10);

        let handle = service(&broker, ConsumerOptions::default(), quick_reconnect(2)).start();
        let state = handle.watch_state();
        let err = handle.join().await.unwrap_err();

        assert!(matches!(err, WorkerError::Unreachable { .. }));
        assert_eq!(broker.connect_attempts(), 3);
        assert!(matches!(*state.borrow(), ServiceState::Failed(_)));
    }

    #[tokio::test]
    async fn test_disabled_reconnect_fails_fast() {
        let broker = MockBroker::new();
        broker.fail_next_connects(1);

        let handle = service(&broker, ConsumerOptions::default(), ReconnectConfig::disabled()).start();
        assert!(matches!(handle.join().await, Err(WorkerError::Unreachable { .. })));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_topology_conflict_is_fatal() {
        let broker = MockBroker::new();
        broker.refuse_topology();

        let handle = service(&broker, ConsumerOptions::default(), quick_reconnect(5)).start();
        let err = handle.join().await.unwrap_err();

        assert!(matches!(err, WorkerError::TopologyConflict { .. }));
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_loss() {
        let broker = MockBroker::new();
        broker.publish("ns.request.ok", "a");
        let handle = service(&broker, ConsumerOptions::default(), quick_reconnect(5)).start();
        broker.wait_for_settlements(1).await;

        broker.sever_connection();
        broker.publish("ns.request.ok", "b");
        broker.wait_for_settlements(2).await;
        handle.shutdown().await.unwrap();

        assert_eq!(broker.connect_attempts(), 2);
        assert_eq!(broker.outcomes(), vec![Outcome::Acked, Outcome::Acked]);
    }

    #[tokio::test]
    async fn test_resubscribes_after_broker_cancels_consumer() {
        let broker = MockBroker::new();
        let handle = service(&broker, ConsumerOptions::default(), quick_reconnect(5)).start();
        handle
            .wait_for_state(|s| *s == ServiceState::Consuming)
            .await
            .unwrap();

        broker.cancel_consumers();
        broker.publish("ns.request.ok", "a");
        broker.wait_for_settlements(1).await;
        handle.shutdown().await.unwrap();

        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn test_halt_policy_stops_service() {
        let broker = MockBroker::new();
        broker.publish("ns.request.broken", "a");
        let options = ConsumerOptions {
            unrecognized_errors: UnrecognizedErrorPolicy::Halt,
            ..ConsumerOptions::default()
        };

        let handle = service(&broker, options, quick_reconnect(5)).start();
        let err = handle.join().await.unwrap_err();

        assert!(matches!(err, WorkerError::HandlerHalted { .. }));
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.ready_count(), 1);
    }

    /// Opens fine, then loses the connection before anything is delivered.
    struct Flapping(MockBroker);

    #[async_trait]
    impl Connector for Flapping {
        type Source = crate::mock::MockSource;

        async fn open(&self) -> Result<Self::Source, WorkerError> {
            let source = self.0.open().await?;
            self.0.sever_connection();
            Ok(source)
        }
    }

    #[tokio::test]
    async fn test_flapping_connection_still_runs_out_of_attempts() {
        let broker = MockBroker::new();
        let reconnect = ReconnectConfig {
            min_delay_ms: 1,
            max_delay_ms: 60_000,
            max_attempts: Some(2),
            jitter: false,
        };

        let handle = ConsumerService::with_connector(
            Flapping(broker.clone()),
            Arc::new(HandlerRegistry::new()),
            ConsumerOptions::default(),
            reconnect,
        )
        .start();
        let err = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
            .unwrap_err();

        assert!(matches!(err, WorkerError::ConnectionLost(_)));
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_while_idle() {
        let broker = MockBroker::new();
        let handle = service(&broker, ConsumerOptions::default(), quick_reconnect(5)).start();
        handle
            .wait_for_state(|s| *s == ServiceState::Consuming)
            .await
            .unwrap();

        assert!(handle.shutdown().await.is_ok());
        assert!(broker.deliveries().is_empty());
    }
}
