//! # RabbitMQ Consumer
//! A durable work-queue consumer for RabbitMQ topic exchanges.
//!
//! Each consumer holds one connection with prefetch 1, dispatches every
//! delivery to the handler registered for its action (the routing key minus
//! its first two segments) and settles it only once the handler returns:
//! success acks, recoverable failures requeue, and everything else is
//! dead-lettered.

pub mod amqp;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod delivery;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod mock;
pub mod retry;
pub mod routing;
pub mod service;
pub mod topology;

// Re-export key components for easy access
pub use amqp::{AmqpConnector, AmqpSource};
pub use config::{UnrecognizedErrorPolicy, WorkerConfig, WorkerConfigBuilder, PREFETCH_COUNT};
pub use connection::{BrokerConnection, BrokerEndpoint};
pub use consumer::{ConsumerLoop, ConsumerOptions, ConsumerState, ConsumerStats, LoopExit};
pub use delivery::{DeliveryTag, Message, MessageSource, Resolution};
pub use dlq::{DeadLetterNames, DeadLetterReason, DeadLetterRecord};
pub use error::WorkerError;
pub use handler::{Dispatch, HandlerError, HandlerRegistry, MessageHandler, RawHandler};
pub use retry::ReconnectConfig;
pub use routing::{ActionId, RoutingKey};
pub use service::{Connector, ConsumerService, ServiceHandle, ServiceState};
pub use topology::{Binding, QueueBinding, QueueType};
