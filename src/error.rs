//! Error types for the consumer.

use crate::delivery::DeliveryTag;
use crate::handler::HandlerError;
use crate::routing::ActionId;
use lapin::protocol::{AMQPErrorKind, AMQPHardError, AMQPSoftError};
use thiserror::Error;

/// Infrastructure errors raised by the consumer.
///
/// Handler outcomes are reported separately through [`HandlerError`]; only a
/// handler failure that halts the loop is lifted into this type.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Error originating from the underlying `lapin` library.
    #[error("RabbitMQ communication error: {0}")]
    Lapin(#[from] lapin::Error),

    /// The broker could not be reached when opening the connection.
    #[error("broker at {endpoint} is unreachable: {reason}")]
    Unreachable { endpoint: String, reason: String },

    /// An established connection or consumer stream went away.
    #[error("broker connection lost: {0}")]
    ConnectionLost(String),

    /// An exchange or queue already exists with different parameters.
    #[error("topology conflict on {object}: {reason}")]
    TopologyConflict { object: String, reason: String },

    /// Invalid or incomplete worker configuration.
    #[error("invalid worker configuration: {message}")]
    Config { message: String },

    /// The delivery tag was already acked/rejected, or was never delivered.
    #[error("delivery tag {0} is not outstanding")]
    UnknownDeliveryTag(DeliveryTag),

    /// A handler failed with an unrecognized error and the loop was told to stop.
    #[error("handler for action `{action}` halted the consumer: {source}")]
    HandlerHalted {
        action: ActionId,
        #[source]
        source: HandlerError,
    },

    /// A dead-letter record could not be encoded.
    #[error("failed to encode dead-letter record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The background consumer task panicked or was aborted.
    #[error("consumer task failed: {0}")]
    TaskFailed(String),
}

impl WorkerError {
    /// Whether reconnecting might make this error go away.
    ///
    /// Configuration mistakes, topology conflicts and handler halts are fatal.
    pub fn is_transient(&self) -> bool {
        match self {
            WorkerError::Unreachable { .. } | WorkerError::ConnectionLost(_) => true,
            WorkerError::Lapin(err) => is_transient_lapin(err),
            WorkerError::TopologyConflict { .. }
            | WorkerError::Config { .. }
            | WorkerError::UnknownDeliveryTag(_)
            | WorkerError::HandlerHalted { .. }
            | WorkerError::Serialization(_)
            | WorkerError::TaskFailed(_) => false,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        WorkerError::Config { message: message.into() }
    }
}

fn is_transient_lapin(err: &lapin::Error) -> bool {
    match err {
        lapin::Error::IOError(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::MissingHeartbeatError => true,
        lapin::Error::ProtocolError(_) => !is_precondition_failed(err) && !is_access_denied(err),
        _ => false,
    }
}

/// Whether the broker refused a declaration because it conflicts with an
/// existing object (AMQP reply code 406).
pub(crate) fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(amqp.kind(), AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED))
    )
}

/// Whether the broker refused the credentials or the virtual host. Retrying
/// cannot fix either.
pub(crate) fn is_access_denied(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(amqp)
            if matches!(
                amqp.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED)
                    | AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED)
            )
    )
}

// Allow converting from a string-like type into a configuration error
impl From<&str> for WorkerError {
    fn from(s: &str) -> Self {
        WorkerError::config(s)
    }
}

impl From<String> for WorkerError {
    fn from(s: String) -> Self {
        WorkerError::Config { message: s }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lapin::protocol::AMQPError;

    #[test]
    fn test_connection_errors_are_transient() {
        let err = WorkerError::Unreachable {
            endpoint: "localhost:5672".into(),
            reason: "connection refused".into(),
        };
        assert!(err.is_transient());
        assert!(WorkerError::ConnectionLost("stream ended".into()).is_transient());

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(WorkerError::Lapin(lapin::Error::IOError(std::sync::Arc::new(io))).is_transient());
    }

    fn protocol_error(kind: AMQPErrorKind, text: &str) -> lapin::Error {
        lapin::Error::ProtocolError(AMQPError::new(kind, text.into()))
    }

    #[test]
    fn test_refused_access_is_fatal() {
        let refused = protocol_error(
            AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED),
            "ACCESS_REFUSED - Login was refused",
        );
        assert!(is_access_denied(&refused));
        assert!(!WorkerError::Lapin(refused).is_transient());

        let vhost = protocol_error(
            AMQPErrorKind::Hard(AMQPHardError::NOTALLOWED),
            "NOT_ALLOWED - vhost missing not found",
        );
        assert!(!WorkerError::Lapin(vhost).is_transient());

        let forced = protocol_error(
            AMQPErrorKind::Hard(AMQPHardError::CONNECTIONFORCED),
            "CONNECTION_FORCED - broker forced connection closure",
        );
        assert!(WorkerError::Lapin(forced).is_transient());
    }

    #[test]
    fn test_precondition_failed_is_fatal() {
        let err = protocol_error(
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED),
            "PRECONDITION_FAILED - inequivalent arg 'durable'",
        );
        assert!(is_precondition_failed(&err));
        assert!(!WorkerError::Lapin(err).is_transient());
    }

    #[test]
    fn test_configuration_errors_are_fatal() {
        assert!(!WorkerError::from("missing host").is_transient());
        assert!(!WorkerError::TopologyConflict {
            object: "queue 'jobs'".into(),
            reason: "durable mismatch".into(),
        }
        .is_transient());
        assert!(!WorkerError::UnknownDeliveryTag(7).is_transient());
    }

    #[test]
    fn test_halted_error_names_action() {
        let err = WorkerError::HandlerHalted {
            action: ActionId::from(["build"]),
            source: HandlerError::Other("boom".into()),
        };
        assert!(!err.is_transient());
        assert!(err.to_string().contains("`build`"));
    }
}
