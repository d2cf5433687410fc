//! A single, unpooled broker connection per consumer.

use crate::error::{is_access_denied, WorkerError};
use lapin::{
    uri::{AMQPAuthority, AMQPUri, AMQPUserInfo},
    Channel, Connection, ConnectionProperties,
};
use std::fmt;

pub const DEFAULT_PORT: u16 = 5672;

/// Where and as whom to connect.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
}

pub(crate) fn default_credential() -> String {
    "guest".to_string()
}

pub(crate) fn default_vhost() -> String {
    "/".to_string()
}

impl BrokerEndpoint {
    /// An endpoint with the broker's default `guest` account and vhost `/`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: default_credential(),
            password: default_credential(),
            vhost: default_vhost(),
        }
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.vhost = vhost.into();
        self
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.host.trim().is_empty() {
            return Err(WorkerError::config("broker host must not be empty"));
        }
        if self.port == 0 {
            return Err(WorkerError::config("broker port must not be 0"));
        }
        Ok(())
    }

    fn uri(&self) -> AMQPUri {
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            ..Default::default()
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// Keeps the password out of logs.
impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("vhost", &self.vhost)
            .finish_non_exhaustive()
    }
}

/// An open connection to the broker.
pub struct BrokerConnection {
    connection: Connection,
    endpoint: String,
}

impl BrokerConnection {
    /// Opens the connection. Never retries; the caller decides what a
    /// failure means.
    pub async fn connect(endpoint: &BrokerEndpoint) -> Result<Self, WorkerError> {
        endpoint.validate()?;

        log::info!("Connecting to RabbitMQ at {}...", endpoint);
        let connection = Connection::connect_uri(endpoint.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| connect_error(endpoint, e))?;

        log::info!("Connected to RabbitMQ at {}", endpoint);
        Ok(Self {
            connection,
            endpoint: endpoint.to_string(),
        })
    }

    pub async fn open_channel(&self) -> Result<Channel, WorkerError> {
        Ok(self.connection.create_channel().await?)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> Result<(), WorkerError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.connection.close(200, "consumer shutting down").await?;
        log::info!("Connection to {} closed", self.endpoint);
        Ok(())
    }
}

/// Refused credentials or vhost are configuration mistakes; anything else
/// means the broker could not be reached.
fn connect_error(endpoint: &BrokerEndpoint, err: lapin::Error) -> WorkerError {
    if is_access_denied(&err) {
        WorkerError::config(format!("broker at {} refused access: {}", endpoint, err))
    } else {
        WorkerError::Unreachable {
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        }
    }
}
