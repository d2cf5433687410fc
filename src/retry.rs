//! Reconnect backoff for the consumer service.

use backon::{BackoffBuilder, ExponentialBuilder};
use serde::Deserialize;
use std::time::Duration;

/// Exponential backoff between reconnect attempts.
///
/// The schedule restarts once a connection has handled a message or stayed
/// up for `max_delay_ms`, so `max_attempts` bounds consecutive failures only.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    /// `None` retries forever; `Some(0)` never reconnects.
    pub max_attempts: Option<usize>,
    pub jitter: bool,
}

impl ReconnectConfig {
    /// Gives up on the first failure.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    pub fn builder(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms)))
            .with_max_times(self.max_attempts.unwrap_or(usize::MAX));
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// How long a connection must stay up before the schedule restarts.
    pub fn stable_after(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms))
    }

    /// A fresh delay schedule.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> {
        self.builder().build()
    }
}

impl Default for ReconnectConfig {
    /// 500ms doubling up to 30s, at most 10 consecutive attempts, jittered.
    fn default() -> Self {
        Self {
            min_delay_ms: 500,
            max_delay_ms: 30_000,
            max_attempts: Some(10),
            jitter: true,
        }
    }
}
