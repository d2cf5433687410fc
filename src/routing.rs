//! Routing key parsing.
//!
//! Routing keys follow `<namespace>.<event-type>.<action...>`. The first two
//! segments only select the queue; the remainder names the handler.

use std::fmt;

/// Number of leading routing key segments that are not part of the action.
pub const PREFIX_SEGMENTS: usize = 2;

/// A dot-delimited AMQP routing key, e.g. `stoa.request.build`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// The first segment, if the key has one.
    pub fn namespace(&self) -> Option<&str> {
        self.segments().next().filter(|s| !s.is_empty())
    }

    pub fn event_type(&self) -> Option<&str> {
        self.segments().nth(1)
    }

    /// Everything after the `<namespace>.<event-type>` prefix.
    ///
    /// Keys with fewer than three segments yield an empty action.
    pub fn action(&self) -> ActionId {
        ActionId(
            self.segments()
                .skip(PREFIX_SEGMENTS)
                .map(str::to_owned)
                .collect(),
        )
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoutingKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for RoutingKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// The variable-length action tuple that selects a handler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ActionId(Vec<String>);

impl ActionId {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("()");
        }
        f.write_str(&self.0.join("."))
    }
}

impl<const N: usize> From<[&str; N]> for ActionId {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

impl From<&[&str]> for ActionId {
    fn from(segments: &[&str]) -> Self {
        Self::new(segments.iter().copied())
    }
}
