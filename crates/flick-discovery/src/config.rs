//! Discovery settings

use std::time::Duration;

/// Configuration for [`crate::MdnsSubstrate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MdnsConfig {
    /// Longest `resolve` waits for a record that is not cached yet
    pub resolve_timeout: Duration,
    /// Capacity of each browse's event channel
    pub event_capacity: usize,
    /// How often the browse forwarder checks for a stop request
    pub poll_interval: Duration,
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            resolve_timeout: Duration::from_secs(5),
            event_capacity: 32,
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl MdnsConfig {
    /// Config with a custom resolve timeout
    #[must_use]
    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }
}
