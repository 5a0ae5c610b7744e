//! Engine tuning knobs

use flick_core::{DEFAULT_BUFFER_SIZE, DEFAULT_PROGRESS_INTERVAL};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Invalid engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Copy buffer must hold at least one byte
    #[error("buffer size must be greater than zero")]
    ZeroBuffer,

    /// Polling needs a positive interval to make progress
    #[error("poll interval must be greater than zero")]
    ZeroPollInterval,

    /// Connecting needs a positive timeout
    #[error("connect timeout must be greater than zero")]
    ZeroConnectTimeout,
}

/// Configuration for [`crate::TcpEngine`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Address the sender listens on
    pub bind_host: IpAddr,
    /// Outbound connect deadline
    pub connect_timeout: Duration,
    /// Longest the sender waits for a peer; `None` waits until cancelled
    pub accept_timeout: Option<Duration>,
    /// Longest a stream may stay silent; `None` waits until cancelled
    pub idle_timeout: Option<Duration>,
    /// How often blocked calls wake up to check for cancellation
    pub poll_interval: Duration,
    /// Copy buffer size in bytes
    pub buffer_size: usize,
    /// Bytes between two progress reports
    pub progress_interval: u64,
    /// Kernel socket buffer size hint; `None` keeps the OS default
    pub socket_buffer: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            connect_timeout: Duration::from_secs(10),
            accept_timeout: None,
            idle_timeout: Some(Duration::from_secs(30)),
            poll_interval: Duration::from_millis(100),
            buffer_size: DEFAULT_BUFFER_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            socket_buffer: Some(1024 * 1024),
        }
    }
}

impl EngineConfig {
    /// Check the configuration for values the engine cannot work with
    ///
    /// # Errors
    ///
    /// Returns the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBuffer);
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::ZeroPollInterval);
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::ZeroConnectTimeout);
        }
        Ok(())
    }
}
