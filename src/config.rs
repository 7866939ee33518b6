//! Transport configuration.
//!
//! Loaded from JSON (every field optional, missing fields take their
//! defaults) or built in code and refined through
//! [`ConnectionBuilder`](crate::transport::ConnectionBuilder).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilitySet;
use crate::error::{Result, TransportError};
use crate::protocol::{DEFAULT_MAX_MESSAGE_SIZE, JUMBO_MESSAGE_SIZE};

/// Default send/receive arena size (64 KiB).
pub const DEFAULT_INITIAL_BUFFER_SIZE: usize = 64 * 1024;

/// Smallest accepted `max_message_size`.
pub const MIN_MAX_MESSAGE_SIZE: usize = 64;

/// Per-connection settings shared by both ends of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Largest message accepted on receive or produced on send.
    pub max_message_size: usize,
    /// Hard ceiling for `max_message_size`.
    pub jumbo_message_size: usize,
    /// Send a ping after this long without sending anything.
    pub heartbeat_period_ms: u64,
    /// Heartbeat check interval.
    pub heartbeat_tick_ms: u64,
    /// Close when nothing at all was received for this long.
    pub receive_timeout_ms: u64,
    /// Close when nothing but pings was received for this long.
    pub inactivity_timeout_ms: u64,
    /// Timeout for StreamOp, capability check and STARTTLS waits.
    pub connect_timeout_ms: u64,
    pub enable_message4: bool,
    pub enable_connect_combined: bool,
    /// Refuse everything except STARTTLS until the channel is secure.
    pub require_tls: bool,
    pub initial_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            jumbo_message_size: JUMBO_MESSAGE_SIZE,
            heartbeat_period_ms: 5_000,
            heartbeat_tick_ms: 500,
            receive_timeout_ms: 15_000,
            inactivity_timeout_ms: 600_000,
            connect_timeout_ms: 10_000,
            enable_message4: true,
            enable_connect_combined: true,
            require_tls: false,
            initial_buffer_size: DEFAULT_INITIAL_BUFFER_SIZE,
        }
    }
}

impl TransportConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: TransportConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("heartbeat_period_ms", self.heartbeat_period_ms),
            ("heartbeat_tick_ms", self.heartbeat_tick_ms),
            ("receive_timeout_ms", self.receive_timeout_ms),
            ("inactivity_timeout_ms", self.inactivity_timeout_ms),
            ("connect_timeout_ms", self.connect_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(TransportError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.jumbo_message_size > JUMBO_MESSAGE_SIZE {
            return Err(TransportError::Config(format!(
                "jumbo_message_size {} exceeds {}",
                self.jumbo_message_size, JUMBO_MESSAGE_SIZE
            )));
        }
        if self.max_message_size > self.jumbo_message_size {
            return Err(TransportError::Config(format!(
                "max_message_size {} exceeds jumbo_message_size {}",
                self.max_message_size, self.jumbo_message_size
            )));
        }
        if self.max_message_size < MIN_MAX_MESSAGE_SIZE {
            return Err(TransportError::Config(format!(
                "max_message_size {} below {}",
                self.max_message_size, MIN_MAX_MESSAGE_SIZE
            )));
        }
        if self.initial_buffer_size == 0 {
            return Err(TransportError::Config(
                "initial_buffer_size must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Capability set this configuration proposes and accepts.
    pub fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::new(self.enable_message4, self.enable_connect_combined)
    }

    #[inline]
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    #[inline]
    pub fn heartbeat_tick(&self) -> Duration {
        Duration::from_millis(self.heartbeat_tick_ms)
    }

    #[inline]
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    #[inline]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
