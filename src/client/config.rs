use std::time::Duration;

use super::{ClientError, ClientResult};

/// Default capacity of each keepalive delivery channel.
pub const DEFAULT_RESPONSE_CHANNEL_SIZE: usize = 16;

/// Default session TTL in seconds.
pub const DEFAULT_SESSION_TTL: i64 = 60;

/// Tuning for the keepalive multiplexer.
#[derive(Clone, Debug)]
pub struct KeepAliveConfig {
    /// Capacity of each consumer's delivery channel. Responses arriving while
    /// it is full are dropped for delivery; renewal bookkeeping still advances.
    pub response_channel_size: usize,
    /// How long a new registration may wait for its first response.
    pub first_keep_alive_timeout: Duration,
    /// Worker cadence for deadline checks and request (re)sends.
    pub tick_interval: Duration,
    pub retry_backoff_min: Duration,
    pub retry_backoff_max: Duration,
    /// Capacity of the worker's command queue.
    pub command_queue_size: usize,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            response_channel_size: DEFAULT_RESPONSE_CHANNEL_SIZE,
            first_keep_alive_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(500),
            retry_backoff_min: Duration::from_millis(500),
            retry_backoff_max: Duration::from_secs(4),
            command_queue_size: 128,
        }
    }
}

impl KeepAliveConfig {
    pub fn with_response_channel_size(mut self, size: usize) -> Self {
        self.response_channel_size = size;
        self
    }

    pub fn with_first_keep_alive_timeout(mut self, timeout: Duration) -> Self {
        self.first_keep_alive_timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.retry_backoff_min = min;
        self.retry_backoff_max = max;
        self
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.response_channel_size == 0 {
            return Err(ClientError::InvalidConfig(
                "response_channel_size must be greater than 0".to_string(),
            ));
        }

        if self.command_queue_size == 0 {
            return Err(ClientError::InvalidConfig(
                "command_queue_size must be greater than 0".to_string(),
            ));
        }

        if self.tick_interval.is_zero() {
            return Err(ClientError::InvalidConfig(
                "tick_interval must be non-zero".to_string(),
            ));
        }

        if self.retry_backoff_min.is_zero() || self.retry_backoff_min > self.retry_backoff_max {
            return Err(ClientError::InvalidConfig(
                "retry_backoff_min must be non-zero and not exceed retry_backoff_max".to_string(),
            ));
        }

        if self.first_keep_alive_timeout < self.tick_interval {
            return Err(ClientError::InvalidConfig(
                "first_keep_alive_timeout must be at least one tick_interval".to_string(),
            ));
        }

        Ok(())
    }
}

/// Client-wide configuration.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub keep_alive: KeepAliveConfig,
    /// TTL used by sessions created without an explicit one.
    pub session_ttl: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            keep_alive: KeepAliveConfig::default(),
            session_ttl: DEFAULT_SESSION_TTL,
        }
    }
}

impl ClientConfig {
    pub fn with_keep_alive(mut self, keep_alive: KeepAliveConfig) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_session_ttl(mut self, ttl: i64) -> Self {
        self.session_ttl = ttl;
        self
    }

    pub fn validate(&self) -> ClientResult<()> {
        if self.session_ttl <= 0 {
            return Err(ClientError::InvalidConfig(
                "session_ttl must be positive".to_string(),
            ));
        }
        self.keep_alive.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_channel_size() {
        let config = ClientConfig::default()
            .with_keep_alive(KeepAliveConfig::default().with_response_channel_size(0));
        assert!(matches!(config.validate(), Err(ClientError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let config = KeepAliveConfig::default()
            .with_retry_backoff(Duration::from_secs(2), Duration::from_secs(1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_positive_session_ttl() {
        assert!(ClientConfig::default().with_session_ttl(0).validate().is_err());
    }
}
