use std::time::Duration;

/// Tuning knobs for a [`crate::Dispatcher`] and the per-worker loops it runs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long the loop waits for an event before probing the worker with a
    /// ping. This is the only mechanism that detects a silently dead
    /// connection between protocol frames.
    ping_interval: Duration,
    /// Timeout passed to the blocking dequeue on the dedicated queue handle.
    /// `Duration::ZERO` blocks until an item arrives.
    dequeue_timeout: Duration,
    /// Expiry attached to every payload published on a per-message output
    /// channel.
    output_expire: Duration,
    /// How long to wait for the worker's configuration frame after the
    /// connection is accepted.
    handshake_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            dequeue_timeout: Duration::ZERO,
            output_expire: Duration::from_secs(120),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    pub fn with_output_expire(mut self, expire: Duration) -> Self {
        self.output_expire = expire;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn dequeue_timeout(&self) -> Duration {
        self.dequeue_timeout
    }

    pub fn output_expire(&self) -> Duration {
        self.output_expire
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = DispatchConfig::default();
        assert_eq!(config.ping_interval(), Duration::from_secs(15));
        assert_eq!(config.dequeue_timeout(), Duration::ZERO);
        assert!(config.output_expire() > Duration::ZERO);
    }

    #[test]
    fn builder_overrides() {
        let config = DispatchConfig::new()
            .with_ping_interval(Duration::from_millis(50))
            .with_dequeue_timeout(Duration::from_secs(1))
            .with_output_expire(Duration::from_secs(5))
            .with_handshake_timeout(Duration::from_secs(2));
        assert_eq!(config.ping_interval(), Duration::from_millis(50));
        assert_eq!(config.dequeue_timeout(), Duration::from_secs(1));
        assert_eq!(config.output_expire(), Duration::from_secs(5));
        assert_eq!(config.handshake_timeout(), Duration::from_secs(2));
    }
}
