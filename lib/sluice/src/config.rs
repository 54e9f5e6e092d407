//! Network settings for the hyper base transport.

use std::time::Duration;

/// Configuration for [`HyperTransport`](crate::HyperTransport).
///
/// Middleware settings live on each layer's own config type; this only covers
/// the network stack under them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Deadline for one call through the base transport, body included.
    ///
    /// Each retry attempt gets a fresh deadline. Coalesced followers wait on
    /// their leader, so they are bounded by the leader's deadline.
    pub timeout: Duration,
    /// Deadline for opening the TCP connection; expiry surfaces as
    /// [`Error::Connection`](crate::Error::Connection).
    pub connect_timeout: Duration,
    /// Idle connections parked per host once calls settle.
    ///
    /// Dedupe and the throttling cache send one leader per key, so this caps
    /// how many concurrent leaders to the same host can reuse a warm
    /// connection instead of dialing a new one.
    pub pool_idle_per_host: usize,
    /// How long a parked connection may sit unused before it is closed.
    pub pool_idle_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_idle_per_host: 32,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

impl TransportConfig {
    /// Start from the defaults and override selected fields.
    #[must_use]
    pub fn builder() -> TransportConfigBuilder {
        TransportConfigBuilder::default()
    }
}

/// Builder for [`TransportConfig`]; unset fields keep their default.
#[derive(Debug, Clone, Default)]
pub struct TransportConfigBuilder {
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    pool_idle_per_host: Option<usize>,
    pool_idle_timeout: Option<Duration>,
}

impl TransportConfigBuilder {
    /// Per-call deadline, see [`TransportConfig::timeout`].
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Connect deadline, see [`TransportConfig::connect_timeout`].
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Idle pool size per host, see [`TransportConfig::pool_idle_per_host`].
    #[must_use]
    pub const fn pool_idle_per_host(mut self, count: usize) -> Self {
        self.pool_idle_per_host = Some(count);
        self
    }

    /// Idle lifetime of pooled connections.
    #[must_use]
    pub const fn pool_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_idle_timeout = Some(timeout);
        self
    }

    /// Fill unset fields from [`TransportConfig::default`].
    #[must_use]
    pub fn build(self) -> TransportConfig {
        let defaults = TransportConfig::default();
        TransportConfig {
            timeout: self.timeout.unwrap_or(defaults.timeout),
            connect_timeout: self.connect_timeout.unwrap_or(defaults.connect_timeout),
            pool_idle_per_host: self
                .pool_idle_per_host
                .unwrap_or(defaults.pool_idle_per_host),
            pool_idle_timeout: self.pool_idle_timeout.unwrap_or(defaults.pool_idle_timeout),
        }
    }
}
