//! Network and client object configuration.

use std::time::Duration;

/// Process-wide network configuration.
///
/// Mirrors the teacher's `TransportConfig` builder idiom
/// (`xtransport::config::TransportConfig`): a `Default` impl giving the
/// spec's documented defaults, plus `with_*` setters for overriding them.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Listener bind address.
    pub hostname: String,
    /// Listener port.
    pub port: u16,
    /// RX-silence timeout before a connection is declared dead.
    pub timeout_connection_ms: u64,
    /// How long a disconnected client object survives before eviction.
    /// `None` means infinite (the object never times out on its own).
    pub timeout_object_s: Option<u64>,
    /// Bounded capacity of each client object's rx/tx queues.
    pub queue_cap: usize,
}

impl NetworkConfig {
    /// Builds a config with the spec's documented defaults.
    pub fn new() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 8888,
            timeout_connection_ms: linkframe::config::DEFAULT_TIMEOUT_CONNECTION_MS,
            timeout_object_s: Some(linkframe::config::DEFAULT_TIMEOUT_OBJECT_S),
            queue_cap: linkframe::config::DEFAULT_QUEUE_CAP,
        }
    }

    /// Overrides the bind hostname.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Overrides the bind port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Overrides the RX-silence connection timeout.
    pub fn with_timeout_connection_ms(mut self, ms: u64) -> Self {
        self.timeout_connection_ms = ms;
        self
    }

    /// Overrides the object eviction TTL. `None` makes objects persistent.
    pub fn with_timeout_object_s(mut self, s: Option<u64>) -> Self {
        self.timeout_object_s = s;
        self
    }

    /// Overrides the rx/tx queue capacity.
    pub fn with_queue_cap(mut self, cap: usize) -> Self {
        self.queue_cap = cap;
        self
    }

    /// The RX-silence timeout as a [`Duration`].
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_connection_ms)
    }

    /// The keepalive emission period: `2/3` of the connection timeout.
    pub fn keepalive_period(&self) -> Duration {
        Duration::from_millis(self.timeout_connection_ms * 2 / 3)
    }

    /// The object eviction TTL as a [`Duration`], or `None` if infinite.
    pub fn object_timeout(&self) -> Option<Duration> {
        self.timeout_object_s.map(Duration::from_secs)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::new()
    }
}
