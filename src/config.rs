// ABOUTME: Builder-style configuration for a connection's limits and transport options
// ABOUTME: Mirrors the teacher's KeepAliveConfig builder (default + with_* setters)

use std::time::Duration;

/// Per-connection limits and transport options.
///
/// ```
/// use bolt_session::config::ConnectionConfig;
/// use std::time::Duration;
///
/// let config = ConnectionConfig::default()
///     .with_max_message_size(1024 * 1024)
///     .with_websocket(true);
/// ```
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Largest reassembled Bolt message accepted before `FramingError::MessageTooLarge`.
    pub max_message_size: usize,

    /// Whether this connection should attempt WebSocket upgrade detection
    /// before falling back to raw Bolt framing.
    pub websocket_enabled: bool,

    /// Time allowed to complete the magic preamble + version negotiation
    /// handshake before the connection is torn down.
    pub handshake_timeout: Duration,

    /// Time allowed between messages before the connection is considered
    /// idle and torn down. `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024,
            websocket_enabled: true,
            handshake_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl ConnectionConfig {
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_websocket(mut self, websocket_enabled: bool) -> Self {
        self.websocket_enabled = websocket_enabled;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Disables the idle timeout entirely.
    pub fn no_idle_timeout(mut self) -> Self {
        self.idle_timeout = None;
        self
    }
}
