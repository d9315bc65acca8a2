//! Server and client configuration

use remoting_proto::MuxConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default TCP port
pub const DEFAULT_TCP_PORT: u16 = 9090;

/// Default HTTP port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub host: String,
    /// TCP listener port, 0 picks a free one
    pub tcp_port: u16,
    /// HTTP listener port, 0 picks a free one
    pub http_port: u16,
    /// Multiplexer settings for accepted TCP connections
    pub mux: MuxConfig,
    /// Release leases created for a connection when it ends.
    ///
    /// Off by default: a lease id handed to one peer stays valid for the
    /// lifetime of the registry.
    pub release_leases_on_disconnect: bool,
    /// How long an HTTP callback poll waits for an invocation, in milliseconds
    pub callback_wait_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            tcp_port: DEFAULT_TCP_PORT,
            http_port: DEFAULT_HTTP_PORT,
            mux: MuxConfig::default().with_marker("server"),
            release_leases_on_disconnect: false,
            callback_wait_ms: 25_000,
        }
    }
}

impl ServerConfig {
    /// Set the bind address
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the TCP port
    pub fn with_tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// Set the HTTP port
    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    /// Set the multiplexer settings
    pub fn with_mux(mut self, mux: MuxConfig) -> Self {
        self.mux = mux;
        self
    }

    /// Release per-connection leases on disconnect
    pub fn with_release_leases_on_disconnect(mut self, release: bool) -> Self {
        self.release_leases_on_disconnect = release;
        self
    }

    /// Set the HTTP callback poll wait
    pub fn with_callback_wait(mut self, wait: Duration) -> Self {
        self.callback_wait_ms = wait.as_millis() as u64;
        self
    }

    /// HTTP callback poll wait
    pub fn callback_wait(&self) -> Duration {
        Duration::from_millis(self.callback_wait_ms)
    }

    /// `host:port` of the TCP listener
    pub fn tcp_addr(&self) -> String {
        format!("{}:{}", self.host, self.tcp_port)
    }

    /// `host:port` of the HTTP listener
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }
}

/// Client configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Multiplexer settings for TCP connections
    pub mux: MuxConfig,
    /// Pause after a failed HTTP callback poll, in milliseconds
    pub callback_poll_interval_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mux: MuxConfig::default().with_marker("client"),
            callback_poll_interval_ms: 500,
        }
    }
}

impl ClientConfig {
    /// Set the multiplexer settings
    pub fn with_mux(mut self, mux: MuxConfig) -> Self {
        self.mux = mux;
        self
    }

    /// Set the pause after a failed HTTP callback poll
    pub fn with_callback_poll_interval(mut self, interval: Duration) -> Self {
        self.callback_poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Pause after a failed HTTP callback poll
    pub fn callback_poll_interval(&self) -> Duration {
        Duration::from_millis(self.callback_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.tcp_port, 9090);
        assert_eq!(config.http_port, 8080);
        assert!(!config.release_leases_on_disconnect);
        assert_eq!(config.tcp_addr(), "127.0.0.1:9090");

        let client = ClientConfig::default();
        assert_eq!(client.callback_poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{ "tcp_port": 7000, "mux": { "packet_size": 512 } }"#).unwrap();
        assert_eq!(config.tcp_port, 7000);
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.mux.packet_size, 512);
        assert!(config.mux.auto_flush);
    }

    #[test]
    fn test_builders() {
        let config = ServerConfig::default()
            .with_host("0.0.0.0")
            .with_tcp_port(0)
            .with_release_leases_on_disconnect(true)
            .with_callback_wait(Duration::from_secs(2));
        assert_eq!(config.tcp_addr(), "0.0.0.0:0");
        assert_eq!(config.callback_wait_ms, 2000);
        assert!(config.release_leases_on_disconnect);
    }
}
