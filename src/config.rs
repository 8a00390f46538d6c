//! Server configuration surface.
//!
//! [`ServerBuilder`] collects the run options of a Lumberjack endpoint and
//! hands off to one of three construction paths:
//!
//! - [`bind`](ServerBuilder::bind) - own a fresh TCP listener
//! - [`serve`](ServerBuilder::serve) - adopt an existing TCP listener
//! - [`build`](ServerBuilder::build) - no listener; connections are
//!   injected through [`Server::handle`](crate::Server::handle)
//!
//! # Example
//!
//! ```no_run
//! use timberwire::ServerBuilder;
//!
//! # async fn run() -> timberwire::Result<()> {
//! let mut server = ServerBuilder::new()
//!     .keepalive(std::time::Duration::from_secs(3))
//!     .v1(false)
//!     .bind("127.0.0.1:5044")
//!     .await?;
//!
//! while let Some(batch) = server.receive().await {
//!     println!("got {} events", batch.len());
//!     batch.ack();
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::rustls;

use crate::batch::{Batch, Event};
use crate::error::Result;
use crate::server::Server;

/// Default read deadline for the body of one window.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default interval between v2 keep-alive frames while a batch is pending.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(3);

/// Buffer size of the sink channel when the server owns it.
pub const DEFAULT_SINK_CAPACITY: usize = 128;

/// Injectable JSON decoder: raw payload bytes to one [`Event`].
///
/// The default is `serde_json::from_slice`. A decoder that panics is
/// caught at the call boundary and reported as a decode error.
pub type JsonDecoder = Arc<
    dyn Fn(&[u8]) -> std::result::Result<Event, Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

pub(crate) fn default_decoder() -> JsonDecoder {
    Arc::new(|payload| serde_json::from_slice(payload).map_err(Into::into))
}

/// Per-connection settings shared by every handler of one server.
pub(crate) struct ConnConfig {
    pub timeout: Duration,
    pub keepalive: Duration,
    pub decoder: JsonDecoder,
    pub logging: bool,
}

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder {
    pub(crate) timeout: Duration,
    pub(crate) keepalive: Duration,
    pub(crate) v1: bool,
    pub(crate) v2: bool,
    pub(crate) decoder: JsonDecoder,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) sink: Option<mpsc::Sender<Batch>>,
    pub(crate) logging: bool,
}

impl ServerBuilder {
    /// Create a builder with the default options: both protocol versions
    /// enabled, 30s window timeout, 3s keep-alive, `serde_json` decoder,
    /// plaintext transport, server-owned sink channel.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            v1: true,
            v2: true,
            decoder: default_decoder(),
            tls: None,
            sink: None,
            logging: true,
        }
    }

    /// Read deadline applied to the body of a window. Idle connections
    /// between windows are never timed out.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Interval between keep-alive frames (ACK with count 0) sent to v2
    /// peers while a batch awaits acknowledgement. Zero disables
    /// keep-alives. v1 connections never receive keep-alives.
    pub fn keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Enable or disable Lumberjack protocol v1.
    pub fn v1(mut self, enabled: bool) -> Self {
        self.v1 = enabled;
        self
    }

    /// Enable or disable Lumberjack protocol v2.
    pub fn v2(mut self, enabled: bool) -> Self {
        self.v2 = enabled;
        self
    }

    /// Replace the JSON decoder used for v2 data frames.
    pub fn decoder<F>(mut self, decoder: F) -> Self
    where
        F: Fn(&[u8]) -> std::result::Result<Event, Box<dyn std::error::Error + Send + Sync>>
            + Send
            + Sync
            + 'static,
    {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Enable transport TLS with the given configuration. Accepted sockets
    /// are wrapped before any protocol bytes are read, and the handshake
    /// state is snapshotted onto every batch from that connection.
    pub fn tls(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Forward batches to an externally owned channel instead of the
    /// server-owned one. The server never closes a supplied channel;
    /// [`Server::receive`](crate::Server::receive) is unavailable in this
    /// mode (consume your own receiver instead).
    pub fn sink(mut self, sink: mpsc::Sender<Batch>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Enable or disable per-connection lifecycle logging. Errors are
    /// logged regardless.
    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = enabled;
        self
    }

    /// Bind a TCP listener on `addr` and serve it.
    ///
    /// # Errors
    ///
    /// Fails if no protocol version is enabled or the bind fails.
    pub async fn bind(self, addr: &str) -> Result<Server> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener)
    }

    /// Serve connections accepted from an existing listener.
    ///
    /// # Errors
    ///
    /// Fails if no protocol version is enabled.
    pub fn serve(self, listener: TcpListener) -> Result<Server> {
        Server::start(self, Some(listener))
    }

    /// Build a server without a listener. Connections are injected with
    /// [`Server::handle`](crate::Server::handle).
    ///
    /// # Errors
    ///
    /// Fails if no protocol version is enabled.
    pub fn build(self) -> Result<Server> {
        Server::start(self, None)
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TimberwireError;

    #[test]
    fn test_no_version_enabled_is_rejected() {
        let result = ServerBuilder::new().v1(false).v2(false).build();
        assert!(matches!(result, Err(TimberwireError::NoVersionEnabled)));
    }

    #[test]
    fn test_default_builder_builds() {
        let server = ServerBuilder::new().build().unwrap();
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_single_version_builds() {
        assert!(ServerBuilder::new().v1(false).build().is_ok());
        assert!(ServerBuilder::new().v2(false).build().is_ok());
    }

    #[test]
    fn test_default_decoder_parses_json() {
        let decoder = default_decoder();
        let event = (decoder.as_ref())(br#"{"k":"v"}"#).unwrap();
        assert_eq!(event["k"], "v");
    }
}
