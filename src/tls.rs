//! TLS support: accept-time wrapping and connection-state snapshots.
//!
//! Certificate and key management is the caller's concern; the server only
//! takes a ready-made `rustls::ServerConfig`. What the rest of the crate
//! cares about is the [`TlsState`] snapshot captured right after the
//! handshake, which travels with every batch read from that connection.

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::ServerConnection;

/// Plain-data snapshot of a TLS connection taken after the handshake.
///
/// Fixed at accept time; batches from the same connection share one
/// snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsState {
    /// DER-encoded certificate chain presented by the peer, leaf first.
    /// Empty when the peer sent no certificate.
    pub peer_certificates: Vec<Vec<u8>>,
    /// Negotiated ALPN protocol, if any.
    pub alpn_protocol: Option<Vec<u8>>,
    /// SNI server name requested by the peer, if any.
    pub server_name: Option<String>,
    /// Negotiated protocol version, e.g. `"TLSv1_3"`.
    pub protocol_version: Option<String>,
}

impl TlsState {
    pub(crate) fn from_server_connection(conn: &ServerConnection) -> Self {
        Self {
            peer_certificates: conn
                .peer_certificates()
                .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
                .unwrap_or_default(),
            alpn_protocol: conn.alpn_protocol().map(<[u8]>::to_vec),
            server_name: conn.server_name().map(str::to_owned),
            protocol_version: conn.protocol_version().map(|v| format!("{v:?}")),
        }
    }
}
