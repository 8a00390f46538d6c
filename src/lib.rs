//! # timberwire
//!
//! Server-side endpoint for the Lumberjack log-shipping protocol, the
//! framed, windowed, acknowledged wire format spoken by log forwarders
//! (protocol versions 1 and 2, including the nested zlib-compressed frame
//! type).
//!
//! ## Architecture
//!
//! ```text
//! transport bytes -> frame codec -> Batch -> sink channel -> consumer
//!                                     ^                         |
//!                                     |        ack()            |
//!                ACK loop  <----------+-------------------------+
//!                   |
//!                   +--> ACK / keep-alive frames back to the peer
//! ```
//!
//! Each connection runs a read task and an ACK task. Batches are delivered
//! in wire order and acknowledged in the same order; a batch is ACKed on
//! the wire only after the consumer calls [`Batch::ack`]. Unacknowledged
//! batches are never ACKed - a dropped connection makes the peer
//! retransmit, which is what gives the pipeline its at-least-once
//! delivery.
//!
//! ## Example
//!
//! ```no_run
//! use timberwire::ServerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> timberwire::Result<()> {
//!     let mut server = ServerBuilder::new().bind("127.0.0.1:5044").await?;
//!
//!     while let Some(batch) = server.receive().await {
//!         println!("received {} events", batch.len());
//!         batch.ack();
//!     }
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tls;

mod conn;
mod mux;

pub use batch::{Batch, Event};
pub use config::{JsonDecoder, ServerBuilder};
pub use error::{Result, TimberwireError};
pub use protocol::Version;
pub use server::Server;
pub use tls::TlsState;
