//! ACK and keep-alive frame encoding.
//!
//! The server only ever writes one frame shape back to the peer: the
//! 6-byte ACK (`version`, `'A'`, BE u32 count). A keep-alive is the same
//! frame with a count of zero, and exists only on v2; the v1 protocol has
//! no keep-alive concept, so the writer swallows keep-alive requests on v1
//! connections. Each frame goes out as a single write followed by a flush.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use super::{codes, Version, ACK_FRAME_LEN};

/// Writes ACK and keep-alive frames for one connection.
pub(crate) struct AckWriter<W> {
    output: W,
    version: Version,
}

impl<W: AsyncWrite + Unpin> AckWriter<W> {
    pub fn new(output: W, version: Version) -> Self {
        Self { output, version }
    }

    /// Write an ACK frame carrying `count` acknowledged events.
    pub async fn ack(&mut self, count: u32) -> io::Result<()> {
        trace!(count, "ack frame");
        let frame = encode_ack(self.version, count);
        self.output.write_all(&frame).await?;
        self.output.flush().await
    }

    /// Write a keep-alive frame (v2: ACK with count 0; v1: nothing).
    pub async fn keepalive(&mut self) -> io::Result<()> {
        match self.version {
            Version::V1 => Ok(()),
            Version::V2 => self.ack(0).await,
        }
    }
}

pub(crate) fn encode_ack(version: Version, count: u32) -> [u8; ACK_FRAME_LEN] {
    let mut frame = [0u8; ACK_FRAME_LEN];
    frame[0] = version.byte();
    frame[1] = codes::ACK;
    frame[2..6].copy_from_slice(&count.to_be_bytes());
    frame
}
