//! Accept-time version demultiplexing.
//!
//! When both protocol versions are enabled on one endpoint, the first byte
//! of a fresh connection decides the handler: `'1'` routes to the v1
//! decoder, `'2'` to v2, anything else drops the connection without a
//! response. The peeked byte is pushed back through [`PrefixedStream`] so
//! the versioned reader still sees (and re-validates) the complete window
//! header.
//!
//! The peek runs inside the per-connection task, racing the global
//! shutdown signal, so a peer that connects and never speaks can neither
//! stall the accept loop nor outlive a shutdown.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::conn::{self, ConnContext};
use crate::protocol::Version;

/// Route a fresh connection to its versioned handler and run it.
pub(crate) async fn route<S>(mut stream: S, ctx: ConnContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    match (ctx.v1, ctx.v2) {
        (true, false) => conn::serve(stream, Version::V1, ctx).await,
        (false, true) => conn::serve(stream, Version::V2, ctx).await,
        (true, true) => {
            let mut shutdown = ctx.shutdown.clone();
            let mut first = [0u8; 1];
            tokio::select! {
                // Shutdown before the peek completes: drop the transport.
                _ = shutdown.wait_for(|stop| *stop) => return,
                peeked = stream.read_exact(&mut first) => {
                    if let Err(e) = peeked {
                        debug!("connection closed before version byte: {e}");
                        return;
                    }
                }
            }

            match Version::from_byte(first[0]) {
                Some(version) => {
                    conn::serve(PrefixedStream::new(first[0], stream), version, ctx).await;
                }
                None => {
                    debug!(byte = first[0], "unknown protocol version byte, dropping connection");
                }
            }
        }
        // Builders refuse to construct a server with no version enabled.
        (false, false) => debug_assert!(false, "route called with no version enabled"),
    }
}

/// Stream adapter whose first read yields one previously peeked byte, then
/// delegates to the wrapped stream.
pub(crate) struct PrefixedStream<S> {
    prefix: Option<u8>,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: u8, inner: S) -> Self {
        Self {
            prefix: Some(prefix),
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if let Some(byte) = self.prefix.take() {
            if buf.remaining() == 0 {
                self.prefix = Some(byte);
                return Poll::Ready(Ok(()));
            }
            buf.put_slice(&[byte]);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
