//! Per-connection handler: read loop plus ACK loop.
//!
//! Every connection runs two cooperating tasks. The read task decodes one
//! window at a time and hands each batch first to the ACK task (over an
//! in-order, capacity-1 handoff channel - the back-pressure point) and
//! then to the server's sink channel. The ACK task processes batches
//! strictly in receive order: for each one it waits for the consumer's
//! acknowledgement, emitting keep-alive frames at the configured interval
//! while the batch is in flight, and then writes an ACK carrying the
//! event count. ACK order therefore always equals wire order, which is
//! what lets the peer advance its send pointer on each count.
//!
//! Any read, decode or write error ends the handler without further ACKs;
//! the peer's retransmission contract covers delivery.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::config::ConnConfig;
use crate::error::{Result, TimberwireError};
use crate::protocol::{AckWriter, BatchReader, Version};
use crate::tls::TlsState;

/// Everything a routed connection needs from the server.
pub(crate) struct ConnContext {
    pub cfg: Arc<ConnConfig>,
    pub sink: mpsc::Sender<Batch>,
    pub shutdown: watch::Receiver<bool>,
    pub v1: bool,
    pub v2: bool,
    pub remote_addr: Option<String>,
    pub tls_state: Option<TlsState>,
}

/// Run one connection to completion.
///
/// Returns once the read loop has ended (error, EOF or shutdown) and the
/// ACK task has drained.
pub(crate) async fn serve<S>(stream: S, version: Version, mut ctx: ConnContext)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);

    let mut reader = BatchReader::new(
        read_half,
        version,
        ctx.cfg.timeout,
        ctx.cfg.decoder.clone(),
        ctx.remote_addr.clone(),
        ctx.tls_state.take(),
    );
    let writer = AckWriter::new(write_half, version);

    // Closed exactly once below; ACK task observes it and stops.
    let (stop_tx, stop_rx) = watch::channel(false);
    let (handoff_tx, handoff_rx) = mpsc::channel::<Batch>(1);

    let keepalive = match version {
        Version::V1 => Duration::ZERO,
        Version::V2 => ctx.cfg.keepalive,
    };
    let logging = ctx.cfg.logging;
    let ack_task = tokio::spawn(ack_loop(writer, handoff_rx, keepalive, stop_rx, logging));

    if logging {
        debug!(remote = ?ctx.remote_addr, %version, "client handler started");
    }

    if let Err(e) = read_loop(&mut reader, handoff_tx, &ctx.sink, &mut ctx.shutdown).await {
        match &e {
            TimberwireError::Io(_) => debug!(remote = ?ctx.remote_addr, "connection ended: {e}"),
            _ => warn!(remote = ?ctx.remote_addr, "connection handler error: {e}"),
        }
    }
    // The handoff sender is gone (moved into read_loop), signalling "no
    // more batches"; stop unblocks an ACK task still waiting on one.
    let _ = stop_tx.send(true);
    let _ = ack_task.await;

    if logging {
        debug!(remote = ?ctx.remote_addr, "client handler stopped");
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: &mut BatchReader<R>,
    handoff: mpsc::Sender<Batch>,
    sink: &mpsc::Sender<Batch>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let batch = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            read = reader.read_batch() => match read? {
                // Empty window: nothing to deliver, wait for the next one.
                None => continue,
                Some(batch) => batch,
            },
        };

        // ACK queue first, then the consumer. A full handoff slot blocks
        // here, which is what delays the next window's deadline arming
        // while the pipeline is busy.
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            sent = handoff.send(batch.clone()) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
            sent = sink.send(batch) => {
                if sent.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

async fn ack_loop<W: AsyncWrite + Unpin>(
    mut writer: AckWriter<W>,
    mut handoff: mpsc::Receiver<Batch>,
    keepalive: Duration,
    mut stop: watch::Receiver<bool>,
    logging: bool,
) {
    if logging {
        debug!("client ack loop started");
    }

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            batch = handoff.recv() => match batch {
                None => break,
                Some(batch) => {
                    if let Err(e) = wait_ack(&mut writer, &batch, keepalive, &mut stop).await {
                        // Stop ACKing on write errors; the client will
                        // reconnect and retransmit.
                        debug!("ack write failed: {e}");
                        break;
                    }
                }
            },
        }
    }

    // Drain batches still queued at shutdown without ACKing them.
    handoff.close();
    while handoff.recv().await.is_some() {}

    if logging {
        debug!("client ack loop stopped");
    }
}

/// Wait for one batch to be acknowledged, then ACK it on the wire.
///
/// Returns without writing when the stop signal fires first. Keep-alive
/// frames go out every `keepalive` while the batch stays pending (v2
/// connections arrive here with a non-zero interval only).
async fn wait_ack<W: AsyncWrite + Unpin>(
    writer: &mut AckWriter<W>,
    batch: &Batch,
    keepalive: Duration,
    stop: &mut watch::Receiver<bool>,
) -> io::Result<()> {
    let count = batch.len() as u32;

    if *stop.borrow() {
        return Ok(());
    }

    if keepalive.is_zero() {
        tokio::select! {
            changed = stop.changed() => {
                let _ = changed;
                Ok(())
            }
            () = batch.acked() => writer.ack(count).await,
        }
    } else {
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    let _ = changed;
                    return Ok(());
                }
                () = batch.acked() => return writer.ack(count).await,
                () = tokio::time::sleep(keepalive) => writer.keepalive().await?,
            }
        }
    }
}
