//! Server shell: accept loop, sink ownership and graceful shutdown.
//!
//! A [`Server`] fans every accepted connection out to its own handler task
//! and funnels the resulting batches into one sink channel. The server
//! either owns that channel (created with a small buffer, closed exactly
//! once on shutdown) or adopts one supplied by the caller (never closed by
//! the server).
//!
//! Shutdown is a broadcast `watch` flag every task observes, paired with a
//! waitgroup built from per-task channel senders: [`Server::close`] flips
//! the flag, then waits until the accept loop and every connection handler
//! have dropped their senders.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::batch::Batch;
use crate::config::{ConnConfig, ServerBuilder, DEFAULT_SINK_CAPACITY};
use crate::conn::ConnContext;
use crate::error::{Result, TimberwireError};
use crate::mux;
use crate::tls::TlsState;

/// A running Lumberjack endpoint serving multiple client connections.
pub struct Server {
    cfg: Arc<ConnConfig>,
    v1: bool,
    v2: bool,
    sink: Option<mpsc::Sender<Batch>>,
    receiver: Option<mpsc::Receiver<Batch>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks_tx: Option<mpsc::Sender<()>>,
    tasks_rx: Option<mpsc::Receiver<()>>,
    local_addr: Option<SocketAddr>,
}

/// What the accept loop hands each spawned connection task.
struct AcceptShared {
    cfg: Arc<ConnConfig>,
    sink: mpsc::Sender<Batch>,
    shutdown: watch::Receiver<bool>,
    tasks: mpsc::Sender<()>,
    tls: Option<TlsAcceptor>,
    v1: bool,
    v2: bool,
}

impl Server {
    pub(crate) fn start(builder: ServerBuilder, listener: Option<TcpListener>) -> Result<Server> {
        if !builder.v1 && !builder.v2 {
            return Err(TimberwireError::NoVersionEnabled);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (tasks_tx, tasks_rx) = mpsc::channel::<()>(1);

        let (sink, receiver) = match builder.sink {
            Some(sink) => (sink, None),
            None => {
                let (tx, rx) = mpsc::channel(DEFAULT_SINK_CAPACITY);
                (tx, Some(rx))
            }
        };

        let cfg = Arc::new(ConnConfig {
            timeout: builder.timeout,
            keepalive: builder.keepalive,
            decoder: builder.decoder,
            logging: builder.logging,
        });

        let local_addr = listener.as_ref().and_then(|l| l.local_addr().ok());

        if let Some(listener) = listener {
            let shared = AcceptShared {
                cfg: cfg.clone(),
                sink: sink.clone(),
                shutdown: shutdown_rx.clone(),
                tasks: tasks_tx.clone(),
                tls: builder.tls.map(TlsAcceptor::from),
                v1: builder.v1,
                v2: builder.v2,
            };
            tokio::spawn(accept_loop(listener, shared));
        }

        Ok(Server {
            cfg,
            v1: builder.v1,
            v2: builder.v2,
            sink: Some(sink),
            receiver,
            shutdown_tx,
            shutdown_rx,
            tasks_tx: Some(tasks_tx),
            tasks_rx: Some(tasks_rx),
            local_addr,
        })
    }

    /// Address the server's own listener is bound to, when it has one.
    /// Useful after binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Next received batch, or `None` once the server is closed.
    ///
    /// Every returned batch must be acknowledged via [`Batch::ack`] for
    /// the peer to make progress. Returns `None` immediately when the sink
    /// channel was supplied externally; consume your own receiver instead.
    pub async fn receive(&mut self) -> Option<Batch> {
        let mut shutdown = self.shutdown_rx.clone();
        let receiver = self.receiver.as_mut()?;
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => None,
            batch = receiver.recv() => batch,
        }
    }

    /// Take the receiving end of the server-owned sink channel for
    /// channel-style consumption. `None` when the sink was supplied
    /// externally or the receiver was already taken.
    pub fn take_receiver(&mut self) -> Option<mpsc::Receiver<Batch>> {
        self.receiver.take()
    }

    /// Inject an already-accepted connection, e.g. from an external
    /// listener. The connection goes through the same version routing as
    /// accepted sockets. No TLS wrapping is applied.
    pub fn handle<S>(&self, stream: S, remote_addr: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (Some(sink), Some(tasks)) = (&self.sink, &self.tasks_tx) else {
            debug!("handle() called on a closed server, dropping connection");
            return;
        };

        let ctx = ConnContext {
            cfg: self.cfg.clone(),
            sink: sink.clone(),
            shutdown: self.shutdown_rx.clone(),
            v1: self.v1,
            v2: self.v2,
            remote_addr: remote_addr.map(|a| a.to_string()),
            tls_state: None,
        };
        let liveness = tasks.clone();
        tokio::spawn(async move {
            let _liveness = liveness;
            mux::route(stream, ctx).await;
        });
    }

    /// Stop the server: end the accept loop, close every active
    /// connection, wait for the handlers to drain, and - when the sink
    /// channel is server-owned - close it. Idempotent.
    pub async fn close(&mut self) {
        let _ = self.shutdown_tx.send(true);
        drop(self.tasks_tx.take());
        if let Some(mut tasks) = self.tasks_rx.take() {
            // Resolves `None` once the accept loop and every handler have
            // dropped their senders.
            let _ = tasks.recv().await;
        }
        // Dropping the server's sender is what closes an owned sink
        // channel; an externally supplied channel stays open because the
        // caller still holds their own sender.
        self.sink.take();
    }
}

async fn accept_loop(listener: TcpListener, shared: AcceptShared) {
    let mut shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    if shared.cfg.logging {
                        debug!(%peer, "accepted connection");
                    }
                    spawn_connection(socket, peer, &shared);
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                    break;
                }
            }
        }
    }
    // `shared` drops here, releasing the accept loop's waitgroup sender.
}

fn spawn_connection(socket: TcpStream, peer: SocketAddr, shared: &AcceptShared) {
    let ctx = ConnContext {
        cfg: shared.cfg.clone(),
        sink: shared.sink.clone(),
        shutdown: shared.shutdown.clone(),
        v1: shared.v1,
        v2: shared.v2,
        remote_addr: Some(peer.to_string()),
        tls_state: None,
    };
    let tls = shared.tls.clone();
    let liveness = shared.tasks.clone();

    tokio::spawn(async move {
        let _liveness = liveness;
        match tls {
            Some(acceptor) => {
                let mut shutdown = ctx.shutdown.clone();
                let stream = tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => return,
                    handshake = acceptor.accept(socket) => match handshake {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(%peer, "tls handshake failed: {e}");
                            return;
                        }
                    }
                };
                let state = TlsState::from_server_connection(stream.get_ref().1);
                let ctx = ConnContext {
                    tls_state: Some(state),
                    ..ctx
                };
                mux::route(stream, ctx).await;
            }
            None => mux::route(socket, ctx).await,
        }
    });
}
