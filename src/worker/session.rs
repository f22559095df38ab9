//! Client-facing session listener. The session protocol itself is supplied
//! by a `SessionHandler`; only a logging handler ships here.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::utils::{tcp_read_envelope, RendezvousError};

use async_trait::async_trait;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Session protocol spoken with end clients over an accepted connection.
#[async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    /// Serves one client connection until it ends.
    async fn serve(
        &self,
        conn: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), RendezvousError>;
}

/// Handler that logs every framed envelope a client sends, until EOF.
#[derive(Debug, Default)]
pub struct LoggingSession;

#[async_trait]
impl SessionHandler for LoggingSession {
    async fn serve(
        &self,
        mut conn: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), RendezvousError> {
        let mut byte = [0u8; 1];
        loop {
            // zero bytes peeked at a frame boundary is a clean close
            if conn.peek(&mut byte).await? == 0 {
                pf_debug!("session '{}' closed", peer);
                return Ok(());
            }
            let env = tcp_read_envelope(&mut conn).await?;
            pf_info!("session '{}': {}", peer, env);
        }
    }
}

/// Accepts client connections and serves each on its own task.
pub(crate) struct SessionListener {
    /// Sender side of the exit signal.
    tx_exit: watch::Sender<bool>,

    /// Join handle of the acceptor thread.
    acceptor_handle: JoinHandle<()>,
}

impl SessionListener {
    /// Spawns the acceptor thread over an already-bound listener.
    pub(crate) fn new_and_setup(
        listener: TcpListener,
        handler: Arc<dyn SessionHandler>,
    ) -> Self {
        let (tx_exit, rx_exit) = watch::channel(false);
        let acceptor_handle =
            tokio::spawn(Self::acceptor_thread(listener, handler, rx_exit));
        SessionListener {
            tx_exit,
            acceptor_handle,
        }
    }

    /// Stops accepting new sessions; running sessions are left alone.
    pub(crate) async fn stop(self) -> Result<(), RendezvousError> {
        let _ = self.tx_exit.send(true);
        self.acceptor_handle.await?;
        Ok(())
    }

    /// Acceptor thread function.
    async fn acceptor_thread(
        listener: TcpListener,
        handler: Arc<dyn SessionHandler>,
        mut rx_exit: watch::Receiver<bool>,
    ) {
        pf_debug!("session acceptor thread spawned");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, peer)) => {
                            pf_debug!("accepted session from '{}'", peer);
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handler.serve(conn, peer).await {
                                    pf_warn!("session '{}' ended: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => pf_warn!("error accepting session: {}", e),
                    }
                },

                _ = rx_exit.changed() => break,
            }
        }

        pf_debug!("session acceptor thread exitted");
    }
}
