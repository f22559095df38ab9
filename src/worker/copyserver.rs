//! Principal snapshot server: hands the local snapshot to any backup that
//! asks for it over the copy listener.

use std::net::SocketAddr;

use crate::protocol::{Envelope, MsgType};
use crate::utils::{
    tcp_read_envelope, tcp_write_envelope, tcp_write_frame, RendezvousError,
};
use crate::worker::SnapshotStore;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Serves one replication connection: exactly one `DB_COPY_REQUEST`, then
/// `DB_COPY_START(version)` and the snapshot frame (absent when version is
/// `0`). Returns the version served, `None` if the request was not a copy
/// request. Reading the request and sending the reply are each bounded by
/// `step_timeout`.
pub(crate) async fn serve_copy(
    conn: &mut TcpStream,
    store: &SnapshotStore,
    step_timeout: Duration,
) -> Result<Option<u64>, RendezvousError> {
    let req = time::timeout(step_timeout, tcp_read_envelope(conn)).await??;
    if req.msg_type() != Some(MsgType::DbCopyRequest) {
        pf_warn!("expected DB_COPY_REQUEST, got {}", req);
        return Ok(None);
    }

    let snapshot = store.load().await?;
    let version = snapshot.as_ref().map_or(0, |s| s.version);
    time::timeout(step_timeout, async {
        tcp_write_envelope(conn, &Envelope::db_copy_start(version)).await?;
        if let Some(snapshot) = &snapshot {
            tcp_write_frame(conn, &snapshot.bytes).await?;
        }
        conn.shutdown().await?;
        Ok::<(), RendezvousError>(())
    })
    .await??;
    Ok(Some(version))
}

/// Snapshot server accepting on the copy listener.
pub(crate) struct CopyServer {
    /// Sender side of the exit signal.
    tx_exit: watch::Sender<bool>,

    /// Join handle of the acceptor thread.
    acceptor_handle: JoinHandle<()>,
}

impl CopyServer {
    /// Spawns the acceptor thread over an already-bound listener.
    pub(crate) fn new_and_setup(
        listener: TcpListener,
        store: SnapshotStore,
        step_timeout: Duration,
    ) -> Self {
        let (tx_exit, rx_exit) = watch::channel(false);
        let acceptor_handle = tokio::spawn(Self::acceptor_thread(
            listener,
            store,
            step_timeout,
            rx_exit,
        ));
        CopyServer {
            tx_exit,
            acceptor_handle,
        }
    }

    /// Stops accepting new connections; transfers in flight run to
    /// completion.
    pub(crate) async fn stop(self) -> Result<(), RendezvousError> {
        let _ = self.tx_exit.send(true);
        self.acceptor_handle.await?;
        Ok(())
    }

    /// Handles one accepted connection.
    async fn connection_thread(
        mut conn: TcpStream,
        peer: SocketAddr,
        store: SnapshotStore,
        step_timeout: Duration,
    ) {
        match serve_copy(&mut conn, &store, step_timeout).await {
            Ok(Some(0)) => {
                pf_info!("no snapshot to send backup '{}'", peer)
            }
            Ok(Some(version)) => {
                pf_info!("sent snapshot version {} to '{}'", version, peer)
            }
            Ok(None) => {}
            Err(e) => pf_warn!("error sending snapshot to '{}': {}", peer, e),
        }
    }

    /// Acceptor thread function.
    async fn acceptor_thread(
        listener: TcpListener,
        store: SnapshotStore,
        step_timeout: Duration,
        mut rx_exit: watch::Receiver<bool>,
    ) {
        pf_debug!("copy server acceptor thread spawned");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((conn, peer)) => {
                            pf_debug!("accepted copy connection from '{}'", peer);
                            tokio::spawn(Self::connection_thread(
                                conn,
                                peer,
                                store.clone(),
                                step_timeout,
                            ));
                        }
                        Err(e) => pf_warn!("error accepting copy connection: {}", e),
                    }
                },

                _ = rx_exit.changed() => break,
            }
        }

        pf_debug!("copy server acceptor thread exitted");
    }
}
