//! Principal-change notifier: tells backups who the new principal is.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::directory::Election;
use crate::protocol::Envelope;
use crate::utils::{udp_send_envelope, RendezvousError};

use futures::future::join_all;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Sends `UPDATE_PRINCIPAL(principal)` to every backup, concurrently and
/// independently. Returns the number of backups successfully sent to.
pub(crate) async fn notify_backups(
    socket: &UdpSocket,
    principal: SocketAddr,
    backups: &[SocketAddr],
) -> usize {
    if backups.is_empty() {
        pf_debug!("no backup to notify of principal '{}'", principal);
        return 0;
    }

    let msg = Envelope::update_principal(principal);
    let results = join_all(
        backups
            .iter()
            .map(|&backup| udp_send_envelope(socket, &msg, backup)),
    )
    .await;

    let mut sent = 0;
    for (backup, result) in backups.iter().zip(results) {
        match result {
            Ok(()) => sent += 1,
            Err(e) => {
                pf_warn!("error notifying backup '{}': {}", backup, e)
            }
        }
    }
    pf_info!(
        "notified {}/{} backup(s) of new principal '{}'",
        sent,
        backups.len(),
        principal
    );
    sent
}

/// Background fan-out task fed with elections in the order they happened.
pub(crate) struct PrincipalNotifier {
    /// Sender side of the election channel.
    tx_elect: mpsc::UnboundedSender<Election>,

    /// Join handle of the notifier thread.
    notifier_handle: JoinHandle<()>,
}

impl PrincipalNotifier {
    /// Spawns the notifier thread, which sends from `socket`.
    pub(crate) fn new_and_setup(socket: Arc<UdpSocket>) -> Self {
        let (tx_elect, rx_elect) = mpsc::unbounded_channel();
        let notifier_handle =
            tokio::spawn(Self::notifier_thread(socket, rx_elect));
        PrincipalNotifier {
            tx_elect,
            notifier_handle,
        }
    }

    /// Hands out a sender, for producers living in other tasks.
    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Election> {
        self.tx_elect.clone()
    }

    /// Queues an election for announcement. Never blocks.
    pub(crate) fn announce(
        &self,
        election: Election,
    ) -> Result<(), RendezvousError> {
        self.tx_elect.send(election)?;
        Ok(())
    }

    /// Stops the notifier thread, dropping pending announcements.
    pub(crate) async fn stop(self) {
        self.notifier_handle.abort();
        let _ = self.notifier_handle.await;
    }

    /// Notifier thread function.
    async fn notifier_thread(
        socket: Arc<UdpSocket>,
        mut rx_elect: mpsc::UnboundedReceiver<Election>,
    ) {
        pf_debug!("notifier thread spawned");

        while let Some(election) = rx_elect.recv().await {
            match election {
                Election::Elected { principal, backups } => {
                    notify_backups(&socket, principal, &backups).await;
                }
                Election::Vacant => {
                    pf_info!("registry empty, no principal to announce");
                }
            }
        }

        pf_debug!("notifier thread exitted");
    }
}
