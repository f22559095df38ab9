//! Worker heartbeat client plus the principal tracker deciding how to react
//! to advertised principals.

use std::net::SocketAddr;

use crate::protocol::{parse_opt_addr, Envelope, HeartbeatContent, MsgType};
use crate::utils::{
    udp_drain, udp_recv_envelope, udp_send_envelope, RendezvousError,
};
use crate::worker::SnapshotStore;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Reaction to an advertised principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerAction {
    /// Replicate from this (new) principal.
    Follow(SocketAddr),

    /// Stop replicating.
    Disconnect,

    /// Nothing to do.
    Stay,
}

/// Remembers the last advertised principal and whom this worker follows.
#[derive(Debug, Clone)]
pub struct PrincipalTracker {
    /// This worker's own copy address.
    me: SocketAddr,

    /// Last principal advertised to us.
    last: Option<SocketAddr>,

    /// Principal currently being followed.
    following: Option<SocketAddr>,
}

impl PrincipalTracker {
    /// Creates a tracker for the worker with copy address `me`.
    pub fn new(me: SocketAddr) -> Self {
        PrincipalTracker {
            me,
            last: None,
            following: None,
        }
    }

    /// Principal currently being followed.
    pub fn following(&self) -> Option<SocketAddr> {
        self.following
    }

    /// Feeds one advertised principal (from a heartbeat reply or an
    /// `UPDATE_PRINCIPAL` notice) and returns what to do about it.
    pub fn observe(&mut self, advertised: Option<SocketAddr>) -> TrackerAction {
        let previous = self.last;
        self.last = advertised;

        let action = match advertised {
            Some(principal) if principal == self.me => {
                if self.following.is_some() {
                    TrackerAction::Disconnect
                } else {
                    TrackerAction::Stay
                }
            }
            Some(principal) if Some(principal) != previous => {
                TrackerAction::Follow(principal)
            }
            None if previous.is_some() => TrackerAction::Disconnect,
            _ => TrackerAction::Stay,
        };

        match action {
            TrackerAction::Follow(principal) => {
                self.following = Some(principal)
            }
            TrackerAction::Disconnect => self.following = None,
            TrackerAction::Stay => {}
        }
        action
    }
}

/// Sends one heartbeat and waits up to `reply_timeout` for the answer.
/// Returns `None` if no `DS_RESPONSE` arrived in time, else the principal it
/// advertised. Replies left over from earlier ticks are discarded first.
pub(crate) async fn heartbeat_once(
    socket: &UdpSocket,
    directory: SocketAddr,
    multicast: Option<SocketAddr>,
    content: &HeartbeatContent,
    reply_timeout: Duration,
) -> Result<Option<Option<SocketAddr>>, RendezvousError> {
    let stale = udp_drain(socket)?;
    if stale > 0 {
        pf_debug!("discarded {} late datagrams", stale);
    }

    let heartbeat = Envelope::heartbeat(content);
    udp_send_envelope(socket, &heartbeat, directory).await?;
    if let Some(group) = multicast {
        if let Err(e) = udp_send_envelope(socket, &heartbeat, group).await {
            pf_debug!("error multicasting heartbeat to '{}': {}", group, e);
        }
    }

    let deadline = Instant::now() + reply_timeout;
    loop {
        let received =
            match time::timeout_at(deadline, udp_recv_envelope(socket)).await {
                Ok(received) => received?,
                Err(_) => return Ok(None),
            };
        match received {
            (_, Ok(reply)) if reply.msg_type() == Some(MsgType::DsResponse) => {
                return Ok(Some(parse_opt_addr(reply.content())?));
            }
            (source, Ok(other)) => {
                pf_debug!("ignoring {} from '{}'", other, source)
            }
            (source, Err(e)) => {
                pf_debug!("undecodable reply from '{}': {}", source, e)
            }
        }
    }
}

/// Handle of the periodic heartbeat thread.
pub(crate) struct HeartbeatClient {
    /// Sender side of the stop signal.
    tx_stop: watch::Sender<bool>,

    /// Join handle of the heartbeat thread.
    heartbeat_handle: JoinHandle<()>,
}

/// Fixed parameters of a heartbeat thread.
#[derive(Debug, Clone)]
pub(crate) struct HeartbeatParams {
    /// Directory service address.
    pub(crate) directory: SocketAddr,

    /// Multicast group heartbeats are also sent to, if any.
    pub(crate) multicast: Option<SocketAddr>,

    /// Port of the session listener.
    pub(crate) client_port: u16,

    /// Port of the copy listener.
    pub(crate) copy_port: u16,

    /// Interval between heartbeats.
    pub(crate) interval: Duration,

    /// Time to wait for each reply.
    pub(crate) reply_timeout: Duration,
}

impl HeartbeatClient {
    /// Spawns the heartbeat thread sending from `socket`. Every principal
    /// advertised by the directory is forwarded to `tx_report`.
    pub(crate) fn new_and_setup(
        socket: UdpSocket,
        params: HeartbeatParams,
        store: SnapshotStore,
        tx_report: mpsc::UnboundedSender<Option<SocketAddr>>,
    ) -> Result<Self, RendezvousError> {
        if params.interval.is_zero() {
            return logged_err!(
                "invalid heartbeat interval {:?}",
                params.interval
            );
        }
        if params.reply_timeout.is_zero()
            || params.reply_timeout >= params.interval
        {
            return logged_err!(
                "reply timeout {:?} must be positive and below interval {:?}",
                params.reply_timeout,
                params.interval
            );
        }

        let (tx_stop, rx_stop) = watch::channel(false);
        let heartbeat_handle = tokio::spawn(Self::heartbeat_thread(
            socket, params, store, tx_report, rx_stop,
        ));
        Ok(HeartbeatClient {
            tx_stop,
            heartbeat_handle,
        })
    }

    /// Stops the heartbeat thread and waits for it to exit.
    pub(crate) async fn stop(self) -> Result<(), RendezvousError> {
        let _ = self.tx_stop.send(true);
        self.heartbeat_handle.await?;
        Ok(())
    }

    /// Heartbeat thread function.
    async fn heartbeat_thread(
        socket: UdpSocket,
        params: HeartbeatParams,
        store: SnapshotStore,
        tx_report: mpsc::UnboundedSender<Option<SocketAddr>>,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        pf_debug!(
            "heartbeat thread spawned, to '{}' every {:?}",
            params.directory,
            params.interval
        );

        let mut ticker = time::interval(params.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {},
                _ = rx_stop.changed() => break,
            }

            let version = match store.version().await {
                Ok(version) => version,
                Err(e) => {
                    pf_warn!("error reading snapshot version: {}", e);
                    0
                }
            };
            let content = HeartbeatContent {
                version,
                client_port: params.client_port,
                copy_port: params.copy_port,
            };

            tokio::select! {
                result = heartbeat_once(
                    &socket,
                    params.directory,
                    params.multicast,
                    &content,
                    params.reply_timeout,
                ) => {
                    match result {
                        Ok(Some(principal)) => {
                            if tx_report.send(principal).is_err() {
                                break;
                            }
                        }
                        Ok(None) => pf_debug!("no heartbeat reply, skipping tick"),
                        Err(e) => pf_warn!("error sending heartbeat: {}", e),
                    }
                },

                _ = rx_stop.changed() => break,
            }
        }

        pf_debug!("heartbeat thread exitted");
    }
}
