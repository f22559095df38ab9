//! Worker node: binds its listeners, registers with the directory, and keeps
//! the local snapshot following whoever is principal.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use crate::protocol::{parse_addr, Envelope, MsgType, RegisterContent};
use crate::utils::{
    tcp_bind_with_retry, udp_bind, udp_recv_envelope, udp_send_envelope,
    RendezvousError,
};
use crate::worker::{
    BackupReplicator, CopyServer, HeartbeatClient, HeartbeatParams,
    PrincipalTracker, ReplParams, ReplState, SessionHandler, SessionListener,
    SnapshotStore, TrackerAction,
};

use serde::Deserialize;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::time::Duration;

/// Attempts at finding a port free for both the copy listener and the
/// notice socket.
const COPY_BIND_ATTEMPTS: usize = 5;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Interval between heartbeats to the directory.
    pub heartbeat_interval_ms: u64,

    /// Time to wait for each heartbeat reply.
    pub reply_timeout_ms: u64,

    /// Backoff between failed replication attempts.
    pub retry_backoff_ms: u64,

    /// Interval of re-copying from the same principal; `0` disables.
    pub resync_interval_ms: u64,

    /// Limit on each step of a snapshot copy, on both ends.
    pub copy_timeout_ms: u64,

    /// Multicast group heartbeats are also sent to; empty disables.
    pub multicast_addr: String,

    /// Largest snapshot accepted from a principal.
    pub max_snapshot_bytes: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            heartbeat_interval_ms: 5000,
            reply_timeout_ms: 2000,
            retry_backoff_ms: 3000,
            resync_interval_ms: 0,
            copy_timeout_ms: 10000,
            multicast_addr: "".into(),
            max_snapshot_bytes: 256 * 1024 * 1024,
        }
    }
}

impl WorkerConfig {
    /// Checks value sanity, returning the parsed multicast group if any.
    fn validate(&self) -> Result<Option<SocketAddr>, RendezvousError> {
        if self.heartbeat_interval_ms == 0 {
            return logged_err!(
                "invalid config.heartbeat_interval_ms '{}'",
                self.heartbeat_interval_ms
            );
        }
        if self.reply_timeout_ms == 0
            || self.reply_timeout_ms >= self.heartbeat_interval_ms
        {
            return logged_err!(
                "invalid config.reply_timeout_ms '{}'",
                self.reply_timeout_ms
            );
        }
        if self.retry_backoff_ms == 0 {
            return logged_err!(
                "invalid config.retry_backoff_ms '{}'",
                self.retry_backoff_ms
            );
        }
        if self.copy_timeout_ms == 0 {
            return logged_err!(
                "invalid config.copy_timeout_ms '{}'",
                self.copy_timeout_ms
            );
        }
        if self.max_snapshot_bytes == 0 {
            return logged_err!(
                "invalid config.max_snapshot_bytes '{}'",
                self.max_snapshot_bytes
            );
        }

        if self.multicast_addr.is_empty() {
            return Ok(None);
        }
        match self.multicast_addr.parse::<SocketAddr>() {
            Ok(group) if group.ip().is_multicast() => Ok(Some(group)),
            _ => logged_err!(
                "invalid config.multicast_addr '{}'",
                self.multicast_addr
            ),
        }
    }
}

/// Local IP this host uses to reach `directory`. No datagram is sent.
async fn local_ip_toward(
    directory: SocketAddr,
) -> Result<IpAddr, RendezvousError> {
    let any: IpAddr = if directory.is_ipv4() {
        Ipv4Addr::UNSPECIFIED.into()
    } else {
        Ipv6Addr::UNSPECIFIED.into()
    };
    let sock = udp_bind(SocketAddr::new(any, 0)).await?;
    sock.connect(directory).await?;
    Ok(sock.local_addr()?.ip())
}

/// Binds the copy listener on an ephemeral port together with a UDP notice
/// socket on the same port number.
async fn bind_copy_pair(
    bind_ip: IpAddr,
) -> Result<(TcpListener, UdpSocket), RendezvousError> {
    for _ in 0..COPY_BIND_ATTEMPTS {
        let listener =
            tcp_bind_with_retry(SocketAddr::new(bind_ip, 0), 0).await?;
        let port = listener.local_addr()?.port();
        match UdpSocket::bind(SocketAddr::new(bind_ip, port)).await {
            Ok(notice) => return Ok((listener, notice)),
            Err(e) => {
                pf_debug!("UDP port {} taken ({}), trying another", port, e)
            }
        }
    }
    logged_err!("no port free for both copy listener and notice socket")
}

/// A worker server: session listener, snapshot replication, and membership
/// in the directory.
pub struct WorkerNode {
    /// Directory service address.
    directory: SocketAddr,

    /// Advertised address of the session listener.
    client_addr: SocketAddr,

    /// Advertised address of the copy listener; this worker's identity.
    copy_addr: SocketAddr,

    /// Socket receiving `UPDATE_PRINCIPAL` notices; also sends registration.
    notice_socket: UdpSocket,

    /// Local snapshot.
    store: SnapshotStore,

    /// Decides reactions to advertised principals.
    tracker: PrincipalTracker,

    /// Receiver side of heartbeat reports.
    rx_report: mpsc::UnboundedReceiver<Option<SocketAddr>>,

    /// HeartbeatClient module.
    heartbeat: HeartbeatClient,

    /// BackupReplicator module.
    replicator: BackupReplicator,

    /// CopyServer module.
    copy_server: CopyServer,

    /// SessionListener module.
    sessions: SessionListener,
}

impl WorkerNode {
    /// Binds all sockets, registers with the directory and starts every
    /// background module. Failing to bind anything is fatal.
    ///
    /// `client_port` `0` picks an ephemeral session port. An unspecified
    /// `bind_ip` advertises the local IP used to reach the directory.
    pub async fn new_and_setup(
        bind_ip: IpAddr,
        client_port: u16,
        directory: SocketAddr,
        snapshot_path: impl Into<PathBuf>,
        handler: Arc<dyn SessionHandler>,
        config_str: Option<&str>,
    ) -> Result<Self, RendezvousError> {
        let config = parsed_config!(config_str => WorkerConfig;
                                    heartbeat_interval_ms, reply_timeout_ms,
                                    retry_backoff_ms, resync_interval_ms,
                                    copy_timeout_ms, multicast_addr,
                                    max_snapshot_bytes)?;
        let multicast = config.validate()?;

        let advertised_ip = if bind_ip.is_unspecified() {
            local_ip_toward(directory).await?
        } else {
            bind_ip
        };

        let session_listener =
            tcp_bind_with_retry(SocketAddr::new(bind_ip, client_port), 0)
                .await?;
        let (copy_listener, notice_socket) = bind_copy_pair(bind_ip).await?;
        let heartbeat_socket = udp_bind(SocketAddr::new(bind_ip, 0)).await?;

        let client_addr = SocketAddr::new(
            advertised_ip,
            session_listener.local_addr()?.port(),
        );
        let copy_addr =
            SocketAddr::new(advertised_ip, copy_listener.local_addr()?.port());
        pf_info!(
            "worker up, session '{}' copy '{}'",
            client_addr,
            copy_addr
        );

        let copy_timeout = Duration::from_millis(config.copy_timeout_ms);
        let store = SnapshotStore::new(snapshot_path);
        let copy_server = CopyServer::new_and_setup(
            copy_listener,
            store.clone(),
            copy_timeout,
        );
        let sessions =
            SessionListener::new_and_setup(session_listener, handler);
        let replicator = BackupReplicator::new_and_setup(
            store.clone(),
            ReplParams {
                retry_backoff: Duration::from_millis(config.retry_backoff_ms),
                resync_interval: Duration::from_millis(
                    config.resync_interval_ms,
                ),
                copy_timeout,
                max_snapshot_bytes: config.max_snapshot_bytes,
            },
        )?;

        // heartbeats register us too, so a lost registration is not fatal
        let register = Envelope::server_register(&RegisterContent {
            client_addr,
            copy_addr,
        });
        match udp_send_envelope(&notice_socket, &register, directory).await {
            Ok(()) => pf_info!("registered with directory '{}'", directory),
            Err(e) => pf_warn!("error registering with '{}': {}", directory, e),
        }

        let (tx_report, rx_report) = mpsc::unbounded_channel();
        let heartbeat = HeartbeatClient::new_and_setup(
            heartbeat_socket,
            HeartbeatParams {
                directory,
                multicast,
                client_port: client_addr.port(),
                copy_port: copy_addr.port(),
                interval: Duration::from_millis(config.heartbeat_interval_ms),
                reply_timeout: Duration::from_millis(config.reply_timeout_ms),
            },
            store.clone(),
            tx_report,
        )?;

        Ok(WorkerNode {
            directory,
            client_addr,
            copy_addr,
            notice_socket,
            store,
            tracker: PrincipalTracker::new(copy_addr),
            rx_report,
            heartbeat,
            replicator,
            copy_server,
            sessions,
        })
    }

    /// Advertised session address.
    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    /// Advertised copy address, which identifies this worker.
    pub fn copy_addr(&self) -> SocketAddr {
        self.copy_addr
    }

    /// Local snapshot store.
    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Current replication state.
    pub fn replication_state(&self) -> ReplState {
        self.replicator.state()
    }

    /// A receiver for watching replication state changes.
    pub fn state_watcher(&self) -> watch::Receiver<ReplState> {
        self.replicator.state_watcher()
    }

    /// Feeds an advertised principal through the tracker into the
    /// replicator.
    fn react(&mut self, advertised: Option<SocketAddr>) {
        match self.tracker.observe(advertised) {
            TrackerAction::Follow(principal) => {
                self.replicator.follow(principal)
            }
            TrackerAction::Disconnect => {
                if advertised == Some(self.copy_addr) {
                    pf_info!("promoted to principal");
                }
                self.replicator.disconnect();
            }
            TrackerAction::Stay => {}
        }
    }

    /// Handles one datagram on the notice socket.
    fn handle_notice(&mut self, env: Envelope, source: SocketAddr) {
        if env.msg_type() != Some(MsgType::UpdatePrincipal) {
            pf_warn!("ignoring {} from '{}'", env, source);
            return;
        }
        match parse_addr(env.content()) {
            Ok(principal) => {
                pf_info!("notified of new principal '{}'", principal);
                self.react(Some(principal));
            }
            Err(e) => pf_warn!("bad UPDATE_PRINCIPAL from '{}': {}", source, e),
        }
    }

    /// Main event loop of the worker. Breaks out of the loop only upon
    /// catching the termination signal, then shuts every module down and
    /// deregisters from the directory once.
    pub async fn run(
        mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), RendezvousError> {
        loop {
            tokio::select! {
                // principal advertised in a heartbeat reply
                report = self.rx_report.recv() => {
                    match report {
                        Some(advertised) => self.react(advertised),
                        None => {
                            pf_error!("heartbeat thread gone, shutting down");
                            break;
                        }
                    }
                },

                // principal change pushed by the directory
                received = udp_recv_envelope(&self.notice_socket) => {
                    match received {
                        Ok((source, Ok(env))) => self.handle_notice(env, source),
                        Ok((source, Err(e))) => {
                            pf_warn!("undecodable notice from '{}': {}", source, e);
                        }
                        Err(e) => pf_error!("error receiving notice: {}", e),
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("worker caught termination signal");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    /// Stops every module and sends one `SERVER_DEREGISTER`.
    async fn shutdown(self) -> Result<(), RendezvousError> {
        let WorkerNode {
            directory,
            copy_addr,
            notice_socket,
            heartbeat,
            replicator,
            copy_server,
            sessions,
            ..
        } = self;

        heartbeat.stop().await?;
        replicator.disconnect();
        replicator.stop().await?;
        sessions.stop().await?;
        copy_server.stop().await?;

        let deregister = Envelope::server_deregister(copy_addr);
        match udp_send_envelope(&notice_socket, &deregister, directory).await {
            Ok(()) => pf_info!("deregistered from directory '{}'", directory),
            Err(e) => {
                pf_warn!("error deregistering from '{}': {}", directory, e)
            }
        }
        Ok(())
    }
}
