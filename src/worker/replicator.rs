//! Backup replication client: keeps the local snapshot copied from whichever
//! worker is currently principal.

use std::fmt;
use std::net::SocketAddr;

use crate::protocol::{Envelope, MsgType};
use crate::utils::{
    tcp_connect_with_retry, tcp_read_envelope, tcp_read_frame,
    tcp_write_envelope, RendezvousError, Timer,
};
use crate::worker::SnapshotStore;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Progress of the replication towards the current target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplState {
    /// No principal to follow.
    Idle,

    /// Connecting to the principal's copy listener.
    Connecting,

    /// Request sent, waiting for `DB_COPY_START`.
    Requesting,

    /// Receiving the snapshot payload.
    Receiving,

    /// Snapshot of the given principal version installed locally.
    Installed(u64),

    /// Principal has no snapshot; local snapshot left untouched.
    Empty,

    /// Last attempt failed; retrying after a backoff.
    Failed,
}

impl fmt::Display for ReplState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReplState::Installed(version) => {
                write!(f, "Installed({})", version)
            }
            _ => write!(f, "{:?}", self),
        }
    }
}

/// Fixed parameters of a replicator thread.
#[derive(Debug, Clone)]
pub(crate) struct ReplParams {
    /// Wait after a failed attempt before retrying.
    pub(crate) retry_backoff: Duration,

    /// Interval of re-copying after an install; zero disables.
    pub(crate) resync_interval: Duration,

    /// Limit on each step of an attempt: connect, request, payload.
    pub(crate) copy_timeout: Duration,

    /// Largest snapshot accepted.
    pub(crate) max_snapshot_bytes: usize,
}

/// One replication attempt against `principal`, publishing progress to
/// `tx_state`. Returns the terminal state on success. Every step is bounded
/// by `params.copy_timeout`; nothing is installed unless the whole payload
/// arrived.
pub(crate) async fn copy_from(
    principal: SocketAddr,
    store: &SnapshotStore,
    params: &ReplParams,
    tx_state: &watch::Sender<ReplState>,
) -> Result<ReplState, RendezvousError> {
    let step = params.copy_timeout;

    tx_state.send_replace(ReplState::Connecting);
    let mut conn = time::timeout(
        step,
        tcp_connect_with_retry(principal, 0, Duration::ZERO),
    )
    .await??;

    tx_state.send_replace(ReplState::Requesting);
    let reply = time::timeout(step, async {
        tcp_write_envelope(&mut conn, &Envelope::db_copy_request()).await?;
        tcp_read_envelope(&mut conn).await
    })
    .await??;
    if reply.msg_type() != Some(MsgType::DbCopyStart) {
        return logged_err!("expected DB_COPY_START, got {}", reply);
    }
    let version: u64 = reply.content().parse()?;
    if version == 0 {
        return Ok(ReplState::Empty);
    }

    tx_state.send_replace(ReplState::Receiving);
    let body = time::timeout(
        step,
        tcp_read_frame(&mut conn, params.max_snapshot_bytes),
    )
    .await??;
    store.install(&body).await?;
    Ok(ReplState::Installed(version))
}

/// Handle of the replicator thread. Follows at most one principal at a time
/// with at most one attempt in flight.
pub(crate) struct BackupReplicator {
    /// Principal currently followed, `None` if disconnected.
    tx_target: watch::Sender<Option<SocketAddr>>,

    /// Latest replication state.
    rx_state: watch::Receiver<ReplState>,

    /// Join handle of the replicator thread.
    replicator_handle: JoinHandle<()>,
}

impl BackupReplicator {
    /// Spawns the replicator thread, initially idle.
    pub(crate) fn new_and_setup(
        store: SnapshotStore,
        params: ReplParams,
    ) -> Result<Self, RendezvousError> {
        if params.retry_backoff.is_zero() {
            return logged_err!(
                "invalid retry backoff {:?}",
                params.retry_backoff
            );
        }
        if params.copy_timeout.is_zero() {
            return logged_err!(
                "invalid copy timeout {:?}",
                params.copy_timeout
            );
        }

        let (tx_target, rx_target) = watch::channel(None);
        let (tx_state, rx_state) = watch::channel(ReplState::Idle);
        let replicator_handle = tokio::spawn(Self::replicator_thread(
            store, params, rx_target, tx_state,
        ));

        Ok(BackupReplicator {
            tx_target,
            rx_state,
            replicator_handle,
        })
    }

    /// Starts following `principal`, abandoning any attempt or backoff
    /// towards a previous one.
    pub(crate) fn follow(&self, principal: SocketAddr) {
        pf_info!("following principal '{}'", principal);
        self.tx_target.send_replace(Some(principal));
    }

    /// Stops following anybody.
    pub(crate) fn disconnect(&self) {
        if self.tx_target.send_replace(None).is_some() {
            pf_info!("stopped following principal");
        }
    }

    /// Principal currently followed.
    pub(crate) fn target(&self) -> Option<SocketAddr> {
        *self.tx_target.borrow()
    }

    /// Latest replication state.
    pub(crate) fn state(&self) -> ReplState {
        *self.rx_state.borrow()
    }

    /// A receiver for watching replication state changes.
    pub(crate) fn state_watcher(&self) -> watch::Receiver<ReplState> {
        self.rx_state.clone()
    }

    /// Stops the replicator thread, cancelling any attempt in flight.
    pub(crate) async fn stop(self) -> Result<(), RendezvousError> {
        let BackupReplicator {
            tx_target,
            replicator_handle,
            ..
        } = self;
        drop(tx_target);
        replicator_handle.await?;
        Ok(())
    }

    /// Replicator thread function.
    async fn replicator_thread(
        store: SnapshotStore,
        params: ReplParams,
        mut rx_target: watch::Receiver<Option<SocketAddr>>,
        tx_state: watch::Sender<ReplState>,
    ) {
        pf_debug!("replicator thread spawned");

        // fires for both retry backoff and periodic resync
        let mut timer = Timer::new();

        loop {
            let target = *rx_target.borrow_and_update();
            timer.cancel();

            if let Some(principal) = target {
                tokio::select! {
                    result = copy_from(principal, &store, &params, &tx_state) => {
                        match result {
                            Ok(state) => {
                                pf_info!("replication from '{}' done: {}", principal, state);
                                tx_state.send_replace(state);
                                if matches!(state, ReplState::Installed(_))
                                    && !params.resync_interval.is_zero()
                                {
                                    let _ = timer.kickoff(params.resync_interval);
                                }
                            }
                            Err(e) => {
                                pf_warn!(
                                    "replication from '{}' failed, retrying in {:?}: {}",
                                    principal, params.retry_backoff, e
                                );
                                tx_state.send_replace(ReplState::Failed);
                                let _ = timer.kickoff(params.retry_backoff);
                            }
                        }
                    },

                    // target changed mid-attempt: drop the attempt
                    changed = rx_target.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        continue;
                    }
                }
            } else {
                tx_state.send_replace(ReplState::Idle);
            }

            tokio::select! {
                // retry or resync against the same target
                _ = timer.timeout() => {},

                changed = rx_target.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tx_state.send_replace(ReplState::Idle);
        pf_debug!("replicator thread exitted");
    }
}

#[cfg(test)]
mod replicator_tests {
    use super::*;
    use crate::utils::tcp_bind_with_retry;
    use crate::worker::CopyServer;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;
    use tokio::time;

    const STEP: Duration = Duration::from_secs(2);

    fn params(
        retry_backoff: Duration,
        resync_interval: Duration,
    ) -> ReplParams {
        ReplParams {
            retry_backoff,
            resync_interval,
            copy_timeout: STEP,
            max_snapshot_bytes: 1024,
        }
    }

    /// A principal that accepts connections and then goes quiet, reporting
    /// every accept. With `partial`, it first answers the request and sends
    /// the start of a 100-byte payload.
    async fn stalled_principal(
        partial: bool,
    ) -> Result<(SocketAddr, mpsc::UnboundedReceiver<()>), RendezvousError>
    {
        let listener: TcpListener =
            tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        let (tx_accepted, rx_accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut held = vec![];
            while let Ok((mut conn, _)) = listener.accept().await {
                if partial {
                    let _ = tcp_read_envelope(&mut conn).await;
                    let _ = tcp_write_envelope(
                        &mut conn,
                        &Envelope::db_copy_start(7),
                    )
                    .await;
                    let _ = conn.write_u64(100).await;
                    let _ = conn.write_all(&[1u8; 10]).await;
                    let _ = conn.flush().await;
                }
                held.push(conn);
                if tx_accepted.send(()).is_err() {
                    break;
                }
            }
        });
        Ok((addr, rx_accepted))
    }

    /// Waits until the state satisfies `pred`, returning it.
    async fn wait_state(
        rx_state: &mut watch::Receiver<ReplState>,
        pred: impl Fn(ReplState) -> bool,
    ) -> Result<ReplState, RendezvousError> {
        time::timeout(Duration::from_secs(3), async {
            loop {
                let state = *rx_state.borrow_and_update();
                if pred(state) {
                    return Ok::<_, RendezvousError>(state);
                }
                rx_state.changed().await?;
            }
        })
        .await?
    }

    async fn principal_with(
        contents: Option<&[u8]>,
    ) -> Result<(SocketAddr, CopyServer, tempfile::TempDir), RendezvousError>
    {
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join("principal.db"));
        if let Some(contents) = contents {
            store.install(contents).await?;
        }
        let listener = tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let addr = listener.local_addr()?;
        let server = CopyServer::new_and_setup(listener, store, STEP);
        Ok((addr, server, dir))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn follow_installs_snapshot() -> Result<(), RendezvousError> {
        let (principal, server, _pdir) =
            principal_with(Some(&b"the database"[..])).await?;
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join("backup.db"));
        let replicator = BackupReplicator::new_and_setup(
            store.clone(),
            params(Duration::from_millis(200), Duration::ZERO),
        )?;
        assert_eq!(replicator.state(), ReplState::Idle);

        let mut rx_state = replicator.state_watcher();
        replicator.follow(principal);
        assert_eq!(replicator.target(), Some(principal));
        let state =
            wait_state(&mut rx_state, |s| matches!(s, ReplState::Installed(_)))
                .await?;
        assert!(matches!(state, ReplState::Installed(v) if v > 0));
        let local = store.load().await?.map(|s| s.bytes);
        assert_eq!(local.as_deref(), Some(&b"the database"[..]));

        replicator.disconnect();
        wait_state(&mut rx_state, |s| s == ReplState::Idle).await?;
        replicator.stop().await?;
        server.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_principal_keeps_local() -> Result<(), RendezvousError> {
        let (principal, server, _pdir) = principal_with(None).await?;
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join("backup.db"));
        store.install(b"older local state").await?;
        let replicator = BackupReplicator::new_and_setup(
            store.clone(),
            params(Duration::from_millis(200), Duration::ZERO),
        )?;

        let mut rx_state = replicator.state_watcher();
        replicator.follow(principal);
        wait_state(&mut rx_state, |s| s == ReplState::Empty).await?;
        let local = store.load().await?.map(|s| s.bytes);
        assert_eq!(local.as_deref(), Some(&b"older local state"[..]));

        replicator.stop().await?;
        server.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversize_snapshot_not_installed() -> Result<(), RendezvousError> {
        let (principal, server, _pdir) =
            principal_with(Some(&[9u8; 2048][..])).await?;
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join("backup.db"));
        let replicator = BackupReplicator::new_and_setup(
            store.clone(),
            params(Duration::from_secs(10), Duration::ZERO),
        )?;

        let mut rx_state = replicator.state_watcher();
        replicator.follow(principal);
        wait_state(&mut rx_state, |s| s == ReplState::Failed).await?;
        assert_eq!(store.load().await?, None);

        replicator.stop().await?;
        server.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retarget_cancels_backoff() -> Result<(), RendezvousError> {
        // a port nobody listens on any more
        let dead = {
            let listener =
                tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
            listener.local_addr()?
        };
        let (principal, server, _pdir) =
            principal_with(Some(&b"v2"[..])).await?;

        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join("backup.db"));
        let replicator = BackupReplicator::new_and_setup(
            store.clone(),
            params(Duration::from_secs(10), Duration::ZERO),
        )?;

        let mut rx_state = replicator.state_watcher();
        replicator.follow(dead);
        wait_state(&mut rx_state, |s| s == ReplState::Failed).await?;

        // must not wait out the 10s backoff
        replicator.follow(principal);
        wait_state(&mut rx_state, |s| matches!(s, ReplState::Installed(_)))
            .await?;
        let local = store.load().await?.map(|s| s.bytes);
        assert_eq!(local.as_deref(), Some(&b"v2"[..]));

        replicator.stop().await?;
        server.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resync_picks_up_changes() -> Result<(), RendezvousError> {
        let dir = tempdir()?;
        let pstore = SnapshotStore::new(dir.path().join("principal.db"));
        pstore.install(b"first").await?;
        let listener = tcp_bind_with_retry("127.0.0.1:0".parse()?, 0).await?;
        let principal = listener.local_addr()?;
        let server =
            CopyServer::new_and_setup(listener, pstore.clone(), STEP);

        let store = SnapshotStore::new(dir.path().join("backup.db"));
        let replicator = BackupReplicator::new_and_setup(
            store.clone(),
            params(Duration::from_millis(200), Duration::from_millis(100)),
        )?;
        let mut rx_state = replicator.state_watcher();
        replicator.follow(principal);
        wait_state(&mut rx_state, |s| matches!(s, ReplState::Installed(_)))
            .await?;

        pstore.install(b"second").await?;
        time::timeout(Duration::from_secs(3), async {
            loop {
                let local = store.load().await?.map(|s| s.bytes);
                if local.as_deref() == Some(&b"second"[..]) {
                    return Ok::<(), RendezvousError>(());
                }
                time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await??;

        replicator.stop().await?;
        server.stop().await?;
        Ok(())
    }

    #[test]
    fn zero_backoff_rejected() {
        assert!(BackupReplicator::new_and_setup(
            SnapshotStore::new("unused.db"),
            params(Duration::ZERO, Duration::ZERO),
        )
        .is_err());
    }

    #[test]
    fn zero_copy_timeout_rejected() {
        let mut bad = params(Duration::from_millis(100), Duration::ZERO);
        bad.copy_timeout = Duration::ZERO;
        assert!(BackupReplicator::new_and_setup(
            SnapshotStore::new("unused.db"),
            bad,
        )
        .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn silent_principal_times_out() -> Result<(), RendezvousError> {
        let (principal, mut rx_accepted) = stalled_principal(false).await?;
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join("backup.db"));
        let replicator = BackupReplicator::new_and_setup(
            store.clone(),
            ReplParams {
                copy_timeout: Duration::from_millis(200),
                ..params(Duration::from_millis(100), Duration::ZERO)
            },
        )?;

        let mut rx_state = replicator.state_watcher();
        replicator.follow(principal);
        wait_state(&mut rx_state, |s| s == ReplState::Failed).await?;

        // the timed-out attempt is retried after the backoff
        time::timeout(Duration::from_secs(3), async {
            for _ in 0..2 {
                rx_accepted.recv().await;
            }
        })
        .await?;
        assert_eq!(store.load().await?, None);

        replicator.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retarget_interrupts_transfer() -> Result<(), RendezvousError> {
        let (stalled, _rx_accepted) = stalled_principal(true).await?;
        let (principal, server, _pdir) =
            principal_with(Some(&b"good copy"[..])).await?;
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join("backup.db"));
        let replicator = BackupReplicator::new_and_setup(
            store.clone(),
            ReplParams {
                copy_timeout: Duration::from_secs(30),
                ..params(Duration::from_secs(30), Duration::ZERO)
            },
        )?;

        let mut rx_state = replicator.state_watcher();
        replicator.follow(stalled);
        wait_state(&mut rx_state, |s| s == ReplState::Receiving).await?;

        // stuck mid-payload; a new target must not wait for it
        replicator.follow(principal);
        let state =
            wait_state(&mut rx_state, |s| matches!(s, ReplState::Installed(_)))
                .await?;
        assert_ne!(state, ReplState::Installed(7));
        let local = store.load().await?.map(|s| s.bytes);
        assert_eq!(local.as_deref(), Some(&b"good copy"[..]));

        // the abandoned attempt never lands later
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(replicator.state(), state);
        let local = store.load().await?.map(|s| s.bytes);
        assert_eq!(local.as_deref(), Some(&b"good copy"[..]));

        replicator.stop().await?;
        server.stop().await?;
        Ok(())
    }
}
