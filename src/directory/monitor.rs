//! Staleness monitor: periodically evicts workers that stopped heartbeating.

use std::sync::Arc;

use crate::directory::{Election, Registry};
use crate::utils::RendezvousError;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Runs one sweep over the registry. If the principal was evicted, the
/// single resulting election is queued on `tx_elect`. Returns the number of
/// evicted servers.
pub(crate) async fn sweep_once(
    registry: &Mutex<Registry>,
    tx_elect: &mpsc::UnboundedSender<Election>,
    threshold: Duration,
) -> Result<usize, RendezvousError> {
    let mut registry = registry.lock().await;
    let (evicted, election) = registry.evict_stale(Instant::now(), threshold);
    for addr in &evicted {
        pf_info!("server '{}' is stale, evicted", addr);
    }

    if let Some(election) = election {
        if let Election::Elected { principal, .. } = &election {
            pf_info!("principal changed due to staleness: '{}'", principal);
        }
        // queued while still holding the lock, so announcements keep the
        // order in which elections happened
        tx_elect.send(election)?;
    }
    Ok(evicted.len())
}

/// Handle of a running staleness monitor thread.
pub(crate) struct StalenessMonitor {
    /// Sender side of the stop signal.
    tx_stop: watch::Sender<bool>,

    /// Join handle of the monitor thread.
    monitor_handle: JoinHandle<()>,
}

impl StalenessMonitor {
    /// Spawns the monitor thread, sweeping every `interval` for entries
    /// older than `threshold`.
    pub(crate) fn new_and_setup(
        registry: Arc<Mutex<Registry>>,
        tx_elect: mpsc::UnboundedSender<Election>,
        threshold: Duration,
        interval: Duration,
    ) -> Result<Self, RendezvousError> {
        if threshold.is_zero() || interval.is_zero() {
            return logged_err!(
                "invalid staleness threshold {:?} or interval {:?}",
                threshold,
                interval
            );
        }

        let (tx_stop, rx_stop) = watch::channel(false);
        let monitor_handle = tokio::spawn(Self::monitor_thread(
            registry, tx_elect, threshold, interval, rx_stop,
        ));
        Ok(StalenessMonitor {
            tx_stop,
            monitor_handle,
        })
    }

    /// Signals the monitor thread to stop and waits for it to exit. A sweep
    /// in progress is finished first.
    pub(crate) async fn stop(self) -> Result<(), RendezvousError> {
        // receiver gone means the thread has already exitted
        let _ = self.tx_stop.send(true);
        self.monitor_handle.await?;
        Ok(())
    }

    /// Staleness monitor thread function.
    async fn monitor_thread(
        registry: Arc<Mutex<Registry>>,
        tx_elect: mpsc::UnboundedSender<Election>,
        threshold: Duration,
        interval: Duration,
        mut rx_stop: watch::Receiver<bool>,
    ) {
        pf_debug!(
            "monitor thread spawned, threshold {:?} every {:?}",
            threshold,
            interval
        );

        // first tick one interval from now rather than immediately
        let mut ticker = time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = sweep_once(&registry, &tx_elect, threshold).await {
                        pf_error!("error sweeping stale servers: {}", e);
                    }
                },

                changed = rx_stop.changed() => {
                    if changed.is_err() || *rx_stop.borrow() {
                        break;
                    }
                }
            }
        }

        pf_debug!("monitor thread exitted");
    }
}

#[cfg(test)]
mod monitor_tests {
    use super::*;
    use std::net::SocketAddr;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sweep_evicts_and_elects_once() -> Result<(), RendezvousError> {
        let registry = Mutex::new(Registry::new());
        let (tx_elect, mut rx_elect) = mpsc::unbounded_channel();
        let p: SocketAddr = "10.0.0.1:7001".parse()?;
        let b: SocketAddr = "10.0.0.2:7002".parse()?;
        let c: SocketAddr = "10.0.0.3:7003".parse()?;
        {
            let mut reg = registry.lock().await;
            let past = Instant::now() - Duration::from_secs(20);
            reg.register(p, "10.0.0.1:5000".parse()?, past);
            reg.register(b, "10.0.0.2:5000".parse()?, past);
            reg.register(c, "10.0.0.3:5000".parse()?, Instant::now());
        }

        let evicted =
            sweep_once(&registry, &tx_elect, Duration::from_secs(15)).await?;
        assert_eq!(evicted, 2);
        assert_eq!(
            rx_elect.try_recv().ok(),
            Some(Election::Elected {
                principal: c,
                backups: vec![],
            })
        );
        assert!(rx_elect.try_recv().is_err());

        // second sweep finds nothing more
        let evicted =
            sweep_once(&registry, &tx_elect, Duration::from_secs(15)).await?;
        assert_eq!(evicted, 0);
        assert!(rx_elect.try_recv().is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn monitor_thread_sweeps() -> Result<(), RendezvousError> {
        let registry = Arc::new(Mutex::new(Registry::new()));
        let (tx_elect, mut rx_elect) = mpsc::unbounded_channel();
        registry.lock().await.register(
            "10.0.0.1:7001".parse()?,
            "10.0.0.1:5000".parse()?,
            Instant::now(),
        );

        let monitor = StalenessMonitor::new_and_setup(
            registry.clone(),
            tx_elect,
            Duration::from_millis(200),
            Duration::from_millis(100),
        )?;
        let election =
            time::timeout(Duration::from_secs(2), rx_elect.recv()).await?;
        assert_eq!(election, Some(Election::Vacant));
        assert!(registry.lock().await.is_empty());
        monitor.stop().await?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_params() {
        let registry = Arc::new(Mutex::new(Registry::new()));
        let (tx_elect, _rx_elect) = mpsc::unbounded_channel();
        assert!(StalenessMonitor::new_and_setup(
            registry,
            tx_elect,
            Duration::ZERO,
            Duration::from_millis(100),
        )
        .is_err());
    }
}
