//! Directory service: the rendezvous point tracking workers and the
//! principal.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::directory::{PrincipalNotifier, Registry, Role, StalenessMonitor};
use crate::protocol::{
    parse_addr, Envelope, HeartbeatContent, MsgType, RegisterContent,
};
use crate::utils::{
    udp_bind, udp_recv_envelope, udp_send_envelope, RendezvousError,
};

use serde::Deserialize;

use tokio::net::UdpSocket;
use tokio::sync::{watch, Mutex};
use tokio::time::{Duration, Instant};

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// Time without heartbeat after which a server is considered dead.
    pub stale_threshold_ms: u64,

    /// Interval between staleness sweeps.
    pub sweep_interval_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for DirectoryConfig {
    fn default() -> Self {
        DirectoryConfig {
            stale_threshold_ms: 15000,
            sweep_interval_ms: 7500,
        }
    }
}

/// Standalone directory service.
pub struct DirectoryService {
    /// Configuration parameters struct.
    config: DirectoryConfig,

    /// Socket receiving requests from clients and workers.
    listen_socket: UdpSocket,

    /// Ephemeral socket replies and notifications are sent from.
    reply_socket: Arc<UdpSocket>,

    /// Registered servers and the principal, one lock for both.
    registry: Arc<Mutex<Registry>>,

    /// PrincipalNotifier module.
    notifier: PrincipalNotifier,

    /// StalenessMonitor module; `None` only while being restarted.
    monitor: Option<StalenessMonitor>,
}

impl DirectoryService {
    /// Creates a new directory service listening on `bind_addr` (port `0`
    /// picks an ephemeral port), and spawns its notifier and staleness
    /// monitor.
    pub async fn new_and_setup(
        bind_addr: SocketAddr,
        config_str: Option<&str>,
    ) -> Result<Self, RendezvousError> {
        let config = parsed_config!(config_str => DirectoryConfig;
                                    stale_threshold_ms, sweep_interval_ms)?;
        if config.stale_threshold_ms == 0 {
            return logged_err!(
                "invalid config.stale_threshold_ms '{}'",
                config.stale_threshold_ms
            );
        }
        if config.sweep_interval_ms == 0
            || config.sweep_interval_ms > config.stale_threshold_ms
        {
            return logged_err!(
                "invalid config.sweep_interval_ms '{}'",
                config.sweep_interval_ms
            );
        }

        let listen_socket = udp_bind(bind_addr).await?;
        let reply_socket =
            Arc::new(udp_bind(SocketAddr::new(bind_addr.ip(), 0)).await?);
        pf_info!(
            "directory service listening on '{}'",
            listen_socket.local_addr()?
        );

        let registry = Arc::new(Mutex::new(Registry::new()));
        let notifier = PrincipalNotifier::new_and_setup(reply_socket.clone());
        let monitor = StalenessMonitor::new_and_setup(
            registry.clone(),
            notifier.sender(),
            Duration::from_millis(config.stale_threshold_ms),
            Duration::from_millis(config.sweep_interval_ms),
        )?;

        Ok(DirectoryService {
            config,
            listen_socket,
            reply_socket,
            registry,
            notifier,
            monitor: Some(monitor),
        })
    }

    /// Address the service is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr, RendezvousError> {
        Ok(self.listen_socket.local_addr()?)
    }

    /// Shared handle to the registry, for inspection.
    pub fn registry(&self) -> Arc<Mutex<Registry>> {
        self.registry.clone()
    }

    /// Stops the running staleness monitor, waits for it to exit, then
    /// starts a fresh one. Never leaves two monitors running.
    pub async fn restart_monitor(&mut self) -> Result<(), RendezvousError> {
        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await?;
        }
        self.monitor = Some(StalenessMonitor::new_and_setup(
            self.registry.clone(),
            self.notifier.sender(),
            Duration::from_millis(self.config.stale_threshold_ms),
            Duration::from_millis(self.config.sweep_interval_ms),
        )?);
        Ok(())
    }

    /// Main event loop of the directory service. Breaks out of the loop only
    /// upon catching the termination signal, then stops background threads.
    pub async fn run(
        mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), RendezvousError> {
        loop {
            tokio::select! {
                // receiving a datagram
                received = udp_recv_envelope(&self.listen_socket) => {
                    match received {
                        Ok((source, Ok(env))) => self.handle_envelope(env, source).await,
                        Ok((source, Err(e))) => {
                            pf_warn!("undecodable datagram from '{}': {}", source, e);
                        }
                        Err(e) => pf_error!("error receiving datagram: {}", e),
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("directory service caught termination signal");
                    break;
                }
            }
        }

        if let Some(monitor) = self.monitor.take() {
            monitor.stop().await?;
        }
        self.notifier.stop().await;
        Ok(())
    }

    /// Logs a one-line summary of the registry.
    fn log_summary(registry: &Registry) {
        match registry.principal() {
            Some(principal) => pf_debug!(
                "principal '{}' (client '{}'), {} backup(s)",
                principal,
                registry
                    .principal_client_addr()
                    .map_or("?".into(), |a| a.to_string()),
                registry.len() - 1
            ),
            None => pf_debug!("no servers registered"),
        }
    }

    /// Sends a reply datagram, logging instead of failing.
    async fn reply(&self, env: Envelope, dest: SocketAddr) {
        if let Err(e) = udp_send_envelope(&self.reply_socket, &env, dest).await
        {
            pf_warn!("error replying {} -> '{}': {}", env.tag(), dest, e);
        }
    }
}

// DirectoryService message handlers
impl DirectoryService {
    /// Dispatches a decoded envelope by type. Never fails: problems with a
    /// single message are logged and the message is dropped.
    async fn handle_envelope(&self, env: Envelope, source: SocketAddr) {
        pf_trace!("recv <- '{}' {}", source, env);
        let result = match env.msg_type() {
            Some(MsgType::ClientRequest) => {
                self.handle_client_request(source).await;
                Ok(())
            }
            Some(MsgType::ServerRegister) => {
                self.handle_server_register(env.content()).await
            }
            Some(MsgType::Heartbeat) => {
                self.handle_heartbeat(env.content(), source).await
            }
            Some(MsgType::ServerDeregister) => {
                self.handle_server_deregister(env.content()).await
            }
            _ => {
                pf_warn!("ignoring {} from '{}'", env.tag(), source);
                Ok(())
            }
        };

        if let Err(e) = result {
            pf_warn!("dropped {} from '{}': {}", env.tag(), source, e);
        }
    }

    /// Handler of CLIENT_REQUEST. Replies with the principal's client
    /// address, or with empty content if there is no principal.
    async fn handle_client_request(&self, source: SocketAddr) {
        let principal = self.registry.lock().await.principal_client_addr();
        if principal.is_none() {
            pf_info!("no principal to offer client '{}'", source);
        }
        self.reply(Envelope::ds_response(principal), source).await;
    }

    /// Handler of SERVER_REGISTER.
    async fn handle_server_register(
        &self,
        content: &str,
    ) -> Result<(), RendezvousError> {
        let RegisterContent {
            client_addr,
            copy_addr,
        } = RegisterContent::parse(content)?;

        let mut registry = self.registry.lock().await;
        let known = registry.contains(&copy_addr);
        let (role, election) =
            registry.register(copy_addr, client_addr, Instant::now());
        if known {
            pf_debug!("server '{}' re-registered", copy_addr);
        } else {
            pf_info!(
                "registered server '{}' (client '{}') as {:?}",
                copy_addr,
                client_addr,
                role
            );
        }
        if let Some(election) = election {
            debug_assert_eq!(role, Role::Principal);
            self.notifier.announce(election)?;
        }
        Self::log_summary(&registry);
        Ok(())
    }

    /// Handler of HEARTBEAT. Always answers with the principal's copy
    /// address, even if that is empty.
    async fn handle_heartbeat(
        &self,
        content: &str,
        source: SocketAddr,
    ) -> Result<(), RendezvousError> {
        let heartbeat = HeartbeatContent::parse(content)?;
        let (client_addr, copy_addr) = heartbeat.addrs_from(source);

        let principal = {
            let mut registry = self.registry.lock().await;
            if !registry.contains(&copy_addr) {
                pf_info!("unknown server '{}' heartbeated, registering", copy_addr);
            }
            let (principal, election) =
                registry.heartbeat(copy_addr, client_addr, Instant::now());
            if let Some(election) = election {
                self.notifier.announce(election)?;
            }
            principal
        };

        self.reply(Envelope::ds_response(principal), source).await;
        Ok(())
    }

    /// Handler of SERVER_DEREGISTER.
    async fn handle_server_deregister(
        &self,
        content: &str,
    ) -> Result<(), RendezvousError> {
        let copy_addr = parse_addr(content)?;

        let mut registry = self.registry.lock().await;
        match registry.deregister(copy_addr) {
            Ok(election) => {
                pf_info!("server '{}' deregistered", copy_addr);
                if let Some(election) = election {
                    self.notifier.announce(election)?;
                }
                Self::log_summary(&registry);
            }
            Err(e) => pf_info!("{}", e),
        }
        Ok(())
    }
}
