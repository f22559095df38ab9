//! Registry of live workers and the principal reference, together with the
//! election policy. Pure state; the directory service owns it behind a lock.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::utils::RendezvousError;

use tokio::time::{Duration, Instant};

/// Information about a registered worker, keyed by its copy address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredServer {
    /// Address clients use to reach the worker's session listener.
    pub client_addr: SocketAddr,

    /// Time of the last registration or heartbeat.
    pub last_seen: Instant,
}

/// Role the caller of `Registry::register()` holds afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Caller is (or just got promoted to) principal.
    Principal,

    /// Caller is a backup.
    Backup,
}

/// Result of a principal (re-)election that others must be told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Election {
    /// `principal` was chosen; every address in `backups` should learn it.
    Elected {
        principal: SocketAddr,
        backups: Vec<SocketAddr>,
    },

    /// Nobody is left to be principal.
    Vacant,
}

/// Election policy: the smallest copy address by `SocketAddr` ordering,
/// skipping `exclude`. `None` if no candidate remains.
pub fn elect(
    servers: &BTreeMap<SocketAddr, RegisteredServer>,
    exclude: Option<SocketAddr>,
) -> Option<SocketAddr> {
    servers
        .keys()
        .copied()
        .find(|&addr| Some(addr) != exclude)
}

/// Registered workers plus the current principal.
///
/// Invariants kept by every mutating method: the principal, when set, is a
/// key of `servers`; the principal is unset iff `servers` is empty.
#[derive(Debug, Default)]
pub struct Registry {
    /// Map from copy address -> server info.
    servers: BTreeMap<SocketAddr, RegisteredServer>,

    /// Copy address of the current principal.
    principal: Option<SocketAddr>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered servers.
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// True if no server is registered.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// True if the given copy address is registered.
    pub fn contains(&self, copy_addr: &SocketAddr) -> bool {
        self.servers.contains_key(copy_addr)
    }

    /// Last time the given server was heard from.
    pub fn last_seen(&self, copy_addr: &SocketAddr) -> Option<Instant> {
        self.servers.get(copy_addr).map(|info| info.last_seen)
    }

    /// Copy address of the current principal.
    pub fn principal(&self) -> Option<SocketAddr> {
        self.principal
    }

    /// Client-facing address of the current principal.
    pub fn principal_client_addr(&self) -> Option<SocketAddr> {
        self.principal
            .and_then(|p| self.servers.get(&p))
            .map(|info| info.client_addr)
    }

    /// Copy addresses of every registered server except the principal.
    pub fn backups(&self) -> Vec<SocketAddr> {
        self.servers
            .keys()
            .copied()
            .filter(|&addr| Some(addr) != self.principal)
            .collect()
    }

    /// Inserts or refreshes an entry, returning true if it was new.
    fn upsert(
        &mut self,
        copy_addr: SocketAddr,
        client_addr: SocketAddr,
        now: Instant,
    ) -> bool {
        self.servers
            .insert(
                copy_addr,
                RegisteredServer {
                    client_addr,
                    last_seen: now,
                },
            )
            .is_none()
    }

    /// Runs the election policy if there is no principal or the principal is
    /// gone, recording the winner. Returns the election to announce, if the
    /// principal changed.
    fn reelect_if_needed(&mut self) -> Option<Election> {
        if let Some(p) = self.principal {
            if self.servers.contains_key(&p) {
                return None;
            }
        }

        let old = self.principal;
        self.principal = elect(&self.servers, None);
        debug_assert_eq!(self.principal.is_none(), self.servers.is_empty());
        match self.principal {
            Some(principal) => Some(Election::Elected {
                principal,
                backups: self.backups(),
            }),
            None if old.is_some() => Some(Election::Vacant),
            None => None,
        }
    }

    /// Registers a server, or refreshes it if already known (overwriting its
    /// client address). Promotes it if there is no principal.
    pub fn register(
        &mut self,
        copy_addr: SocketAddr,
        client_addr: SocketAddr,
        now: Instant,
    ) -> (Role, Option<Election>) {
        self.upsert(copy_addr, client_addr, now);
        let election = if self.principal.is_none() {
            self.principal = Some(copy_addr);
            Some(Election::Elected {
                principal: copy_addr,
                backups: self.backups(),
            })
        } else {
            None
        };

        let role = if self.principal == Some(copy_addr) {
            Role::Principal
        } else {
            Role::Backup
        };
        (role, election)
    }

    /// Refreshes (or inserts) a server on heartbeat. Returns the current
    /// principal afterwards, which is the sender itself only if the registry
    /// was empty.
    pub fn heartbeat(
        &mut self,
        copy_addr: SocketAddr,
        client_addr: SocketAddr,
        now: Instant,
    ) -> (Option<SocketAddr>, Option<Election>) {
        let (_, election) = self.register(copy_addr, client_addr, now);
        (self.principal, election)
    }

    /// Removes a server. If it was the principal, elects a successor among
    /// the rest. Unknown addresses are an error and change nothing.
    pub fn deregister(
        &mut self,
        copy_addr: SocketAddr,
    ) -> Result<Option<Election>, RendezvousError> {
        if self.servers.remove(&copy_addr).is_none() {
            return Err(RendezvousError::msg(format!(
                "deregister of unknown server '{}'",
                copy_addr
            )));
        }
        Ok(self.reelect_if_needed())
    }

    /// Removes every server not heard from for more than `threshold`. If the
    /// principal was among them, elects once for the whole batch. Returns
    /// the evicted addresses and the election, if any.
    pub fn evict_stale(
        &mut self,
        now: Instant,
        threshold: Duration,
    ) -> (Vec<SocketAddr>, Option<Election>) {
        let evicted: Vec<SocketAddr> = self
            .servers
            .iter()
            .filter(|(_, info)| {
                now.saturating_duration_since(info.last_seen) > threshold
            })
            .map(|(&addr, _)| addr)
            .collect();
        if evicted.is_empty() {
            return (evicted, None);
        }

        for addr in &evicted {
            self.servers.remove(addr);
        }
        (evicted, self.reelect_if_needed())
    }
}
