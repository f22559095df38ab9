//! Rendezvous: a directory service that tracks a pool of interchangeable
//! worker servers and designates one of them as principal, plus the worker
//! side that heartbeats and replicates the principal's snapshot.

#[macro_use]
mod utils;

mod client;
mod directory;
mod protocol;
mod worker;

// Below are exported for use by the binaries and outside crates.

pub use crate::utils::{logger_init, RendezvousError, Timer, ME};
pub use crate::utils::MAX_DATAGRAM_SIZE;

pub use crate::protocol::{
    encode_opt_addr, parse_addr, parse_opt_addr, Envelope, HeartbeatContent,
    MsgType, RegisterContent,
};

pub use crate::directory::{
    elect, DirectoryConfig, DirectoryService, Election, RegisteredServer,
    Registry, Role,
};

pub use crate::worker::{
    LoggingSession, PrincipalTracker, ReplState, SessionHandler, Snapshot,
    SnapshotStore, TrackerAction, WorkerConfig, WorkerNode,
};

pub use crate::client::DirectoryClient;
