//! Worker server side: heartbeating, principal tracking, snapshot
//! replication in both directions, and the client session seam.

mod copyserver;
mod heartbeat;
mod node;
mod replicator;
mod session;
mod snapshot;

pub use heartbeat::{PrincipalTracker, TrackerAction};
pub use node::{WorkerConfig, WorkerNode};
pub use replicator::ReplState;
pub use session::{LoggingSession, SessionHandler};
pub use snapshot::{Snapshot, SnapshotStore};

pub(crate) use copyserver::CopyServer;
pub(crate) use heartbeat::{HeartbeatClient, HeartbeatParams};
pub(crate) use replicator::{BackupReplicator, ReplParams};
pub(crate) use session::SessionListener;
