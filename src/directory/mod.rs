//! Directory service: worker registry, principal election, staleness
//! monitoring and principal-change notifications.

mod dirsvc;
mod monitor;
mod notifier;
mod registry;

pub use dirsvc::{DirectoryConfig, DirectoryService};
pub use registry::{elect, Election, RegisteredServer, Registry, Role};

pub(crate) use monitor::StalenessMonitor;
pub(crate) use notifier::PrincipalNotifier;
