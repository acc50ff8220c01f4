//! Kubernetes connectivity: cluster clients, watch sessions and the change
//! detection that feeds the rest of the daemon.

pub mod client;
pub mod diff;
mod error;
mod event;
mod watcher;

pub use error::WatchError;
pub use event::EventKind;
pub use event::NodeEvent;
pub use event::NodeEventHandler;
pub use event::PodEvent;
pub use event::PodEventHandler;
pub use event::PodRef;
pub use event::ALL_FIELDS;
pub use watcher::FleetWatcher;
pub use watcher::WatchConfig;
