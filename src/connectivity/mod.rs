//! Device/server reachability tracking and base endpoint selection.

pub mod endpoints;
pub mod monitor;
pub mod state;

pub use endpoints::{EndpointRef, EndpointRing};
pub use monitor::ConnectivityMonitor;
pub use state::{ChangeReason, ConnectivityEvent, ConnectivityState};
