//! Behavioural test helpers for route synchronisation.

mod assertions;
mod state;
mod steps;

pub use state::{RouteSyncState, route_sync_state};
