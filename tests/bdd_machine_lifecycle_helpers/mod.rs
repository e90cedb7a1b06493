//! Behavioural step helpers for machine lifecycle scenarios.

mod assertions;
mod state;
mod steps;

pub use state::{MachineLifecycleState, machine_lifecycle_state};
