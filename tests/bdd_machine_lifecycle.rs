//! Behavioural tests for machine lifecycle handling.

mod bdd_machine_lifecycle_helpers;

pub use bdd_machine_lifecycle_helpers::{MachineLifecycleState, machine_lifecycle_state};
use rstest_bdd_macros::scenario;

#[scenario(
    path = "tests/features/machine_lifecycle.feature",
    name = "Creating a machine announces one route on the requested port"
)]
fn creating_a_machine_announces_one_route(machine_lifecycle_state: MachineLifecycleState) {
    let _ = machine_lifecycle_state;
}

#[scenario(
    path = "tests/features/machine_lifecycle.feature",
    name = "A redelivered create does not launch a second sandbox"
)]
fn redelivered_create_does_not_launch_a_second_sandbox(
    machine_lifecycle_state: MachineLifecycleState,
) {
    let _ = machine_lifecycle_state;
}

#[scenario(
    path = "tests/features/machine_lifecycle.feature",
    name = "A create for an unknown template is dead-lettered"
)]
fn create_for_unknown_template_is_dead_lettered(machine_lifecycle_state: MachineLifecycleState) {
    let _ = machine_lifecycle_state;
}

#[scenario(
    path = "tests/features/machine_lifecycle.feature",
    name = "Two concurrent deletes remove the machine once"
)]
fn two_concurrent_deletes_remove_the_machine_once(machine_lifecycle_state: MachineLifecycleState) {
    let _ = machine_lifecycle_state;
}

#[scenario(
    path = "tests/features/machine_lifecycle.feature",
    name = "Deleting a stopped machine does not stop its sandbox"
)]
fn deleting_a_stopped_machine_does_not_stop_its_sandbox(
    machine_lifecycle_state: MachineLifecycleState,
) {
    let _ = machine_lifecycle_state;
}

#[scenario(
    path = "tests/features/machine_lifecycle.feature",
    name = "Stopping keeps the route under the retain policy"
)]
fn stopping_keeps_the_route_under_retain(machine_lifecycle_state: MachineLifecycleState) {
    let _ = machine_lifecycle_state;
}

#[scenario(
    path = "tests/features/machine_lifecycle.feature",
    name = "Stopping withdraws the route under the retract policy"
)]
fn stopping_withdraws_the_route_under_retract(machine_lifecycle_state: MachineLifecycleState) {
    let _ = machine_lifecycle_state;
}

#[scenario(
    path = "tests/features/machine_lifecycle.feature",
    name = "An undecodable machine message is dead-lettered"
)]
fn undecodable_machine_message_is_dead_lettered(machine_lifecycle_state: MachineLifecycleState) {
    let _ = machine_lifecycle_state;
}

#[scenario(
    path = "tests/features/machine_lifecycle.feature",
    name = "Starting an unknown machine is dead-lettered"
)]
fn starting_an_unknown_machine_is_dead_lettered(machine_lifecycle_state: MachineLifecycleState) {
    let _ = machine_lifecycle_state;
}
