//! Then-step assertions for machine lifecycle behavioural scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};

use cestx::broker::Disposition;
use cestx::contracts::{RouteEvent, RouteMessage, generate_subdomain};
use cestx::model::{Machine, MachineStatus};
use rstest_bdd_macros::then;

use super::state::{EngineCalls, MachineLifecycleState, StepResult, USER_ID};

fn dispositions(state: &MachineLifecycleState) -> StepResult<Vec<Disposition>> {
    let handled = state.dispositions.get().unwrap_or_default();
    if handled.is_empty() {
        return Err(String::from("no message was handled"));
    }
    Ok(handled)
}

fn stored_machines(state: &MachineLifecycleState) -> StepResult<Vec<Machine>> {
    state
        .world()?
        .store
        .machines()
        .map_err(|error| format!("failed to list machines: {error}"))
}

fn only_machine(state: &MachineLifecycleState) -> StepResult<Machine> {
    let mut machines = stored_machines(state)?;
    let found = machines.len();
    match (machines.pop(), found) {
        (Some(machine), 1) => Ok(machine),
        _ => Err(format!("expected exactly one stored machine, found {found}")),
    }
}

fn route_events(state: &MachineLifecycleState, event: RouteEvent) -> StepResult<Vec<RouteMessage>> {
    state
        .world()?
        .publisher
        .published_with_key(event.as_str())
        .iter()
        .map(|published| {
            RouteMessage::decode(&published.payload)
                .map_err(|error| format!("published route message did not decode: {error}"))
        })
        .collect()
}

fn expect_calls(
    state: &MachineLifecycleState,
    what: &str,
    counter: fn(&EngineCalls) -> &AtomicUsize,
    expected: usize,
) -> StepResult<()> {
    let world = state.world()?;
    let actual = counter(&world.calls).load(Ordering::SeqCst);
    if actual == expected {
        return Ok(());
    }
    Err(format!("expected the engine to have {what} {expected} time(s), got {actual}"))
}

fn expect_route_events(
    state: &MachineLifecycleState,
    event: RouteEvent,
    count: usize,
    port: Option<u16>,
) -> StepResult<()> {
    let events = route_events(state, event)?;
    if events.len() != count {
        return Err(format!("expected {count} {event} event(s), got {}", events.len()));
    }
    if let Some(wrong) = port.and_then(|p| events.iter().find(|message| message.port != p)) {
        return Err(format!("expected port {port:?}, got {}", wrong.port));
    }
    Ok(())
}

#[then("every message is acknowledged")]
fn every_message_acknowledged(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let handled = dispositions(machine_lifecycle_state)?;
    if handled.iter().all(|disposition| *disposition == Disposition::Ack) {
        return Ok(());
    }
    Err(format!("expected only acknowledgements, got {handled:?}"))
}

#[then("the message is rejected")]
fn message_rejected(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let handled = dispositions(machine_lifecycle_state)?;
    if handled == [Disposition::Reject] {
        return Ok(());
    }
    Err(format!("expected a single rejection, got {handled:?}"))
}

#[then("one delete is acknowledged and the other is rejected")]
fn one_ack_one_reject(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let handled = dispositions(machine_lifecycle_state)?;
    let acks = handled.iter().filter(|d| **d == Disposition::Ack).count();
    let rejects = handled.iter().filter(|d| **d == Disposition::Reject).count();
    if handled.len() == 2 && acks == 1 && rejects == 1 {
        return Ok(());
    }
    Err(format!("expected one ack and one reject, got {handled:?}"))
}

#[then("exactly one running machine is stored")]
fn one_running_machine(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let machine = only_machine(machine_lifecycle_state)?;
    if machine.status != MachineStatus::Running {
        return Err(format!("expected a running machine, got {}", machine.status));
    }
    if machine.sandbox_ref.as_deref().is_none_or(str::is_empty) {
        return Err(String::from("expected a sandbox reference on the running machine"));
    }
    Ok(())
}

#[then("no machine is stored")]
fn no_machine_stored(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let machines = stored_machines(machine_lifecycle_state)?;
    if machines.is_empty() {
        return Ok(());
    }
    Err(format!("expected no machines, found {}", machines.len()))
}

#[then("the machine is stopped")]
fn machine_is_stopped(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let machine = only_machine(machine_lifecycle_state)?;
    if machine.status == MachineStatus::Stopped {
        return Ok(());
    }
    Err(format!("expected a stopped machine, got {}", machine.status))
}

#[then("the machine url uses the subdomain for port {port}")]
fn machine_url_uses_subdomain(
    machine_lifecycle_state: &MachineLifecycleState,
    port: u16,
) -> StepResult<()> {
    let machine = only_machine(machine_lifecycle_state)?;
    let subdomain = generate_subdomain(machine.id, USER_ID, port, "cestx.com");
    let expected = format!("https://{subdomain}");
    if machine.url == expected {
        return Ok(());
    }
    Err(format!("expected url {expected}, got {}", machine.url))
}

#[then("the machine record was deleted once")]
fn machine_record_deleted_once(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let world = machine_lifecycle_state.world()?;
    let deletions = world.store.deletion_count();
    if deletions == 1 && stored_machines(machine_lifecycle_state)?.is_empty() {
        return Ok(());
    }
    Err(format!("expected exactly one record deletion, got {deletions}"))
}

#[then("the engine built {count} image")]
fn engine_built(machine_lifecycle_state: &MachineLifecycleState, count: usize) -> StepResult<()> {
    expect_calls(machine_lifecycle_state, "built", |calls| &calls.built, count)
}

#[then("the engine stopped {count} sandboxes")]
fn engine_stopped(machine_lifecycle_state: &MachineLifecycleState, count: usize) -> StepResult<()> {
    expect_calls(machine_lifecycle_state, "stopped", |calls| &calls.stopped, count)
}

#[then("the engine removed {count} sandbox")]
fn engine_removed(machine_lifecycle_state: &MachineLifecycleState, count: usize) -> StepResult<()> {
    expect_calls(machine_lifecycle_state, "removed", |calls| &calls.removed, count)
}

#[then("{count} route.create event with port {port} is published")]
fn route_create_published(
    machine_lifecycle_state: &MachineLifecycleState,
    count: usize,
    port: u16,
) -> StepResult<()> {
    expect_route_events(machine_lifecycle_state, RouteEvent::Create, count, Some(port))
}

#[then("{count} route.create events with port {port} are published")]
fn route_creates_published(
    machine_lifecycle_state: &MachineLifecycleState,
    count: usize,
    port: u16,
) -> StepResult<()> {
    expect_route_events(machine_lifecycle_state, RouteEvent::Create, count, Some(port))
}

#[then("{count} route.delete event is published")]
fn route_delete_published(
    machine_lifecycle_state: &MachineLifecycleState,
    count: usize,
) -> StepResult<()> {
    expect_route_events(machine_lifecycle_state, RouteEvent::Delete, count, None)
}

#[then("no route events are published")]
fn no_route_events(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let published = machine_lifecycle_state.world()?.publisher.published();
    if published.is_empty() {
        return Ok(());
    }
    Err(format!("expected no route events, got {}", published.len()))
}
