//! Given/when step definitions for machine lifecycle behavioural scenarios.

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bollard::models::{ContainerCreateBody, ContainerCreateResponse, ContainerInspectResponse};
use bollard::query_parameters::CreateContainerOptions;
use cestx::broker::{AttemptTracker, Dispatcher, InboundMessage, RetryPolicy, encode};
use cestx::config::{AppConfig, StopRoutePolicy};
use cestx::contracts::{MachineEvent, MachineMessage};
use cestx::engine::{EngineFuture, SandboxEngine};
use cestx::model::{MachineStatus, NewMachine, Template};
use cestx::orchestrator::{Orchestrator, OrchestratorDeps};
use cestx::store::MachineRepository;
use mockall::mock;
use rstest_bdd_macros::{given, when};
use uuid::Uuid;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use super::state::{CONTAINER_ID, MachineLifecycleState, StepResult, TEMPLATE_ID, USER_ID, World};

mock! {
    Engine {}

    impl SandboxEngine for Engine {
        fn build_image<'a>(&'a self, tag: &str, context: Vec<u8>) -> EngineFuture<'a, ()>;
        fn create_container<'a>(
            &'a self,
            options: Option<CreateContainerOptions>,
            config: ContainerCreateBody,
        ) -> EngineFuture<'a, ContainerCreateResponse>;
        fn start_container<'a>(&'a self, container_id: &str) -> EngineFuture<'a, ()>;
        fn stop_container<'a>(&'a self, container_id: &str) -> EngineFuture<'a, ()>;
        fn remove_container<'a>(&'a self, container_id: &str) -> EngineFuture<'a, ()>;
        fn inspect_container<'a>(
            &'a self,
            container_id: &str,
        ) -> EngineFuture<'a, ContainerInspectResponse>;
    }
}

const ARTIFACT_KEY: &str = "templates/nginx.zip";

fn runtime() -> StepResult<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().map_err(|error| format!("failed to create tokio runtime: {error}"))
}

/// Engine double that succeeds at everything and counts what it was asked.
fn engine(world: &World) -> MockEngine {
    let calls = &world.calls;
    let mut engine = MockEngine::new();

    let on_build = Arc::clone(calls);
    engine.expect_build_image().returning(move |_, _| {
        on_build.built.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    });
    engine.expect_create_container().returning(|_, _| {
        Box::pin(async {
            Ok(ContainerCreateResponse {
                id: String::from(CONTAINER_ID),
                warnings: vec![],
            })
        })
    });
    engine
        .expect_start_container()
        .returning(|_| Box::pin(async { Ok(()) }));
    let on_stop = Arc::clone(calls);
    engine.expect_stop_container().returning(move |_| {
        on_stop.stopped.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    });
    let on_remove = Arc::clone(calls);
    engine.expect_remove_container().returning(move |_| {
        on_remove.removed.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Ok(()) })
    });
    engine
}

fn dispatcher(state: &MachineLifecycleState) -> StepResult<Dispatcher> {
    let world = state.world()?;
    let mut config = AppConfig::default();
    config.processing.stop_route_policy = state.policy.get().unwrap_or_default();

    let deps = OrchestratorDeps {
        machines: world.store.clone(),
        templates: world.store.clone(),
        cache: world.cache.clone(),
        artifacts: world.artifacts.clone(),
        engine: Arc::new(engine(&world)),
        publisher: world.publisher.clone(),
    };
    let attempts = AttemptTracker::new(
        world.cache.clone(),
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(1)),
        Duration::from_secs(60),
    );
    Ok(Dispatcher::new(
        "machine",
        Arc::new(Orchestrator::new(deps, &config)),
        attempts,
        Duration::from_secs(30),
    ))
}

fn handle(state: &MachineLifecycleState, message: &InboundMessage) -> StepResult<()> {
    let dispatcher = dispatcher(state)?;
    let disposition = runtime()?.block_on(dispatcher.dispatch(message));
    state.record(&[disposition]);
    Ok(())
}

fn machine_message(message: &MachineMessage) -> StepResult<InboundMessage> {
    encode(message)
        .map(InboundMessage::new)
        .map_err(|error| format!("failed to encode machine message: {error}"))
}

fn template_archive() -> StepResult<Vec<u8>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    writer
        .start_file("Dockerfile", SimpleFileOptions::default())
        .map_err(|error| format!("zip entry should start: {error}"))?;
    writer
        .write_all(b"FROM nginx:alpine\n")
        .map_err(|error| format!("zip entry should be written: {error}"))?;
    let cursor = writer
        .finish()
        .map_err(|error| format!("zip should finish: {error}"))?;
    Ok(cursor.into_inner())
}

fn seed_machine(state: &MachineLifecycleState, status: MachineStatus) -> StepResult<()> {
    let world = state.world()?;
    let now = chrono::Utc::now();
    let mut machine = NewMachine {
        id: Uuid::new_v4(),
        user_id: USER_ID,
        template_id: TEMPLATE_ID,
        name: String::from("nginx-seeded0"),
        port: 80,
        url: String::from("https://80-seeded.cestx.com"),
        credential: String::from("secret"),
        expires_at: now,
    }
    .into_running(String::from(CONTAINER_ID), None, now);
    machine.status = status;

    runtime()?
        .block_on(world.store.insert_machine(&machine))
        .map_err(|error| format!("failed to seed machine: {error}"))?;
    state.machine_id.set(machine.id);
    Ok(())
}

fn seeded_machine(state: &MachineLifecycleState) -> StepResult<Uuid> {
    state
        .machine_id
        .get()
        .ok_or_else(|| String::from("a machine should have been seeded"))
}

#[given("a published nginx template")]
fn published_nginx_template(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let world = machine_lifecycle_state.world()?;
    world
        .store
        .put_template(Template {
            id: TEMPLATE_ID,
            name: String::from("nginx"),
            description: String::from("static site"),
            artifact_key: String::from(ARTIFACT_KEY),
            user_id: USER_ID,
        })
        .map_err(|error| format!("failed to store template: {error}"))?;
    world
        .artifacts
        .put(ARTIFACT_KEY, template_archive()?)
        .map_err(|error| format!("failed to store artifact: {error}"))
}

#[given("a running machine")]
fn running_machine(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    seed_machine(machine_lifecycle_state, MachineStatus::Running)
}

#[given("a stopped machine")]
fn stopped_machine(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    seed_machine(machine_lifecycle_state, MachineStatus::Stopped)
}

#[given("the stop route policy is {policy}")]
fn stop_route_policy(
    machine_lifecycle_state: &MachineLifecycleState,
    policy: String,
) -> StepResult<()> {
    let parsed = match policy.as_str() {
        "retain" => StopRoutePolicy::Retain,
        "retract" => StopRoutePolicy::Retract,
        other => return Err(format!("unknown stop route policy {other}")),
    };
    machine_lifecycle_state.policy.set(parsed);
    Ok(())
}

#[when("a create message for the template is handled with port {port}")]
fn create_message_handled(
    machine_lifecycle_state: &MachineLifecycleState,
    port: u16,
) -> StepResult<()> {
    let message = machine_message(&MachineMessage::create(TEMPLATE_ID, USER_ID, Some(port)))?
        .with_message_id("bdd-create-1");
    machine_lifecycle_state.create_message.set(message.clone());
    handle(machine_lifecycle_state, &message)
}

#[when("the same create message is redelivered")]
fn same_create_redelivered(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let mut message = machine_lifecycle_state
        .create_message
        .get()
        .ok_or_else(|| String::from("a create message should have been handled"))?;
    message.redelivered = true;
    handle(machine_lifecycle_state, &message)
}

#[when("a create message for an unknown template is handled")]
fn create_for_unknown_template(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let message = machine_message(&MachineMessage::create(Uuid::new_v4(), USER_ID, None))?;
    handle(machine_lifecycle_state, &message)
}

#[when("a {event} message for the machine is handled")]
fn lifecycle_message_handled(
    machine_lifecycle_state: &MachineLifecycleState,
    event: String,
) -> StepResult<()> {
    let kind = match event.as_str() {
        "start" => MachineEvent::Start,
        "stop" => MachineEvent::Stop,
        "delete" => MachineEvent::Delete,
        other => return Err(format!("unsupported lifecycle event {other}")),
    };
    let machine_id = seeded_machine(machine_lifecycle_state)?;
    let message = machine_message(&MachineMessage::targeting(kind, machine_id))?;
    handle(machine_lifecycle_state, &message)
}

#[when("two delete messages for the machine are handled concurrently")]
fn concurrent_deletes(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let machine_id = seeded_machine(machine_lifecycle_state)?;
    let first = machine_message(&MachineMessage::targeting(MachineEvent::Delete, machine_id))?
        .with_message_id("bdd-delete-1");
    let second = machine_message(&MachineMessage::targeting(MachineEvent::Delete, machine_id))?
        .with_message_id("bdd-delete-2");
    let dispatcher = dispatcher(machine_lifecycle_state)?;

    let (left, right) = runtime()?.block_on(async {
        tokio::join!(dispatcher.dispatch(&first), dispatcher.dispatch(&second))
    });
    machine_lifecycle_state.record(&[left, right]);
    Ok(())
}

#[when("an undecodable machine message is handled")]
fn undecodable_message(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    handle(
        machine_lifecycle_state,
        &InboundMessage::new(b"{\"event\":\"machine.reboot\"}".to_vec()),
    )
}

#[when("a start message for an unknown machine is handled")]
fn start_for_unknown_machine(machine_lifecycle_state: &MachineLifecycleState) -> StepResult<()> {
    let message = machine_message(&MachineMessage::targeting(MachineEvent::Start, Uuid::new_v4()))?;
    handle(machine_lifecycle_state, &message)
}
