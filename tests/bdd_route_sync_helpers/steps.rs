//! Given/when step definitions for route synchronisation scenarios.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bollard::models::{
    ContainerCreateBody, ContainerCreateResponse, ContainerInspectResponse, EndpointSettings,
    NetworkSettings,
};
use bollard::query_parameters::CreateContainerOptions;
use cestx::broker::{AttemptTracker, Dispatcher, InboundMessage, RetryPolicy, encode};
use cestx::cache::MemoryKeyValue;
use cestx::config::AppConfig;
use cestx::contracts::{RouteEvent, RouteMessage};
use cestx::engine::{EngineFuture, SandboxEngine};
use cestx::proxy::HttpProxyClient;
use cestx::router::RouteSynchronizer;
use mockall::mock;
use rstest_bdd_macros::{given, when};
use wiremock::matchers::any;
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::state::{MACHINE_ID, RouteSyncState, StepResult, UNREACHABLE_PROXY, USER_ID};

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

fn inspected(address: &str) -> ContainerInspectResponse {
    let networks = HashMap::from([(
        String::from("bridge"),
        EndpointSettings {
            ip_address: Some(address.to_owned()),
            ..EndpointSettings::default()
        },
    )]);
    ContainerInspectResponse {
        network_settings: Some(NetworkSettings {
            networks: Some(networks),
            ..NetworkSettings::default()
        }),
        ..ContainerInspectResponse::default()
    }
}

/// Engine double reporting the scenario's sandbox address, if it has one.
fn engine(state: &RouteSyncState) -> MockEngine {
    let mut engine = MockEngine::new();
    if let Some(address) = state.address.get() {
        engine.expect_inspect_container().returning(move |_| {
            let response = inspected(&address);
            Box::pin(async move { Ok(response) })
        });
    }
    engine
}

fn dispatcher(state: &RouteSyncState, queue: &'static str) -> StepResult<Dispatcher> {
    let mut config = AppConfig::default();
    config.proxy.api_url = state.proxy_url.get().unwrap_or_default();
    config.proxy.request_timeout_secs = 2;
    config.processing.address_poll_attempts = 3;
    config.processing.backoff_initial_ms = 1;
    config.processing.backoff_max_ms = 2;

    let proxy = HttpProxyClient::new(
        &config.proxy.api_url,
        &config.proxy.provider,
        config.proxy.request_timeout(),
    )
    .map_err(|error| format!("failed to build proxy client: {error}"))?;
    let synchronizer = RouteSynchronizer::new(Arc::new(engine(state)), Arc::new(proxy), &config);
    let attempts = AttemptTracker::new(
        Arc::new(MemoryKeyValue::new()),
        RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(1)),
        Duration::from_secs(60),
    );
    Ok(Dispatcher::new(
        queue,
        Arc::new(synchronizer),
        attempts,
        Duration::from_secs(10),
    ))
}

/// Start a proxy stub answering every request with `status`.
fn start_proxy(state: &RouteSyncState, status: u16) -> StepResult<()> {
    let runtime = state.runtime()?;
    let server = runtime.block_on(async {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    });
    state.proxy_url.set(server.uri());
    state.server.set(Arc::new(server));
    Ok(())
}

#[given("a sandbox with address {address}")]
fn sandbox_with_address(route_sync_state: &RouteSyncState, address: String) -> StepResult<()> {
    route_sync_state.address.set(address);
    Ok(())
}

#[given("a sandbox without an address")]
fn sandbox_without_address(route_sync_state: &RouteSyncState) -> StepResult<()> {
    route_sync_state.address.set(String::new());
    Ok(())
}

#[given("the proxy accepts configuration")]
fn proxy_accepts_configuration(route_sync_state: &RouteSyncState) -> StepResult<()> {
    start_proxy(route_sync_state, 200)
}

#[given("the proxy answers {status} to every request")]
fn proxy_answers_status(route_sync_state: &RouteSyncState, status: u16) -> StepResult<()> {
    start_proxy(route_sync_state, status)
}

#[given("the proxy is unreachable")]
fn proxy_is_unreachable(route_sync_state: &RouteSyncState) -> StepResult<()> {
    route_sync_state
        .proxy_url
        .set(String::from(UNREACHABLE_PROXY));
    Ok(())
}

#[when("a {event} message for port {port} is handled")]
fn route_message_handled(
    route_sync_state: &RouteSyncState,
    event: String,
    port: u16,
) -> StepResult<()> {
    let kind = RouteEvent::ALL
        .into_iter()
        .find(|candidate| candidate.as_str() == event)
        .ok_or_else(|| format!("unknown route event {event}"))?;
    let body = encode(&RouteMessage::new(kind, MACHINE_ID, USER_ID, port))
        .map_err(|error| format!("failed to encode route message: {error}"))?;

    let dispatcher = dispatcher(route_sync_state, kind.as_str())?;
    let disposition = route_sync_state
        .runtime()?
        .block_on(dispatcher.dispatch(&InboundMessage::new(body)));
    route_sync_state.disposition.set(disposition);
    Ok(())
}
