//! Service entry points for cestx commands.
//!
//! Each function here wires configuration to concrete clients and runs one
//! command: [`run_orchestrator`], [`run_router`], and
//! [`publish_machine_event`]. They accept library-owned types (not clap
//! types), return [`crate::error::Result`], and never print or exit, so the
//! binary stays a thin adapter.

use std::sync::Arc;

use lapin::Connection;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artifacts::S3ArtifactStore;
use crate::broker::{
    AmqpPublisher, AttemptTracker, Dispatcher, MessageHandler, connect, consume, declare_topology,
    publish_json,
};
use crate::cache::{KeyValueStore, MemoryKeyValue, RedisKeyValue};
use crate::config::{AppConfig, CacheConfig};
use crate::contracts::{MachineEvent, MachineMessage, RouteEvent};
use crate::engine::{EngineConnector, SocketResolver};
use crate::error::{BrokerError, Result as CestxResult};
use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::proxy::HttpProxyClient;
use crate::router::RouteSynchronizer;
use crate::store::PgStore;

/// Reply code sent when closing the broker connection on shutdown.
const CLOSE_NORMAL: u16 = 200;

/// Queue names served by the orchestrator.
#[must_use]
pub fn machine_queues() -> Vec<&'static str> {
    MachineEvent::ALL.iter().map(|event| event.as_str()).collect()
}

/// Queue names served by the route synchronizer.
#[must_use]
pub fn route_queues() -> Vec<&'static str> {
    RouteEvent::ALL.iter().map(|event| event.as_str()).collect()
}

/// Key-value store for the configured cache, or an in-process one when no
/// URL is set.
///
/// # Errors
///
/// Returns `CacheError::ConnectionFailed` if the configured cache cannot be
/// reached.
pub async fn build_cache(config: &CacheConfig) -> CestxResult<Arc<dyn KeyValueStore>> {
    let Some(url) = config.url.as_deref().filter(|url| !url.is_empty()) else {
        warn!("no cache url configured, using an in-process store");
        return Ok(Arc::new(MemoryKeyValue::new()));
    };
    Ok(Arc::new(RedisKeyValue::connect(url).await?))
}

/// Run the Machine Orchestrator until `shutdown` fires.
///
/// Connects to the store, cache, object store, engine, and broker, declares
/// both exchanges, and consumes the four machine queues.
///
/// # Errors
///
/// Returns the first connection or consumer failure.
pub async fn run_orchestrator(config: &AppConfig, shutdown: &CancellationToken) -> CestxResult<()> {
    let store = Arc::new(
        PgStore::connect(config.database.require_url()?, config.database.max_connections).await?,
    );
    let cache = build_cache(&config.cache).await?;
    let artifacts = Arc::new(S3ArtifactStore::connect(&config.object_store).await);
    let env = mockable::DefaultEnv::new();
    let engine = EngineConnector::connect_and_verify_async(
        config.engine_socket.as_deref(),
        &SocketResolver::new(&env),
    )
    .await?;

    let connection = connect(&config.broker.url, &config.processing.retry_policy()).await?;
    let publisher_channel = connection.create_channel().await.map_err(channel_failed)?;
    declare_topology(&publisher_channel, &config.broker.route_exchange, &route_queues()).await?;
    let publisher = Arc::new(AmqpPublisher::new(publisher_channel).await?);

    let deps = OrchestratorDeps {
        machines: store.clone(),
        templates: store,
        cache: Arc::clone(&cache),
        artifacts,
        engine: Arc::new(engine),
        publisher,
    };
    let handler: Arc<dyn MessageHandler> = Arc::new(Orchestrator::new(deps, config));
    info!("machine orchestrator starting");

    let outcome = serve(
        &connection,
        config,
        &config.broker.machine_exchange,
        &machine_queues(),
        &handler,
        &cache,
        shutdown,
    )
    .await;
    close(&connection).await;
    outcome
}

/// Run the Route Synchronizer until `shutdown` fires.
///
/// # Errors
///
/// Returns the first connection or consumer failure.
pub async fn run_router(config: &AppConfig, shutdown: &CancellationToken) -> CestxResult<()> {
    let cache = build_cache(&config.cache).await?;
    let env = mockable::DefaultEnv::new();
    let engine = EngineConnector::connect_and_verify_async(
        config.engine_socket.as_deref(),
        &SocketResolver::new(&env),
    )
    .await?;
    let proxy = HttpProxyClient::new(
        &config.proxy.api_url,
        &config.proxy.provider,
        config.proxy.request_timeout(),
    )?;
    let handler: Arc<dyn MessageHandler> = Arc::new(RouteSynchronizer::new(
        Arc::new(engine),
        Arc::new(proxy),
        config,
    ));

    let connection = connect(&config.broker.url, &config.processing.retry_policy()).await?;
    info!(base_domain = %config.proxy.base_domain, "route synchronizer starting");

    let outcome = serve(
        &connection,
        config,
        &config.broker.route_exchange,
        &route_queues(),
        &handler,
        &cache,
        shutdown,
    )
    .await;
    close(&connection).await;
    outcome
}

/// Validate and publish one machine message.
///
/// # Errors
///
/// Returns `ProcessingError::MalformedMessage` before connecting when the
/// message lacks a field its event needs, and broker errors otherwise.
pub async fn publish_machine_event(config: &AppConfig, message: &MachineMessage) -> CestxResult<()> {
    message.validate()?;

    let connection = connect(&config.broker.url, &config.processing.retry_policy()).await?;
    let channel = connection.create_channel().await.map_err(channel_failed)?;
    declare_topology(&channel, &config.broker.machine_exchange, &machine_queues()).await?;
    let publisher = AmqpPublisher::new(channel).await?;

    let outcome = publish_json(
        &publisher,
        &config.broker.machine_exchange,
        message.event.as_str(),
        message,
    )
    .await;
    close(&connection).await;
    outcome?;
    info!(event = %message.event, "published machine event");
    Ok(())
}

/// Declare `exchange` with one queue per key and consume every queue with
/// `handler` until `shutdown` fires or a consumer fails.
async fn serve(
    connection: &Connection,
    config: &AppConfig,
    exchange: &str,
    queues: &[&'static str],
    handler: &Arc<dyn MessageHandler>,
    attempts_store: &Arc<dyn KeyValueStore>,
    shutdown: &CancellationToken,
) -> CestxResult<()> {
    let topology = connection.create_channel().await.map_err(channel_failed)?;
    declare_topology(&topology, exchange, queues).await?;

    let mut consumers = JoinSet::new();
    for queue in queues {
        let channel = connection.create_channel().await.map_err(channel_failed)?;
        let attempts = AttemptTracker::new(
            Arc::clone(attempts_store),
            config.processing.retry_policy(),
            config.cache.ledger_ttl(),
        );
        let dispatcher = Dispatcher::new(
            *queue,
            Arc::clone(handler),
            attempts,
            config.processing.handler_timeout(),
        );
        consumers.spawn(consume(
            channel,
            dispatcher,
            config.broker.prefetch,
            shutdown.clone(),
        ));
    }

    let mut first_failure = None;
    while let Some(joined) = consumers.join_next().await {
        let failure = match joined {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => error,
            Err(panic) => BrokerError::ConsumeFailed {
                queue: String::from(exchange),
                message: panic.to_string(),
            },
        };
        warn!(error = %failure, "consumer stopped, shutting down the others");
        shutdown.cancel();
        first_failure.get_or_insert(failure);
    }

    if let Some(failure) = first_failure {
        return Err(failure.into());
    }
    info!(exchange, "consumers stopped");
    Ok(())
}

fn channel_failed(error: lapin::Error) -> BrokerError {
    BrokerError::TopologyFailed {
        message: format!("failed to open channel: {error}"),
    }
}

async fn close(connection: &Connection) {
    if let Err(error) = connection.close(CLOSE_NORMAL, "shutdown").await {
        warn!(%error, "broker connection did not close cleanly");
    }
}
