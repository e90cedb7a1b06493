//! Machine Orchestrator.
//!
//! Consumes machine lifecycle messages and drives the sandbox engine, the
//! machine store, and the route event stream. Every collaborator is injected
//! through [`OrchestratorDeps`], so the same handler runs against Postgres,
//! Redis, S3, and Docker in production and against in-process doubles in
//! tests.
//!
//! Create is guarded by a dedup ledger keyed by the message's publisher id,
//! when it has one; start, stop, and delete hold a short-lived per-machine
//! lock for the duration of the transition.

mod create;
mod lifecycle;
mod lock;

use std::sync::Arc;

use tracing::{Instrument, info_span};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::broker::{HandlerFuture, InboundMessage, MessageHandler, Publisher, publish_json};
use crate::cache::KeyValueStore;
use crate::config::{AppConfig, CacheConfig, ProcessingConfig, ProxyConfig, SandboxConfig};
use crate::contracts::{MachineCommand, MachineMessage, RouteEvent, RouteMessage};
use crate::engine::SandboxEngine;
use crate::error::ProcessingError;
use crate::model::Machine;
use crate::store::{MachineRepository, TemplateRepository};

pub use lock::MachineLock;

/// External collaborators used by the orchestrator.
#[derive(Clone)]
pub struct OrchestratorDeps {
    /// Machine records.
    pub machines: Arc<dyn MachineRepository>,
    /// Template records.
    pub templates: Arc<dyn TemplateRepository>,
    /// Template cache, dedup ledger, and machine locks.
    pub cache: Arc<dyn KeyValueStore>,
    /// Template artifacts.
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Sandbox engine.
    pub engine: Arc<dyn SandboxEngine>,
    /// Route event publisher.
    pub publisher: Arc<dyn Publisher>,
}

/// Settings the orchestrator reads from configuration.
#[derive(Debug, Clone)]
struct Settings {
    sandbox: SandboxConfig,
    proxy: ProxyConfig,
    cache: CacheConfig,
    processing: ProcessingConfig,
    route_exchange: String,
}

/// Machine lifecycle handler.
pub struct Orchestrator {
    deps: OrchestratorDeps,
    settings: Settings,
}

impl Orchestrator {
    /// Create an orchestrator over `deps` using the relevant `config` sections.
    #[must_use]
    pub fn new(deps: OrchestratorDeps, config: &AppConfig) -> Self {
        Self {
            deps,
            settings: Settings {
                sandbox: config.sandbox.clone(),
                proxy: config.proxy.clone(),
                cache: config.cache.clone(),
                processing: config.processing.clone(),
                route_exchange: config.broker.route_exchange.clone(),
            },
        }
    }

    /// Decode, validate, and execute one machine message.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` for undecodable or incomplete payloads, and
    /// whatever the executed operation reports otherwise.
    pub async fn handle_message(&self, message: &InboundMessage) -> Result<(), ProcessingError> {
        let command = MachineMessage::decode(&message.body)?.validate()?;
        let span = info_span!("machine", event = %command.event());
        self.execute(command, message.request_id())
            .instrument(span)
            .await
    }

    /// Execute an already validated command.
    ///
    /// `request_id` is the originating message's publisher-assigned id, if
    /// it had one; only create uses it.
    ///
    /// # Errors
    ///
    /// Returns the failure reported by the executed operation.
    pub async fn execute(
        &self,
        command: MachineCommand,
        request_id: Option<&str>,
    ) -> Result<(), ProcessingError> {
        match command {
            MachineCommand::Create {
                template_id,
                user_id,
                port,
            } => self
                .create(request_id, template_id, user_id, port)
                .await
                .map(|_| ()),
            MachineCommand::Start { machine_id } => self.start(machine_id).await,
            MachineCommand::Stop { machine_id } => self.stop(machine_id).await,
            MachineCommand::Delete { machine_id } => self.delete(machine_id).await,
        }
    }

    async fn publish_route(&self, event: RouteEvent, machine: &Machine) -> Result<(), ProcessingError> {
        let message = RouteMessage::new(event, machine.id, machine.user_id, machine.port);
        publish_json(
            self.deps.publisher.as_ref(),
            &self.settings.route_exchange,
            event.as_str(),
            &message,
        )
        .await?;
        tracing::debug!(machine_id = %machine.id, route_id = %message.route_id, %event, "published route event");
        Ok(())
    }

    async fn load_machine(&self, machine_id: Uuid) -> Result<Machine, ProcessingError> {
        self.deps
            .machines
            .find_machine(machine_id)
            .await?
            .ok_or(ProcessingError::NotFound {
                entity: "machine",
                id: machine_id,
            })
    }
}

impl MessageHandler for Orchestrator {
    fn handle<'a>(&'a self, message: &'a InboundMessage) -> HandlerFuture<'a> {
        Box::pin(self.handle_message(message))
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
