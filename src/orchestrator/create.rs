//! Machine creation.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::Orchestrator;
use crate::artifacts::TemplateWorkspace;
use crate::cache::{create_ledger_key, template_key};
use crate::contracts::{RouteEvent, generate_subdomain, sandbox_name};
use crate::engine::{EngineConnector, SandboxSpec};
use crate::error::{ArtifactError, ConcurrencyError, ProcessingError};
use crate::model::{Machine, NewMachine, Template, generate_credential, generate_machine_name};

/// Ledger value held while a create is in progress.
const LEDGER_PENDING: &str = "pending";

/// How long a pending claim outlives the handler deadline.
const CLAIM_GRACE: Duration = Duration::from_secs(1);

impl Orchestrator {
    /// Provision a machine and announce its route.
    ///
    /// `message_id` is the publisher-assigned id of the originating message.
    /// When present, the first delivery claims the dedup ledger and
    /// provisions; a redelivery of a completed create only re-publishes
    /// `route.create` for the recorded machine. Without one, every delivery
    /// provisions, since identical payloads may be distinct requests.
    ///
    /// The pending claim expires shortly after the handler deadline, so a
    /// create abandoned mid-provision does not block its redelivery.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing template or artifact, and a transient
    /// failure for engine, store, cache, or broker errors or when another
    /// delivery of the same request holds the ledger.
    pub async fn create(
        &self,
        message_id: Option<&str>,
        template_id: Uuid,
        user_id: Uuid,
        port: Option<u16>,
    ) -> Result<Uuid, ProcessingError> {
        let Some(request_id) = message_id else {
            let machine = self.provision(template_id, user_id, port).await?;
            return self.announce(&machine).await;
        };

        let ledger = create_ledger_key(request_id);
        let claim_ttl = self.settings.processing.handler_timeout().saturating_add(CLAIM_GRACE);
        if !self
            .deps
            .cache
            .set_if_absent(&ledger, LEDGER_PENDING, claim_ttl)
            .await?
        {
            return self.resume_create(&ledger, request_id).await;
        }

        let machine = match self.provision(template_id, user_id, port).await {
            Ok(machine) => machine,
            Err(failure) => {
                if let Err(error) = self.deps.cache.delete(&ledger).await {
                    warn!(%error, "failed to release create ledger claim");
                }
                return Err(failure);
            }
        };

        if let Err(error) = self
            .deps
            .cache
            .set(&ledger, &machine.id.to_string(), self.settings.cache.ledger_ttl())
            .await
        {
            warn!(machine_id = %machine.id, %error, "failed to record create outcome in ledger");
        }
        self.announce(&machine).await
    }

    async fn announce(&self, machine: &Machine) -> Result<Uuid, ProcessingError> {
        self.publish_route(RouteEvent::Create, machine).await?;
        info!(
            machine_id = %machine.id,
            user_id = %machine.user_id,
            url = %machine.url,
            "machine created"
        );
        Ok(machine.id)
    }

    async fn resume_create(&self, ledger: &str, request_id: &str) -> Result<Uuid, ProcessingError> {
        let recorded = self.deps.cache.get(ledger).await?;
        let Some(value) = recorded else {
            return Err(ProcessingError::transient("create ledger entry expired while checking"));
        };
        if value == LEDGER_PENDING {
            return Err(ConcurrencyError::CreateInProgress {
                key: request_id.to_owned(),
            }
            .into());
        }

        let machine_id = Uuid::parse_str(&value)
            .map_err(|error| ProcessingError::transient(format!("unreadable ledger entry: {error}")))?;
        let Some(machine) = self.deps.machines.find_machine(machine_id).await? else {
            info!(%machine_id, "create already completed and machine since deleted");
            return Ok(machine_id);
        };
        info!(%machine_id, "create already completed, re-publishing route");
        self.publish_route(RouteEvent::Create, &machine).await?;
        Ok(machine_id)
    }

    async fn provision(
        &self,
        template_id: Uuid,
        user_id: Uuid,
        requested_port: Option<u16>,
    ) -> Result<Machine, ProcessingError> {
        let template = self.resolve_template(template_id).await?;
        let context = self.fetch_build_context(&template).await?;

        let machine_id = Uuid::new_v4();
        let name = generate_machine_name(template_id);
        let port = requested_port.unwrap_or(self.settings.sandbox.container_port);
        let spec = SandboxSpec {
            image: format!("{}/{name}", self.settings.sandbox.image_prefix),
            name: sandbox_name(machine_id),
            cpu_shares: self.settings.sandbox.cpu_shares,
            memory_limit_bytes: self.settings.sandbox.memory_limit_bytes,
            container_port: port,
            host_port: self.settings.sandbox.host_port,
        };

        let engine = self.deps.engine.as_ref();
        EngineConnector::build_image_async(engine, &spec.image, context).await?;
        let sandbox_ref = EngineConnector::run_sandbox_async(engine, &spec).await?;

        let now = Utc::now();
        let subdomain = generate_subdomain(machine_id, user_id, port, &self.settings.proxy.base_domain);
        let machine = NewMachine {
            id: machine_id,
            user_id,
            template_id,
            name,
            port,
            url: self.settings.proxy.machine_url(&subdomain),
            credential: generate_credential(self.settings.sandbox.credential_length),
            expires_at: expiry_after(now, self.settings.sandbox.expiry_secs),
        }
        .into_running(sandbox_ref.clone(), None, now);

        if let Err(error) = self.deps.machines.insert_machine(&machine).await {
            if let Err(cleanup) = EngineConnector::remove_sandbox_async(engine, &sandbox_ref).await {
                warn!(%machine_id, error = %cleanup, "failed to remove unpersisted sandbox");
            }
            return Err(error.into());
        }
        Ok(machine)
    }

    /// Template record, from the cache when possible.
    async fn resolve_template(&self, template_id: Uuid) -> Result<Template, ProcessingError> {
        let key = template_key(template_id);
        match self.deps.cache.get(&key).await {
            Ok(Some(cached)) => match serde_json::from_str::<Template>(&cached) {
                Ok(template) => return Ok(template),
                Err(error) => warn!(%template_id, %error, "discarding undecodable cached template"),
            },
            Ok(None) => {}
            Err(error) => warn!(%template_id, %error, "template cache unavailable, reading store"),
        }

        let template = self
            .deps
            .templates
            .find_template(template_id)
            .await?
            .ok_or(ProcessingError::NotFound {
                entity: "template",
                id: template_id,
            })?;

        match serde_json::to_string(&template) {
            Ok(encoded) => {
                let ttl = self.settings.cache.template_ttl();
                if let Err(error) = self.deps.cache.set(&key, &encoded, ttl).await {
                    warn!(%template_id, %error, "failed to cache template");
                }
            }
            Err(error) => warn!(%template_id, %error, "failed to encode template for cache"),
        }
        Ok(template)
    }

    /// Download the template artifact and turn it into a tar build context.
    ///
    /// The workspace directory is removed when this returns, whatever the
    /// outcome.
    async fn fetch_build_context(&self, template: &Template) -> Result<Vec<u8>, ProcessingError> {
        let artifact_key = if template.artifact_key.is_empty() {
            Template::default_artifact_key(template.id)
        } else {
            template.artifact_key.clone()
        };
        let archive = self
            .deps
            .artifacts
            .fetch(&artifact_key)
            .await
            .map_err(|error| artifact_failure(template.id, error))?;

        let template_id = template.id;
        tokio::task::spawn_blocking(move || {
            let workspace = TemplateWorkspace::create()?;
            workspace.unpack(&artifact_key, &archive)?;
            let context = workspace.build_context()?;
            workspace.close()?;
            Ok::<_, ArtifactError>(context)
        })
        .await
        .map_err(|error| ProcessingError::transient(format!("workspace task failed: {error}")))?
        .map_err(|error| artifact_failure(template_id, error))
    }
}

fn artifact_failure(template_id: Uuid, error: ArtifactError) -> ProcessingError {
    match error {
        ArtifactError::NotFound { .. } => ProcessingError::NotFound {
            entity: "template artifact",
            id: template_id,
        },
        other => ProcessingError::transient(other),
    }
}

fn expiry_after(now: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    chrono::Duration::from_std(Duration::from_secs(seconds))
        .ok()
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
