//! Sandbox image builds and container lifecycle on the engine.
//!
//! [`SandboxEngine`] is the narrow slice of the engine API the orchestrator
//! and route synchronizer need. The free functions on [`EngineConnector`]
//! layer error mapping and target-state semantics on top of it: stopping a
//! stopped container or removing a missing one is success, which keeps
//! redelivered and concurrent deletes free of runtime errors.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use bollard::models::{
    ContainerCreateBody, ContainerCreateResponse, ContainerInspectResponse, HostConfig,
    PortBinding,
};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptions, CreateContainerOptionsBuilder,
    InspectContainerOptions, RemoveContainerOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder,
};
use bollard::{Docker, body_full};
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use super::EngineConnector;
use super::error_classification::{is_missing, is_not_modified};
use crate::error::ContainerError;

/// Seconds the engine waits for a graceful stop before killing.
const STOP_GRACE_SECS: i32 = 10;

/// Address every port binding listens on.
const BIND_ALL_INTERFACES: &str = "0.0.0.0";

/// Boxed future returned by [`SandboxEngine`] implementors.
pub type EngineFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, bollard::errors::Error>> + Send + 'a>>;

/// Engine operations used to provision and tear down sandboxes.
///
/// Implemented for [`Docker`]; tests substitute mocks.
pub trait SandboxEngine: Send + Sync {
    /// Build and tag an image from a tar build context with a root `Dockerfile`.
    fn build_image(&self, tag: &str, context: Vec<u8>) -> EngineFuture<'_, ()>;

    /// Create a container.
    fn create_container(
        &self,
        options: Option<CreateContainerOptions>,
        config: ContainerCreateBody,
    ) -> EngineFuture<'_, ContainerCreateResponse>;

    /// Start a created or stopped container.
    fn start_container(&self, container_id: &str) -> EngineFuture<'_, ()>;

    /// Stop a running container.
    fn stop_container(&self, container_id: &str) -> EngineFuture<'_, ()>;

    /// Force-remove a container and its anonymous volumes.
    fn remove_container(&self, container_id: &str) -> EngineFuture<'_, ()>;

    /// Inspect a container by id or name.
    fn inspect_container(&self, container_id: &str) -> EngineFuture<'_, ContainerInspectResponse>;
}

impl SandboxEngine for Docker {
    fn build_image(&self, tag: &str, context: Vec<u8>) -> EngineFuture<'_, ()> {
        let options = BuildImageOptionsBuilder::new()
            .dockerfile("Dockerfile")
            .t(tag)
            .rm(true)
            .build();

        Box::pin(async move {
            let mut progress =
                Box::pin(Self::build_image(self, options, None, Some(body_full(context.into()))));
            while let Some(update) = progress.next().await {
                let info = update?;
                if let Some(message) = info.error_detail.and_then(|detail| detail.message) {
                    return Err(bollard::errors::Error::DockerStreamError { error: message });
                }
                if let Some(line) = info.stream.as_deref().map(str::trim).filter(|l| !l.is_empty()) {
                    debug!(target: "cestx::build", "{line}");
                }
            }
            Ok(())
        })
    }

    fn create_container(
        &self,
        options: Option<CreateContainerOptions>,
        config: ContainerCreateBody,
    ) -> EngineFuture<'_, ContainerCreateResponse> {
        Box::pin(async move { Self::create_container(self, options, config).await })
    }

    fn start_container(&self, container_id: &str) -> EngineFuture<'_, ()> {
        let id = String::from(container_id);
        Box::pin(async move { Self::start_container(self, &id, None::<StartContainerOptions>).await })
    }

    fn stop_container(&self, container_id: &str) -> EngineFuture<'_, ()> {
        let id = String::from(container_id);
        let options = StopContainerOptionsBuilder::new().t(STOP_GRACE_SECS).build();
        Box::pin(async move { Self::stop_container(self, &id, Some(options)).await })
    }

    fn remove_container(&self, container_id: &str) -> EngineFuture<'_, ()> {
        let id = String::from(container_id);
        let options = RemoveContainerOptionsBuilder::new().force(true).v(true).build();
        Box::pin(async move { Self::remove_container(self, &id, Some(options)).await })
    }

    fn inspect_container(&self, container_id: &str) -> EngineFuture<'_, ContainerInspectResponse> {
        let id = String::from(container_id);
        Box::pin(async move {
            Self::inspect_container(self, &id, None::<InspectContainerOptions>).await
        })
    }
}

/// What to launch for one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    /// Image tag to run.
    pub image: String,
    /// Container name; also how the route synchronizer finds the sandbox.
    pub name: String,
    /// Relative CPU weight.
    pub cpu_shares: i64,
    /// Hard memory limit in bytes.
    pub memory_limit_bytes: i64,
    /// Port the workload listens on inside the sandbox.
    pub container_port: u16,
    /// Fixed host port, or `None` to let the engine choose.
    pub host_port: Option<u16>,
}

impl SandboxSpec {
    fn create_options(&self) -> CreateContainerOptions {
        CreateContainerOptionsBuilder::new().name(&self.name).build()
    }

    fn create_body(&self) -> ContainerCreateBody {
        let binding = PortBinding {
            host_ip: Some(String::from(BIND_ALL_INTERFACES)),
            host_port: Some(self.host_port.map(|port| port.to_string()).unwrap_or_default()),
        };
        let port_bindings =
            HashMap::from([(format!("{}/tcp", self.container_port), Some(vec![binding]))]);

        ContainerCreateBody {
            image: Some(self.image.clone()),
            host_config: Some(HostConfig {
                cpu_shares: Some(self.cpu_shares),
                memory: Some(self.memory_limit_bytes),
                port_bindings: Some(port_bindings),
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        }
    }
}

impl EngineConnector {
    /// Build and tag a sandbox image.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::BuildFailed` if the engine rejects the build
    /// or reports an error while building.
    pub async fn build_image_async<E: SandboxEngine + ?Sized>(
        engine: &E,
        tag: &str,
        context: Vec<u8>,
    ) -> Result<(), ContainerError> {
        engine
            .build_image(tag, context)
            .await
            .map_err(|error| ContainerError::BuildFailed {
                image: tag.to_owned(),
                message: error.to_string(),
            })?;
        info!(image = tag, "built sandbox image");
        Ok(())
    }

    /// Create and start a sandbox, returning its container id.
    ///
    /// A container that was created but failed to start is removed before
    /// the error is returned.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::CreateFailed` or `ContainerError::StartFailed`.
    pub async fn run_sandbox_async<E: SandboxEngine + ?Sized>(
        engine: &E,
        spec: &SandboxSpec,
    ) -> Result<String, ContainerError> {
        let created = engine
            .create_container(Some(spec.create_options()), spec.create_body())
            .await
            .map_err(|error| ContainerError::CreateFailed {
                message: error.to_string(),
            })?;

        if let Err(error) = engine.start_container(&created.id).await {
            if let Err(cleanup) = engine.remove_container(&created.id).await {
                warn!(container_id = %created.id, error = %cleanup, "failed to remove unstarted sandbox");
            }
            return Err(ContainerError::StartFailed {
                container_id: created.id,
                message: error.to_string(),
            });
        }

        info!(container_id = %created.id, name = %spec.name, image = %spec.image, "sandbox running");
        Ok(created.id)
    }

    /// Start an existing sandbox.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::StartFailed` if the engine refuses.
    pub async fn start_sandbox_async<E: SandboxEngine + ?Sized>(
        engine: &E,
        container_id: &str,
    ) -> Result<(), ContainerError> {
        match engine.start_container(container_id).await {
            Ok(()) => Ok(()),
            Err(error) if is_not_modified(&error) => {
                debug!(container_id, "sandbox already running");
                Ok(())
            }
            Err(error) => Err(ContainerError::StartFailed {
                container_id: container_id.to_owned(),
                message: error.to_string(),
            }),
        }
    }

    /// Stop a sandbox. A stopped or missing sandbox counts as stopped.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::StopFailed` for any other engine failure.
    pub async fn stop_sandbox_async<E: SandboxEngine + ?Sized>(
        engine: &E,
        container_id: &str,
    ) -> Result<(), ContainerError> {
        match engine.stop_container(container_id).await {
            Ok(()) => Ok(()),
            Err(error) if is_not_modified(&error) || is_missing(&error) => {
                debug!(container_id, "sandbox already stopped");
                Ok(())
            }
            Err(error) => Err(ContainerError::StopFailed {
                container_id: container_id.to_owned(),
                message: error.to_string(),
            }),
        }
    }

    /// Remove a sandbox. A missing sandbox counts as removed.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::RemoveFailed` for any other engine failure.
    pub async fn remove_sandbox_async<E: SandboxEngine + ?Sized>(
        engine: &E,
        container_id: &str,
    ) -> Result<(), ContainerError> {
        match engine.remove_container(container_id).await {
            Ok(()) => Ok(()),
            Err(error) if is_missing(&error) => {
                debug!(container_id, "sandbox already removed");
                Ok(())
            }
            Err(error) => Err(ContainerError::RemoveFailed {
                container_id: container_id.to_owned(),
                message: error.to_string(),
            }),
        }
    }

    /// The sandbox's address on its container network, if one is assigned.
    ///
    /// Returns `None` while the engine has not yet assigned an address or
    /// when the sandbox does not exist. With several networks attached, the
    /// network whose name sorts first wins.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::InspectFailed` if inspection fails for any
    /// other reason.
    pub async fn resolve_address_async<E: SandboxEngine + ?Sized>(
        engine: &E,
        container: &str,
    ) -> Result<Option<String>, ContainerError> {
        let details = match engine.inspect_container(container).await {
            Ok(details) => details,
            Err(error) if is_missing(&error) => return Ok(None),
            Err(error) => {
                return Err(ContainerError::InspectFailed {
                    container_id: container.to_owned(),
                    message: error.to_string(),
                });
            }
        };

        let address = details
            .network_settings
            .and_then(|settings| settings.networks)
            .and_then(|networks| {
                networks
                    .into_iter()
                    .filter_map(|(name, endpoint)| {
                        endpoint
                            .ip_address
                            .filter(|ip| !ip.is_empty())
                            .map(|ip| (name, ip))
                    })
                    .min_by(|left, right| left.0.cmp(&right.0))
                    .map(|(_, ip)| ip)
            });
        Ok(address)
    }
}
