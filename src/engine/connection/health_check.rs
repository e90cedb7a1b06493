//! Engine liveness checks run before services start consuming.

use std::time::Duration;

use bollard::Docker;
use tracing::info;

use super::{EngineConnector, HEALTH_CHECK_TIMEOUT_SECS, SocketResolver};
use crate::error::{CestxError, ContainerError};

impl EngineConnector {
    /// Ping the engine, failing if it does not answer in time.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::HealthCheckTimeout` when the ping takes longer
    /// than the health-check timeout, and `ContainerError::HealthCheckFailed`
    /// when the engine answers with an error.
    pub async fn health_check_async(docker: &Docker) -> Result<(), CestxError> {
        let limit = Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS);
        let reply = tokio::time::timeout(limit, docker.ping())
            .await
            .map_err(|_| ContainerError::HealthCheckTimeout {
                seconds: HEALTH_CHECK_TIMEOUT_SECS,
            })?;
        reply.map_err(|error| ContainerError::HealthCheckFailed {
            message: error.to_string(),
        })?;
        Ok(())
    }

    /// Resolve the endpoint, connect, and confirm the engine answers.
    ///
    /// # Errors
    ///
    /// Returns connection errors from [`Self::connect`] and health-check
    /// errors from [`Self::health_check_async`].
    pub async fn connect_and_verify_async<E: mockable::Env>(
        config_socket: Option<&str>,
        resolver: &SocketResolver<'_, E>,
    ) -> Result<Docker, CestxError> {
        let socket = Self::resolve_socket(config_socket, resolver);
        let docker = Self::connect(&socket)?;
        Self::health_check_async(&docker).await?;
        info!(socket = %socket, "container engine is reachable");
        Ok(docker)
    }
}
