//! Semantic error types for the cestx services.
//!
//! This module defines the error hierarchy for cestx, following the principle of
//! using semantic error enums (via `thiserror`) for conditions the caller might
//! inspect, retry, or map to a broker disposition, while reserving opaque errors
//! (`eyre::Report`) for the application boundary.
//!
//! [`ProcessingError`] is the message-processing taxonomy. Every consumed message
//! ends in either success or exactly one of its variants, and
//! [`ProcessingError::disposition`] decides whether the broker acknowledges,
//! requeues, or dead-letters the delivery.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

use crate::broker::Disposition;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found at the expected path.
    #[error("configuration file not found: {path}")]
    FileNotFound {
        /// The path where the configuration file was expected.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("failed to parse configuration file: {message}")]
    ParseError {
        /// A description of the parse error.
        message: String,
    },

    /// A required configuration value is missing.
    #[error("missing required configuration: {field}")]
    MissingRequired {
        /// The name of the missing field.
        field: String,
    },

    /// A configuration value failed validation.
    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// The reason the value is invalid.
        reason: String,
    },

    /// The `OrthoConfig` library returned an error during configuration loading.
    #[error("configuration loading failed: {0}")]
    OrthoConfig(Arc<ortho_config::OrthoError>),
}

/// Errors that can occur during container engine operations.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// Failed to connect to the container engine socket.
    #[error("failed to connect to container engine: {message}")]
    ConnectionFailed {
        /// A description of the connection failure.
        message: String,
    },

    /// The container engine socket was not found.
    #[error("container engine socket not found: {path}")]
    SocketNotFound {
        /// The path where the socket was expected.
        path: PathBuf,
    },

    /// Permission denied when accessing the container engine socket.
    #[error("permission denied accessing container socket: {path}")]
    PermissionDenied {
        /// The path to the socket.
        path: PathBuf,
    },

    /// Failed to build a sandbox image.
    #[error("failed to build image '{image}': {message}")]
    BuildFailed {
        /// The image tag being built.
        image: String,
        /// A description of the build failure.
        message: String,
    },

    /// Failed to create a container.
    #[error("failed to create container: {message}")]
    CreateFailed {
        /// A description of the creation failure.
        message: String,
    },

    /// Failed to start a container.
    #[error("failed to start container '{container_id}': {message}")]
    StartFailed {
        /// The ID of the container that failed to start.
        container_id: String,
        /// A description of the start failure.
        message: String,
    },

    /// Failed to stop a container.
    #[error("failed to stop container '{container_id}': {message}")]
    StopFailed {
        /// The ID of the container that failed to stop.
        container_id: String,
        /// A description of the stop failure.
        message: String,
    },

    /// Failed to remove a container.
    #[error("failed to remove container '{container_id}': {message}")]
    RemoveFailed {
        /// The ID of the container that could not be removed.
        container_id: String,
        /// A description of the removal failure.
        message: String,
    },

    /// Failed to inspect a container.
    #[error("failed to inspect container '{container_id}': {message}")]
    InspectFailed {
        /// The ID or name of the inspected container.
        container_id: String,
        /// A description of the inspection failure.
        message: String,
    },

    /// Failed to create the runtime used by synchronous helpers.
    #[error("failed to create async runtime: {message}")]
    RuntimeCreationFailed {
        /// A description of the runtime failure.
        message: String,
    },

    /// Health check failed - engine did not respond correctly.
    #[error("container engine health check failed: {message}")]
    HealthCheckFailed {
        /// A description of the health check failure.
        message: String,
    },

    /// Health check timed out.
    #[error("container engine health check timed out after {seconds} seconds")]
    HealthCheckTimeout {
        /// The timeout duration in seconds.
        seconds: u64,
    },
}

/// Errors raised by the relational machine and template store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database could not be reached.
    #[error("failed to connect to database: {message}")]
    ConnectionFailed {
        /// A description of the connection failure.
        message: String,
    },

    /// Schema migrations failed to apply.
    #[error("failed to apply database migrations: {message}")]
    MigrationFailed {
        /// A description of the migration failure.
        message: String,
    },

    /// A query failed to execute.
    #[error("database {operation} failed: {message}")]
    QueryFailed {
        /// The repository operation that failed.
        operation: &'static str,
        /// A description of the failure.
        message: String,
    },

    /// A stored row could not be mapped into a domain value.
    #[error("failed to decode stored {field}: {message}")]
    DecodeFailed {
        /// The column or field that failed to decode.
        field: &'static str,
        /// A description of the decode failure.
        message: String,
    },
}

/// Errors raised by the key-value cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache server could not be reached.
    #[error("failed to connect to cache: {message}")]
    ConnectionFailed {
        /// A description of the connection failure.
        message: String,
    },

    /// A cache command failed.
    #[error("cache command {command} failed: {message}")]
    CommandFailed {
        /// The command that failed.
        command: &'static str,
        /// A description of the failure.
        message: String,
    },

    /// A cached value could not be decoded.
    #[error("failed to decode cached value for '{key}': {message}")]
    DecodeFailed {
        /// The cache key holding the value.
        key: String,
        /// A description of the decode failure.
        message: String,
    },
}

/// Errors raised while fetching and unpacking template artifacts.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The artifact does not exist in the object store.
    #[error("artifact '{key}' not found in bucket '{bucket}'")]
    NotFound {
        /// The bucket that was searched.
        bucket: String,
        /// The object key that was requested.
        key: String,
    },

    /// The artifact download failed.
    #[error("failed to download artifact '{key}': {message}")]
    DownloadFailed {
        /// The object key that was requested.
        key: String,
        /// A description of the download failure.
        message: String,
    },

    /// The local workspace could not be prepared.
    #[error("template workspace error: {message}")]
    WorkspaceFailed {
        /// A description of the workspace failure.
        message: String,
    },

    /// The artifact is not a readable archive.
    #[error("invalid template archive: {message}")]
    InvalidArchive {
        /// A description of the archive problem.
        message: String,
    },

    /// The unpacked template has no Dockerfile to build from.
    #[error("template archive does not contain a Dockerfile")]
    MissingDockerfile,
}

/// Errors raised by the message broker client.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("failed to connect to broker after {attempts} attempt(s): {message}")]
    ConnectionFailed {
        /// Number of connection attempts made.
        attempts: u32,
        /// A description of the last connection failure.
        message: String,
    },

    /// Declaring exchanges, queues, or bindings failed.
    #[error("failed to declare broker topology: {message}")]
    TopologyFailed {
        /// A description of the declaration failure.
        message: String,
    },

    /// A message could not be serialised.
    #[error("failed to encode message: {message}")]
    EncodeFailed {
        /// A description of the encoding failure.
        message: String,
    },

    /// Publishing a message failed or was not confirmed.
    #[error("failed to publish to '{exchange}' with key '{routing_key}': {message}")]
    PublishFailed {
        /// The target exchange.
        exchange: String,
        /// The routing key used.
        routing_key: String,
        /// A description of the publish failure.
        message: String,
    },

    /// Starting or running a consumer failed.
    #[error("consumer for queue '{queue}' failed: {message}")]
    ConsumeFailed {
        /// The queue being consumed.
        queue: String,
        /// A description of the consumer failure.
        message: String,
    },
}

/// Errors raised by the reverse-proxy control API client.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// A route failed validation before being submitted.
    #[error("invalid route: {reason}")]
    InvalidRoute {
        /// Why the route was rejected.
        reason: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build proxy client: {message}")]
    ClientFailed {
        /// A description of the client failure.
        message: String,
    },

    /// The request did not complete.
    #[error("proxy request to {resource} failed: {message}")]
    RequestFailed {
        /// The proxy resource targeted.
        resource: String,
        /// A description of the transport failure.
        message: String,
    },

    /// The proxy answered with a non-success status.
    #[error("proxy returned status {status} for {resource}")]
    Status {
        /// The proxy resource targeted.
        resource: String,
        /// The HTTP status code returned.
        status: u16,
    },
}

/// Errors raised by per-entity concurrency controls.
#[derive(Debug, Error)]
pub enum ConcurrencyError {
    /// The machine lock could not be acquired in time.
    #[error("machine {machine_id} is locked by another worker (waited {waited_secs}s)")]
    LockUnavailable {
        /// The machine whose lock was contended.
        machine_id: Uuid,
        /// How long acquisition was attempted.
        waited_secs: u64,
    },

    /// Another delivery of the same create request is still in progress.
    #[error("create request '{key}' is already being processed")]
    CreateInProgress {
        /// The idempotency key of the create request.
        key: String,
    },
}

/// Failure outcome of processing one consumed message.
#[derive(Debug, Error)]
pub enum ProcessingError {
    /// The payload could not be parsed or is missing required fields.
    #[error("malformed message: {reason}")]
    MalformedMessage {
        /// Why the message was rejected.
        reason: String,
    },

    /// The referenced machine or template does not exist.
    #[error("{entity} {id} not found")]
    NotFound {
        /// The kind of entity that was looked up.
        entity: &'static str,
        /// The identifier that was looked up.
        id: Uuid,
    },

    /// The requested lifecycle transition is not allowed from the current state.
    #[error("machine {machine_id} cannot move from {from} to {to}")]
    InvalidTransition {
        /// The machine being transitioned.
        machine_id: Uuid,
        /// The current status.
        from: String,
        /// The requested status.
        to: String,
    },

    /// A runtime, store, or network error that may succeed on retry.
    #[error("transient failure: {reason}")]
    TransientFailure {
        /// A description of the failure.
        reason: String,
    },

    /// Cleanup steps failed but the operation still made forward progress.
    #[error("best-effort steps failed: {}", failures.join("; "))]
    BestEffortFailure {
        /// The failed cleanup steps, in execution order.
        failures: Vec<String>,
    },
}

impl ProcessingError {
    /// Build a malformed-message error from any displayable reason.
    #[must_use]
    pub fn malformed(reason: impl std::fmt::Display) -> Self {
        Self::MalformedMessage {
            reason: reason.to_string(),
        }
    }

    /// Build a transient failure from any displayable cause.
    #[must_use]
    pub fn transient(reason: impl std::fmt::Display) -> Self {
        Self::TransientFailure {
            reason: reason.to_string(),
        }
    }

    /// Map the failure onto the broker disposition for its delivery.
    ///
    /// Permanent failures are rejected without requeue so they land on the
    /// dead-letter queue, transient failures are requeued, and best-effort
    /// failures are acknowledged after logging.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::MalformedMessage { .. }
            | Self::NotFound { .. }
            | Self::InvalidTransition { .. } => Disposition::Reject,
            Self::TransientFailure { .. } => Disposition::Requeue,
            Self::BestEffortFailure { .. } => Disposition::Ack,
        }
    }

    /// Returns true when redelivering the message cannot change the outcome.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self.disposition(), Disposition::Reject)
    }
}

impl From<StoreError> for ProcessingError {
    fn from(error: StoreError) -> Self {
        Self::transient(error)
    }
}

impl From<CacheError> for ProcessingError {
    fn from(error: CacheError) -> Self {
        Self::transient(error)
    }
}

impl From<ContainerError> for ProcessingError {
    fn from(error: ContainerError) -> Self {
        Self::transient(error)
    }
}

impl From<BrokerError> for ProcessingError {
    fn from(error: BrokerError) -> Self {
        Self::transient(error)
    }
}

impl From<ProxyError> for ProcessingError {
    fn from(error: ProxyError) -> Self {
        Self::transient(error)
    }
}

impl From<ConcurrencyError> for ProcessingError {
    fn from(error: ConcurrencyError) -> Self {
        Self::transient(error)
    }
}

/// Top-level error type for the cestx services.
///
/// This enum aggregates all domain-specific errors into a single type that can
/// be used throughout the application. At the application boundary (main.rs),
/// these errors are converted to `eyre::Report` for human-readable reporting.
#[derive(Debug, Error)]
pub enum CestxError {
    /// An error occurred during configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// An error occurred during container operations.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// An error occurred in the relational store.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An error occurred in the key-value cache.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// An error occurred while handling template artifacts.
    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    /// An error occurred in the message broker client.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// An error occurred talking to the reverse proxy.
    #[error(transparent)]
    Proxy(#[from] ProxyError),

    /// A per-entity concurrency control could not be satisfied.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// A consumed message could not be processed.
    #[error(transparent)]
    Processing(#[from] ProcessingError),
}

/// A specialised `Result` type for cestx operations.
pub type Result<T> = std::result::Result<T, CestxError>;
