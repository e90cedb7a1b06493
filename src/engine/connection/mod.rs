//! Container engine endpoint resolution and client construction.
//!
//! The engine endpoint comes from configuration when set, then from the
//! conventional `DOCKER_HOST`, `CONTAINER_HOST` and `PODMAN_HOST` variables,
//! and finally from the platform default socket.

mod error_classification;
mod health_check;
mod sandbox;

use bollard::Docker;

use crate::error::CestxError;

pub use sandbox::{EngineFuture, SandboxEngine, SandboxSpec};

/// Variables consulted, in order, when configuration names no endpoint.
const FALLBACK_ENV_VARS: &[&str] = &["DOCKER_HOST", "CONTAINER_HOST", "PODMAN_HOST"];

/// Seconds bollard waits on a single engine request.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Seconds a health-check ping may take.
const HEALTH_CHECK_TIMEOUT_SECS: u64 = 10;

#[cfg(unix)]
const DEFAULT_SOCKET: &str = "unix:///var/run/docker.sock";

#[cfg(windows)]
const DEFAULT_SOCKET: &str = "npipe:////./pipe/docker_engine";

/// Looks up an engine endpoint in the process environment.
///
/// Generic over [`mockable::Env`] so lookups can be faked in tests.
pub struct SocketResolver<'a, E: mockable::Env> {
    env: &'a E,
}

impl<'a, E: mockable::Env> SocketResolver<'a, E> {
    /// Create a resolver reading from `env`.
    #[must_use]
    pub const fn new(env: &'a E) -> Self {
        Self { env }
    }

    /// The first non-empty value among the fallback variables.
    #[must_use]
    pub fn resolve_from_env(&self) -> Option<String> {
        FALLBACK_ENV_VARS
            .iter()
            .filter_map(|name| self.env.string(name))
            .find(|value| !value.is_empty())
    }

    /// The platform default endpoint.
    #[must_use]
    pub const fn default_socket() -> &'static str {
        DEFAULT_SOCKET
    }
}

/// How an endpoint string should be handed to bollard.
#[derive(Debug, PartialEq, Eq)]
enum Endpoint {
    /// A local socket or named pipe URI.
    Socket(String),
    /// An HTTP(S) URI; `tcp://` is rewritten to `http://`.
    Http(String),
}

impl Endpoint {
    fn parse(raw: &str) -> Self {
        if raw.starts_with("unix://") || raw.starts_with("npipe://") {
            return Self::Socket(raw.to_owned());
        }
        if let Some(rest) = raw.strip_prefix("tcp://") {
            return Self::Http(format!("http://{rest}"));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Self::Http(raw.to_owned());
        }
        // Bare paths: `//` or `\\` prefixes name Windows pipes, anything else a Unix socket.
        if raw.starts_with("//") || raw.starts_with("\\\\") {
            Self::Socket(format!("npipe://{raw}"))
        } else {
            Self::Socket(format!("unix://{raw}"))
        }
    }
}

/// Entry points for connecting to the engine and driving sandboxes on it.
pub struct EngineConnector;

impl EngineConnector {
    /// Build a client for `socket`.
    ///
    /// Accepts `unix://`, `npipe://`, `tcp://`, `http://` and `https://`
    /// URIs, or a bare socket path.
    ///
    /// # Errors
    ///
    /// Returns a classified `ContainerError` (socket not found, permission
    /// denied, or connection failure) if the client cannot be built.
    pub fn connect(socket: &str) -> Result<Docker, CestxError> {
        let endpoint = Endpoint::parse(socket);
        let client = match &endpoint {
            Endpoint::Socket(uri) => {
                Docker::connect_with_socket(uri, REQUEST_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
            Endpoint::Http(uri) => {
                Docker::connect_with_http(uri, REQUEST_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
        };
        client.map_err(|error| {
            let uri = match &endpoint {
                Endpoint::Socket(uri) | Endpoint::Http(uri) => uri.as_str(),
            };
            CestxError::from(error_classification::classify_connection_error(&error, uri))
        })
    }

    /// Resolve the endpoint from configuration, environment, or default.
    ///
    /// An empty configured value counts as unset.
    #[must_use]
    pub fn resolve_socket<E: mockable::Env>(
        config_socket: Option<&str>,
        resolver: &SocketResolver<'_, E>,
    ) -> String {
        config_socket
            .filter(|socket| !socket.is_empty())
            .map(String::from)
            .or_else(|| resolver.resolve_from_env())
            .unwrap_or_else(|| SocketResolver::<E>::default_socket().to_owned())
    }

    /// Resolve the endpoint and build a client for it.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`Self::connect`].
    pub fn connect_with_fallback<E: mockable::Env>(
        config_socket: Option<&str>,
        resolver: &SocketResolver<'_, E>,
    ) -> Result<Docker, CestxError> {
        Self::connect(&Self::resolve_socket(config_socket, resolver))
    }
}

#[cfg(test)]
mod tests;
