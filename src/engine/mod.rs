//! Container engine boundary.
//!
//! Sandboxes run on a Docker-compatible engine reached through bollard. The
//! endpoint is resolved through a fallback chain:
//!
//! 1. CLI argument (`--engine-socket`)
//! 2. Config file (`engine_socket` in TOML)
//! 3. `CESTX_ENGINE_SOCKET` environment variable
//! 4. `DOCKER_HOST`, `CONTAINER_HOST`, then `PODMAN_HOST`
//! 5. Platform default (`/var/run/docker.sock` on Unix)

mod connection;

pub use connection::{EngineConnector, EngineFuture, SandboxEngine, SandboxSpec, SocketResolver};
