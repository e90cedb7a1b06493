//! Route Synchronizer.
//!
//! Keeps the reverse proxy in step with sandbox network state. `route.create`
//! resolves the sandbox address through the engine, polling while the engine
//! has not assigned one yet, and submits one typed configuration document.
//! `route.delete` removes the router and then the service for the subdomain
//! and always succeeds: a missing route is the expected end state.
//!
//! The synchronizer never reads the machine store; it finds the sandbox by
//! its deterministic container name.

use std::sync::Arc;

use tracing::{Instrument, info, info_span, warn};

use crate::broker::{HandlerFuture, InboundMessage, MessageHandler, RetryPolicy, retry_with_backoff};
use crate::config::AppConfig;
use crate::contracts::{RouteEvent, RouteMessage, sandbox_name};
use crate::engine::{EngineConnector, SandboxEngine};
use crate::error::ProcessingError;
use crate::proxy::{DynamicConfig, ProxyApi, RouteTarget};

/// Route event handler.
pub struct RouteSynchronizer {
    engine: Arc<dyn SandboxEngine>,
    proxy: Arc<dyn ProxyApi>,
    base_domain: String,
    middlewares: Vec<String>,
    poll: RetryPolicy,
}

impl RouteSynchronizer {
    /// Create a synchronizer using the proxy and processing sections of
    /// `config`.
    #[must_use]
    pub fn new(engine: Arc<dyn SandboxEngine>, proxy: Arc<dyn ProxyApi>, config: &AppConfig) -> Self {
        Self {
            engine,
            proxy,
            base_domain: config.proxy.base_domain.clone(),
            middlewares: config.proxy.middlewares.clone(),
            poll: config.processing.address_poll_policy(),
        }
    }

    /// Decode and apply one route message.
    ///
    /// # Errors
    ///
    /// Returns `MalformedMessage` for undecodable payloads and a transient
    /// failure when a route cannot be registered. Deletion never fails.
    pub async fn handle_message(&self, message: &InboundMessage) -> Result<(), ProcessingError> {
        let route = RouteMessage::decode(&message.body)?;
        let subdomain = route.subdomain(&self.base_domain);
        let span = info_span!(
            "route",
            event = %route.event,
            machine_id = %route.machine_id,
            subdomain = %subdomain
        );
        async {
            match route.event {
                RouteEvent::Create => self.register(&route, subdomain).await,
                RouteEvent::Delete => {
                    self.withdraw(&subdomain).await;
                    Ok(())
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Point `subdomain` at the machine's sandbox.
    ///
    /// # Errors
    ///
    /// Returns a transient failure when no address appears within the poll
    /// policy, when the route cannot be built from the address, or when the
    /// proxy rejects the document.
    pub async fn register(&self, route: &RouteMessage, subdomain: String) -> Result<(), ProcessingError> {
        let address = self.await_address(route).await?;
        let target = RouteTarget {
            subdomain,
            address,
            port: route.port,
        };
        let document = DynamicConfig::for_route(&target, &self.middlewares)
            .map_err(ProcessingError::transient)?;

        self.proxy.apply(&document).await?;
        info!(address = %target.address, port = target.port, "route registered");
        Ok(())
    }

    /// Remove the router and service named `subdomain`, logging failures.
    pub async fn withdraw(&self, subdomain: &str) {
        if let Err(error) = self.proxy.delete_router(subdomain).await {
            warn!(%error, "router deletion failed");
        }
        if let Err(error) = self.proxy.delete_service(subdomain).await {
            warn!(%error, "service deletion failed");
        }
        info!("route withdrawn");
    }

    async fn await_address(&self, route: &RouteMessage) -> Result<String, ProcessingError> {
        let name = sandbox_name(route.machine_id);
        let container = name.as_str();
        let engine = self.engine.as_ref();
        retry_with_backoff(&self.poll, "sandbox address lookup", move |_| async move {
            EngineConnector::resolve_address_async(engine, container)
                .await
                .map_err(ProcessingError::from)?
                .ok_or_else(|| ProcessingError::transient(format!("{container} has no network address yet")))
        })
        .await
        .map_err(|(attempts, failure)| {
            ProcessingError::transient(format!(
                "no address for {container} after {attempts} attempts: {failure}"
            ))
        })
    }
}

impl MessageHandler for RouteSynchronizer {
    fn handle<'a>(&'a self, message: &'a InboundMessage) -> HandlerFuture<'a> {
        Box::pin(self.handle_message(message))
    }
}

impl std::fmt::Debug for RouteSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteSynchronizer")
            .field("base_domain", &self.base_domain)
            .field("middlewares", &self.middlewares)
            .field("poll", &self.poll)
            .finish_non_exhaustive()
    }
}
