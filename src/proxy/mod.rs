//! Reverse-proxy routing configuration and its control API.
//!
//! A route maps a generated subdomain to one sandbox address. It is submitted
//! to the proxy as a single dynamic-configuration document holding one
//! service (the load-balancer target) and one router (the host rule), both
//! named after the subdomain. Documents are typed and validated before they
//! are serialised, so a route can never point at an empty or placeholder
//! address.

mod client;

use std::collections::BTreeMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

pub use client::HttpProxyClient;

/// Boxed future returned by [`ProxyApi`] implementors.
pub type ProxyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send + 'a>>;

/// Operations on the proxy's dynamic configuration.
pub trait ProxyApi: Send + Sync {
    /// Submit a configuration document.
    fn apply<'a>(&'a self, config: &'a DynamicConfig) -> ProxyFuture<'a>;

    /// Delete the router named `name`.
    fn delete_router<'a>(&'a self, name: &'a str) -> ProxyFuture<'a>;

    /// Delete the service named `name`.
    fn delete_service<'a>(&'a self, name: &'a str) -> ProxyFuture<'a>;
}

/// Where a subdomain should send its traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    /// Fully qualified host name matched by the router.
    pub subdomain: String,
    /// Sandbox IP address.
    pub address: String,
    /// Sandbox port.
    pub port: u16,
}

/// Top-level dynamic configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicConfig {
    /// HTTP routing section.
    pub http: HttpConfig,
}

/// HTTP services and routers, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Backend services.
    pub services: BTreeMap<String, Service>,
    /// Routers matching requests to services.
    pub routers: BTreeMap<String, Router>,
}

/// A backend service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Load-balanced server pool.
    pub load_balancer: LoadBalancer,
}

/// Server pool of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    /// Target servers.
    pub servers: Vec<Server>,
}

/// One backend server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// Server URL, `http://{address}:{port}`.
    pub url: String,
}

/// A router matching a host to a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    /// Match rule, `Host(`{subdomain}`)`.
    pub rule: String,
    /// Name of the target service.
    pub service: String,
    /// Middlewares applied before forwarding.
    #[serde(default)]
    pub middlewares: Vec<String>,
}

impl DynamicConfig {
    /// Build the document routing `target.subdomain` to the target address.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::InvalidRoute` when the subdomain is empty or not a
    /// plain host name, the address is not a usable IP address, or the port
    /// is zero.
    pub fn for_route(target: &RouteTarget, middlewares: &[String]) -> Result<Self, ProxyError> {
        let host = validate_host(&target.subdomain)?;
        let ip = validate_address(&target.address)?;
        if target.port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        let service = Service {
            load_balancer: LoadBalancer {
                servers: vec![Server {
                    url: format!("http://{}", SocketAddr::new(ip, target.port)),
                }],
            },
        };
        let router = Router {
            rule: format!("Host(`{host}`)"),
            service: host.to_owned(),
            middlewares: middlewares.to_vec(),
        };

        Ok(Self {
            http: HttpConfig {
                services: BTreeMap::from([(host.to_owned(), service)]),
                routers: BTreeMap::from([(host.to_owned(), router)]),
            },
        })
    }
}

fn invalid(reason: impl Into<String>) -> ProxyError {
    ProxyError::InvalidRoute {
        reason: reason.into(),
    }
}

fn validate_host(subdomain: &str) -> Result<&str, ProxyError> {
    if subdomain.is_empty() {
        return Err(invalid("subdomain is empty"));
    }
    let plain = subdomain
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
    if !plain || subdomain.starts_with('.') || subdomain.ends_with('.') {
        return Err(invalid(format!("'{subdomain}' is not a valid host name")));
    }
    Ok(subdomain)
}

fn validate_address(address: &str) -> Result<IpAddr, ProxyError> {
    let ip: IpAddr = address
        .parse()
        .map_err(|_| invalid(format!("'{address}' is not an IP address")))?;
    if ip.is_unspecified() {
        return Err(invalid(format!("'{address}' is a placeholder address")));
    }
    Ok(ip)
}
