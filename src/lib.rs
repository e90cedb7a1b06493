//! Ephemeral sandbox machines behind a dynamic reverse proxy.
//!
//! `cestx` provisions per-user sandboxes from packaged templates and keeps a
//! reverse proxy routing a generated subdomain to each one. Two services
//! cooperate over a message broker:
//!
//! - the Machine Orchestrator consumes `machine.*` lifecycle messages, builds
//!   and runs sandboxes on the container engine, persists machine records,
//!   and emits `route.*` events;
//! - the Route Synchronizer consumes `route.*` events, resolves sandbox
//!   addresses, and maintains the proxy's dynamic configuration.
//!
//! Every message is acknowledged, requeued with bounded backoff, or
//! dead-lettered according to the failure taxonomy in [`error`].
//!
//! # Modules
//!
//! - [`api`]: Service entry points used by the binary
//! - [`artifacts`]: Template artifact download and build contexts
//! - [`broker`]: Publishing, consuming, and retry policy
//! - [`cache`]: Key-value store for templates, dedup ledger, and locks
//! - [`config`]: Configuration system with layered precedence (CLI > env > file > defaults)
//! - [`contracts`]: Message schemas and naming rules shared by both services
//! - [`engine`]: Container engine connection and sandbox lifecycle
//! - [`error`]: Semantic error types for the application
//! - [`model`]: Machine and template records
//! - [`orchestrator`]: Machine lifecycle handler
//! - [`proxy`]: Reverse-proxy configuration documents and control API
//! - [`router`]: Route synchronization handler
//! - [`store`]: Relational repositories

pub mod api;
pub mod artifacts;
pub mod broker;
pub mod cache;
pub mod config;
pub mod contracts;
pub mod engine;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod proxy;
pub mod router;
pub mod store;
