//! Unit tests for cestx configuration types.
//!
//! - [`helpers`] - Shared fixtures and helper functions
//! - [`types_tests`] - Defaults and serialisation
//! - [`validation`] - `AppConfig::validate` and required-field checks
//! - [`layer_precedence_tests`] - `MergeComposer` layer precedence

mod helpers;
