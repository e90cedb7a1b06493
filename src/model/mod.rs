//! Machine and template records.
//!
//! A [`Machine`] is the persisted logical entity behind one user's sandbox. Its
//! sandbox reference is present exactly while the status is `running` or
//! `stopped`; every mutation goes through [`Machine::transition`] so that the
//! rule cannot be broken by a handler.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProcessingError, StoreError};

/// Characters allowed in generated machine-name suffixes.
///
/// Image tags must be lowercase, so the suffix alphabet is too.
const NAME_SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of the random suffix appended to machine names.
const NAME_SUFFIX_LEN: usize = 8;

/// Lifecycle status of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    /// Accepted but not yet provisioned.
    Pending,
    /// Sandbox provisioned and running.
    Running,
    /// Sandbox provisioned but stopped.
    Stopped,
    /// Terminal state; the sandbox has been released.
    Deleted,
}

impl MachineStatus {
    /// Lowercase name as stored and logged.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Deleted => "deleted",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Stopped)
                | (Self::Stopped, Self::Running)
                | (Self::Pending | Self::Running | Self::Stopped, Self::Deleted)
        )
    }

    /// Whether a machine in this status owns a provisioned sandbox.
    #[must_use]
    pub const fn holds_sandbox(self) -> bool {
        matches!(self, Self::Running | Self::Stopped)
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MachineStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "deleted" => Ok(Self::Deleted),
            other => Err(StoreError::DecodeFailed {
                field: "status",
                message: format!("unknown machine status '{other}'"),
            }),
        }
    }
}

/// A provisioned machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Machine identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Template the machine was built from.
    pub template_id: Uuid,
    /// Human-readable name, also used in the image tag.
    pub name: String,
    /// Current lifecycle status.
    pub status: MachineStatus,
    /// Container ID assigned by the engine.
    pub sandbox_ref: Option<String>,
    /// Network address last observed for the sandbox.
    pub address: Option<String>,
    /// Externally reachable URL.
    pub url: String,
    /// Sandbox port exposed through the proxy.
    pub port: u16,
    /// Generated access credential.
    pub credential: String,
    /// When the machine's access expires.
    pub expires_at: DateTime<Utc>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record was last changed.
    pub updated_at: DateTime<Utc>,
}

/// Everything known about a machine before its sandbox is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMachine {
    /// Machine identifier.
    pub id: Uuid,
    /// Owning user.
    pub user_id: Uuid,
    /// Template the machine is built from.
    pub template_id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Sandbox port.
    pub port: u16,
    /// Externally reachable URL.
    pub url: String,
    /// Generated access credential.
    pub credential: String,
    /// When access expires.
    pub expires_at: DateTime<Utc>,
}

impl NewMachine {
    /// Produce the running machine record once the sandbox has launched.
    #[must_use]
    pub fn into_running(
        self,
        sandbox_ref: String,
        address: Option<String>,
        now: DateTime<Utc>,
    ) -> Machine {
        Machine {
            id: self.id,
            user_id: self.user_id,
            template_id: self.template_id,
            name: self.name,
            status: MachineStatus::Running,
            sandbox_ref: Some(sandbox_ref),
            address,
            url: self.url,
            port: self.port,
            credential: self.credential,
            expires_at: self.expires_at,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Machine {
    /// Move the machine to `next`, enforcing the lifecycle state machine.
    ///
    /// Moving to `deleted` clears the sandbox reference and address.
    ///
    /// # Errors
    ///
    /// Returns `ProcessingError::InvalidTransition` when the state machine has
    /// no edge from the current status to `next`.
    pub fn transition(
        &mut self,
        next: MachineStatus,
        now: DateTime<Utc>,
    ) -> Result<(), ProcessingError> {
        if !self.status.can_transition_to(next) {
            return Err(ProcessingError::InvalidTransition {
                machine_id: self.id,
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        if next == MachineStatus::Deleted {
            self.sandbox_ref = None;
            self.address = None;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Whether the sandbox reference agrees with the status.
    #[must_use]
    pub fn sandbox_ref_consistent(&self) -> bool {
        let has_ref = self
            .sandbox_ref
            .as_deref()
            .is_some_and(|reference| !reference.is_empty());
        has_ref == self.status.holds_sandbox()
    }
}

/// A sandbox template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    /// Template identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Free-form description.
    #[serde(default)]
    pub description: String,
    /// Object-store key of the packaged template.
    pub artifact_key: String,
    /// Owning user.
    pub user_id: Uuid,
}

impl Template {
    /// Object-store key used for a template's artifact.
    #[must_use]
    pub fn default_artifact_key(template_id: Uuid) -> String {
        format!("{template_id}.zip")
    }
}

/// Generate a machine name of the form `{template_id}-{suffix}`.
#[must_use]
pub fn generate_machine_name(template_id: Uuid) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .filter_map(|_| NAME_SUFFIX_ALPHABET.choose(&mut rng).copied())
        .map(char::from)
        .collect();
    format!("{template_id}-{suffix}")
}

/// Generate a random alphanumeric access credential.
#[must_use]
pub fn generate_credential(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
