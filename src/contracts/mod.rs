//! Event contracts shared by the orchestrator and the route synchronizer.
//!
//! Both services agree on three things defined here: the JSON message schemas
//! carried over the broker, the exchange and queue names those messages travel
//! through, and the deterministic naming functions ([`generate_subdomain`] and
//! [`sandbox_name`]) that let the route synchronizer find a machine's sandbox
//! and route without reading the machine store.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::ProcessingError;

/// Default exchange carrying machine lifecycle messages.
pub const MACHINE_EXCHANGE: &str = "machines";

/// Default exchange carrying route synchronisation messages.
pub const ROUTE_EXCHANGE: &str = "routes";

/// Prefix applied to every sandbox container name.
pub const SANDBOX_NAME_PREFIX: &str = "cestx";

/// Lifecycle intent carried by a machine message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachineEvent {
    /// Provision a new machine from a template.
    #[serde(rename = "machine.create")]
    Create,
    /// Start a stopped machine.
    #[serde(rename = "machine.start")]
    Start,
    /// Stop a running machine.
    #[serde(rename = "machine.stop")]
    Stop,
    /// Delete a machine and its sandbox.
    #[serde(rename = "machine.delete")]
    Delete,
}

impl MachineEvent {
    /// Every machine event, in queue declaration order.
    pub const ALL: [Self; 4] = [Self::Create, Self::Start, Self::Stop, Self::Delete];

    /// The wire name of the event, which doubles as its queue and routing key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "machine.create",
            Self::Start => "machine.start",
            Self::Stop => "machine.stop",
            Self::Delete => "machine.delete",
        }
    }
}

impl fmt::Display for MachineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing intent carried by a route message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RouteEvent {
    /// Register the machine's subdomain with the proxy.
    #[serde(rename = "route.create")]
    Create,
    /// Remove the machine's subdomain from the proxy.
    #[serde(rename = "route.delete")]
    Delete,
}

impl RouteEvent {
    /// Every route event, in queue declaration order.
    pub const ALL: [Self; 2] = [Self::Create, Self::Delete];

    /// The wire name of the event, which doubles as its queue and routing key.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "route.create",
            Self::Delete => "route.delete",
        }
    }
}

impl fmt::Display for RouteEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine lifecycle message as it appears on the wire.
///
/// Only `event` is structurally required; which identifiers must be present
/// depends on the event and is checked by [`MachineMessage::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMessage {
    /// The lifecycle intent.
    pub event: MachineEvent,

    /// Target machine for start, stop, and delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<Uuid>,

    /// Template to provision from on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<Uuid>,

    /// Owning user on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,

    /// Requested sandbox port on create.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

/// A validated machine lifecycle command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineCommand {
    /// Provision a machine.
    Create {
        /// Template to build from.
        template_id: Uuid,
        /// Owning user.
        user_id: Uuid,
        /// Requested port, or `None` for the configured default.
        port: Option<u16>,
    },
    /// Start an existing machine.
    Start {
        /// Target machine.
        machine_id: Uuid,
    },
    /// Stop an existing machine.
    Stop {
        /// Target machine.
        machine_id: Uuid,
    },
    /// Delete an existing machine.
    Delete {
        /// Target machine.
        machine_id: Uuid,
    },
}

impl MachineCommand {
    /// The event this command was decoded from.
    #[must_use]
    pub const fn event(&self) -> MachineEvent {
        match self {
            Self::Create { .. } => MachineEvent::Create,
            Self::Start { .. } => MachineEvent::Start,
            Self::Stop { .. } => MachineEvent::Stop,
            Self::Delete { .. } => MachineEvent::Delete,
        }
    }
}

impl MachineMessage {
    /// Build a create message.
    #[must_use]
    pub const fn create(template_id: Uuid, user_id: Uuid, port: Option<u16>) -> Self {
        Self {
            event: MachineEvent::Create,
            machine_id: None,
            template_id: Some(template_id),
            user_id: Some(user_id),
            port,
        }
    }

    /// Build a start, stop, or delete message targeting one machine.
    #[must_use]
    pub const fn targeting(event: MachineEvent, machine_id: Uuid) -> Self {
        Self {
            event,
            machine_id: Some(machine_id),
            template_id: None,
            user_id: None,
            port: None,
        }
    }

    /// Parse a message from a raw delivery payload.
    ///
    /// # Errors
    ///
    /// Returns `ProcessingError::MalformedMessage` when the payload is not a
    /// JSON machine message or names an unknown event.
    pub fn decode(payload: &[u8]) -> Result<Self, ProcessingError> {
        serde_json::from_slice(payload).map_err(ProcessingError::malformed)
    }

    /// Check the identifiers required by the event and produce a command.
    ///
    /// Nil UUIDs are treated as absent.
    ///
    /// # Errors
    ///
    /// Returns `ProcessingError::MalformedMessage` naming the first missing
    /// field, or when a create message requests port 0.
    pub fn validate(&self) -> Result<MachineCommand, ProcessingError> {
        match self.event {
            MachineEvent::Create => {
                let template_id = required(self.template_id, "template_id")?;
                let user_id = required(self.user_id, "user_id")?;
                if self.port == Some(0) {
                    return Err(ProcessingError::malformed("port must be non-zero"));
                }
                Ok(MachineCommand::Create {
                    template_id,
                    user_id,
                    port: self.port,
                })
            }
            MachineEvent::Start => Ok(MachineCommand::Start {
                machine_id: required(self.machine_id, "machine_id")?,
            }),
            MachineEvent::Stop => Ok(MachineCommand::Stop {
                machine_id: required(self.machine_id, "machine_id")?,
            }),
            MachineEvent::Delete => Ok(MachineCommand::Delete {
                machine_id: required(self.machine_id, "machine_id")?,
            }),
        }
    }
}

fn required(value: Option<Uuid>, field: &str) -> Result<Uuid, ProcessingError> {
    value
        .filter(|id| !id.is_nil())
        .ok_or_else(|| ProcessingError::malformed(format!("missing required field '{field}'")))
}

/// Route synchronisation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteMessage {
    /// The routing intent.
    pub event: RouteEvent,
    /// Unique identifier of this routing request.
    pub route_id: Uuid,
    /// Machine whose sandbox the route targets.
    pub machine_id: Uuid,
    /// Owning user of the machine.
    pub user_id: Uuid,
    /// Sandbox port the route forwards to.
    pub port: u16,
}

impl RouteMessage {
    /// Build a route message with a fresh route identifier.
    #[must_use]
    pub fn new(event: RouteEvent, machine_id: Uuid, user_id: Uuid, port: u16) -> Self {
        Self {
            event,
            route_id: Uuid::new_v4(),
            machine_id,
            user_id,
            port,
        }
    }

    /// Parse and validate a message from a raw delivery payload.
    ///
    /// # Errors
    ///
    /// Returns `ProcessingError::MalformedMessage` when the payload does not
    /// parse, a required identifier is nil, or the port is 0.
    pub fn decode(payload: &[u8]) -> Result<Self, ProcessingError> {
        let message: Self = serde_json::from_slice(payload).map_err(ProcessingError::malformed)?;
        required(Some(message.machine_id), "machine_id")?;
        required(Some(message.user_id), "user_id")?;
        if message.port == 0 {
            return Err(ProcessingError::malformed("port must be non-zero"));
        }
        Ok(message)
    }

    /// The subdomain this message addresses under `base_domain`.
    #[must_use]
    pub fn subdomain(&self, base_domain: &str) -> String {
        generate_subdomain(self.machine_id, self.user_id, self.port, base_domain)
    }
}

/// Derive the public subdomain for a machine.
///
/// The result is `"{port}-{machine prefix}-{user prefix}.{base_domain}"` where
/// each prefix is the first eight characters of the canonical hyphenated UUID,
/// which is exactly its first group. Two machines whose identifiers share a
/// first group and that belong to users whose identifiers share a first group
/// receive the same subdomain for the same port.
#[must_use]
pub fn generate_subdomain(machine_id: Uuid, user_id: Uuid, port: u16, base_domain: &str) -> String {
    let (machine_prefix, ..) = machine_id.as_fields();
    let (user_prefix, ..) = user_id.as_fields();
    format!("{port}-{machine_prefix:08x}-{user_prefix:08x}.{base_domain}")
}

/// Container name used for a machine's sandbox.
#[must_use]
pub fn sandbox_name(machine_id: Uuid) -> String {
    format!("{SANDBOX_NAME_PREFIX}-{machine_id}")
}

/// Key under which delivery attempts are counted.
///
/// Uses the broker message identifier when the publisher set one, otherwise
/// the hex SHA-256 digest of the payload. Create deduplication does not use
/// the digest fallback.
#[must_use]
pub fn idempotency_key(message_id: Option<&str>, payload: &[u8]) -> String {
    message_id
        .filter(|id| !id.trim().is_empty())
        .map_or_else(|| hex::encode(Sha256::digest(payload)), str::to_owned)
}
