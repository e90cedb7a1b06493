//! Command-line argument definitions for cestx.

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use crate::contracts::{MachineEvent, MachineMessage};

/// Command-line interface for cestx.
#[derive(Debug, Parser)]
#[command(name = "cestx")]
#[command(
    author,
    version,
    about = "On-demand sandbox machines with reverse-proxy route synchronisation"
)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to configuration file.
    #[arg(long, global = true)]
    pub config: Option<Utf8PathBuf>,

    /// Container engine socket path or URL.
    #[arg(long, global = true)]
    pub engine_socket: Option<String>,

    /// Log filter directive (overridden by `RUST_LOG`).
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the machine orchestrator consumers.
    Orchestrator,

    /// Run the route synchronizer consumers.
    Router,

    /// Publish one machine lifecycle message.
    Publish(PublishArgs),
}

/// Machine event selectable on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventArg {
    /// `machine.create`
    Create,
    /// `machine.start`
    Start,
    /// `machine.stop`
    Stop,
    /// `machine.delete`
    Delete,
}

impl From<EventArg> for MachineEvent {
    fn from(arg: EventArg) -> Self {
        match arg {
            EventArg::Create => Self::Create,
            EventArg::Start => Self::Start,
            EventArg::Stop => Self::Stop,
            EventArg::Delete => Self::Delete,
        }
    }
}

/// Arguments for the `publish` subcommand.
#[derive(Debug, Parser)]
pub struct PublishArgs {
    /// Lifecycle event to publish.
    #[arg(value_enum)]
    pub event: EventArg,

    /// Target machine for start, stop, and delete.
    #[arg(long)]
    pub machine_id: Option<Uuid>,

    /// Template for create.
    #[arg(long)]
    pub template_id: Option<Uuid>,

    /// Owning user for create.
    #[arg(long)]
    pub user_id: Option<Uuid>,

    /// Sandbox port for create.
    #[arg(long)]
    pub port: Option<u16>,
}

impl PublishArgs {
    /// The wire message these arguments describe.
    #[must_use]
    pub fn to_message(&self) -> MachineMessage {
        MachineMessage {
            event: self.event.into(),
            machine_id: self.machine_id,
            template_id: self.template_id,
            user_id: self.user_id,
            port: self.port,
        }
    }
}
