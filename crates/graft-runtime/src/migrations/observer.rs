//! Progress reporting for sequential migration runs.

use std::fmt;

use tokio::sync::mpsc;
use tracing::{error, info};

/// Something that happened during a run, stamp or rollback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationEvent {
    /// Migrations selected for this run, in execution order.
    Pending { names: Vec<String> },
    Applying { name: String },
    Applied { name: String },
    Stamped { name: String },
    RollingBack { name: String },
    RolledBack { name: String },
    Failed { name: String, error: String },
    /// A statement a dry run would have executed.
    DryRunStatement { name: String, statement: String },
}

impl MigrationEvent {
    /// Name of the migration the event is about, if it concerns a single one.
    pub fn migration(&self) -> Option<&str> {
        match self {
            Self::Pending { .. } => None,
            Self::Applying { name }
            | Self::Applied { name }
            | Self::Stamped { name }
            | Self::RollingBack { name }
            | Self::RolledBack { name }
            | Self::Failed { name, .. }
            | Self::DryRunStatement { name, .. } => Some(name),
        }
    }
}

impl fmt::Display for MigrationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending { names } => write!(f, "pending: {}", names.join(", ")),
            Self::Applying { name } => write!(f, "applying: {}", name),
            Self::Applied { name } => write!(f, "applied: {}", name),
            Self::Stamped { name } => write!(f, "stamped: {}", name),
            Self::RollingBack { name } => write!(f, "rolling back: {}", name),
            Self::RolledBack { name } => write!(f, "rolled back: {}", name),
            Self::Failed { name, error } => write!(f, "failed: {}: {}", name, error),
            Self::DryRunStatement { name, statement } => {
                write!(f, "[dry-run] {}: {}", name, statement)
            }
        }
    }
}

/// Receives migration events as they happen.
pub trait MigrationObserver: Send + Sync {
    fn on_event(&self, event: &MigrationEvent);
}

/// Logs events through `tracing`. Used when no observer is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl MigrationObserver for TracingObserver {
    fn on_event(&self, event: &MigrationEvent) {
        match event {
            MigrationEvent::Pending { names } => {
                info!(count = names.len(), "Pending migrations: {:?}", names)
            }
            MigrationEvent::Applying { name } => info!(migration = %name, "Applying migration"),
            MigrationEvent::Applied { name } => info!(migration = %name, "Migration applied"),
            MigrationEvent::Stamped { name } => info!(migration = %name, "Migration stamped"),
            MigrationEvent::RollingBack { name } => {
                info!(migration = %name, "Rolling back migration")
            }
            MigrationEvent::RolledBack { name } => {
                info!(migration = %name, "Migration rolled back")
            }
            MigrationEvent::Failed { name, error } => {
                error!(migration = %name, error = %error, "Migration failed")
            }
            MigrationEvent::DryRunStatement { name, statement } => {
                info!(migration = %name, "[dry-run] {}", statement)
            }
        }
    }
}

/// Forwards events to an unbounded channel. Events are dropped once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<MigrationEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MigrationEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl MigrationObserver for ChannelObserver {
    fn on_event(&self, event: &MigrationEvent) {
        let _ = self.sender.send(event.clone());
    }
}
