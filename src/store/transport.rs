//! Transport seam between the pool and the backing store
//!
//! The pool never speaks a wire protocol itself. It asks a [`Connector`] for
//! new [`Transport`]s and runs typed [`Command`]s over them.

use async_trait::async_trait;
use std::time::Duration;

use super::types::{Command, Reply};
use crate::purpose::Purpose;

/// Errors reported by a transport
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Command rejected: {0}")]
    Command(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether the failure concerns the transport rather than one command
    pub fn is_connection_level(&self) -> bool {
        matches!(self, StoreError::Connect(_) | StoreError::Disconnected(_))
    }
}

/// One live connection to the backing store
#[async_trait]
pub trait Transport: Send {
    async fn execute(&mut self, command: &Command) -> Result<Reply, StoreError>;

    /// Close the connection. Further commands fail with `Disconnected`.
    async fn close(&mut self);
}

/// Factory for transports
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, purpose: Purpose) -> Result<Box<dyn Transport>, StoreError>;

    /// Human-readable target, for logs
    fn describe(&self) -> String;
}
