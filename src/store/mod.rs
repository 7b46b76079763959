//! Backing store access
//!
//! This module provides:
//! - The typed command table (`Command`, `Reply`)
//! - The `Connector`/`Transport` seam the pool talks through
//! - An in-process store with fault injection

pub mod memory;
pub mod transport;
pub mod types;

pub use memory::{MemoryConnector, MemoryStore, MemoryTransport};
pub use transport::{Connector, StoreError, Transport};
pub use types::{Command, Reply};

use std::sync::Arc;

/// Build the connector for a store URL
///
/// Only the in-process store (`memory://`) is built in; other transports
/// plug in through [`Connector`].
pub fn connector_for(url: &str) -> Result<Arc<dyn Connector>, StoreError> {
    match url.trim() {
        "memory://" | "memory" => Ok(Arc::new(MemoryConnector::new(MemoryStore::new()))),
        other => Err(StoreError::Connect(format!("unsupported store url: {}", other))),
    }
}
