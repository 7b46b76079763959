//! storepool - pooled, fault-tolerant connections to a key-value/queue store

pub mod cli;
pub mod config;
pub mod pool;
pub mod purpose;
pub mod store;

pub use config::Config;
pub use pool::{PoolError, PoolManager};
pub use purpose::{Purpose, PurposeMap};
