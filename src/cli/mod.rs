//! CLI module for storepool
//!
//! Operator commands for checking configuration and exercising the pools
//! against the configured store.
//!
//! # Usage
//!
//! ```bash
//! # Validate and print the effective configuration
//! storepool --config storepool.yaml check-config
//!
//! # Drive concurrent traffic through one purpose's pool
//! storepool simulate --purpose cache --operations 10000 --concurrency 32
//!
//! # Print a metrics snapshot as JSON
//! storepool metrics
//! ```

pub mod commands;

pub use commands::{cmd_check_config, cmd_metrics, cmd_simulate, SimulationReport};
