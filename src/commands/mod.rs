//! CLI command implementations for carelink-proxy.
//!
//! This module provides implementations for all CLI subcommands:
//! - `check`: token and connectivity verification
//! - `config`: configuration file generation

pub mod check;
pub mod config;

// Re-export command functions
pub use check::command_check;
pub use config::command_config;
