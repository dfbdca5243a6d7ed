//! kvlease operator CLI
//!
//! Wires configuration, logging and shutdown handling around the lock and
//! store crates. The binary in `main.rs` is a thin wrapper over this library.

pub mod command;
pub mod config;
pub mod startup;
