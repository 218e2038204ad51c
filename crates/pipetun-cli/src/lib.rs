//! pipetun command-line client
//!
//! Starts, stops and lists tunnels to platform runs. A tunnel is normally
//! served by a detached copy of this binary; the copy is found again by
//! scanning the process table for its arguments.

pub mod args;
pub mod commands;
pub mod config;
pub mod conflict;
pub mod error;
pub mod launcher;
pub mod metadata;
pub mod ports;
pub mod registry;
pub mod ssh;

pub use error::{Result, TunnelError};
