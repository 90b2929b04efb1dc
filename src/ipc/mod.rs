//! Local IPC layer for `channel-supervisor-ctl` interaction.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server that accepts JSON-line administrative commands.

pub mod server;
