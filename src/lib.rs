#![forbid(unsafe_code)]

//! Session lifecycle and connection health supervisor for messaging
//! channels backed by browser-automation processes.

pub mod config;
pub mod engine;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod process_table;
pub mod scheduler;
pub mod store;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
