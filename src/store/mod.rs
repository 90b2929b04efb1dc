//! Session state and on-disk claims.
//!
//! Covers the in-memory session registry and the lock artifacts that mark
//! exclusive ownership of each session's persistent storage.

pub mod lock_repo;
pub mod session_store;
