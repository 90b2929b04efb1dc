//! Session supervision.
//!
//! Covers boot-time cleanup, cache warm-up, startup sequencing, liveness probing, the
//! periodic health monitor, and serialized recovery of unhealthy sessions.

pub mod health_monitor;
pub mod preload;
pub mod probe;
pub mod reaper;
pub mod recovery;
pub mod startup;
pub mod supervisor;
