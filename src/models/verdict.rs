//! Liveness probe verdicts.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Outcome of a single liveness probe against an engine process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The process answered the liveness query within the timeout.
    Healthy,
    /// The process exists but did not answer in time. May recover on its own.
    Unresponsive,
    /// The process is confirmed dead, or the session owns no process.
    Crashed,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Unresponsive => "unresponsive",
            Self::Crashed => "crashed",
        })
    }
}
