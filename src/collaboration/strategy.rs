//! Collaboration strategies, per spec §4.3.

use serde::{Deserialize, Serialize};

/// How a CollaborationRequest's participants are orchestrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    /// Run participants in list order; each receives the prior's output
    /// appended to the prompt. Terminal output is the last participant's.
    Sequential,
    /// Submit one task per participant concurrently; await all within the
    /// deadline.
    Parallel,
    /// Like Sequential, but a participant may emit a stop signal that ends
    /// the cascade early with its output as terminal.
    Cascade,
    /// Parallel, then a dedicated COORDINATOR agent reconciles all outputs;
    /// its output is terminal.
    Swarm,
}
