//! Pipeline lifecycle

use serde::Serialize;
use std::fmt;

/// Lifecycle of a pipeline.
///
/// `Created -> Running -> Draining -> Stopped`, or `Running -> Failed` when
/// the reader hits a fatal condition. `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Created,
    Running,
    Draining,
    Stopped,
    Failed,
}

impl PipelineState {
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Created, Running) | (Running, Draining) | (Running, Failed) | (Draining, Stopped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Stopped | PipelineState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Created => "created",
            PipelineState::Running => "running",
            PipelineState::Draining => "draining",
            PipelineState::Stopped => "stopped",
            PipelineState::Failed => "failed",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PipelineState::*;

    #[test]
    fn test_allowed_transitions() {
        assert!(Created.can_transition_to(Running));
        assert!(Running.can_transition_to(Draining));
        assert!(Running.can_transition_to(Failed));
        assert!(Draining.can_transition_to(Stopped));

        assert!(!Created.can_transition_to(Stopped));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(!Draining.can_transition_to(Running));
    }

    #[test]
    fn test_terminal_states() {
        assert!(Stopped.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Running.is_terminal());
        assert_eq!(Draining.to_string(), "draining");
    }
}
