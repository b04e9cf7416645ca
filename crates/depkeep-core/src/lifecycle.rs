use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// States of one orchestration run.
///
/// `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestrationState {
    Pending,
    Validating,
    Applying,
    Verifying,
    Committed,
    RollingBack,
    RolledBack,
}

impl OrchestrationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrchestrationState::Committed | OrchestrationState::RolledBack
        )
    }
}

impl fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestrationState::Pending => "pending",
            OrchestrationState::Validating => "validating",
            OrchestrationState::Applying => "applying",
            OrchestrationState::Verifying => "verifying",
            OrchestrationState::Committed => "committed",
            OrchestrationState::RollingBack => "rolling_back",
            OrchestrationState::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

pub fn validate_transition(
    from: OrchestrationState,
    to: OrchestrationState,
) -> Result<(), CoreError> {
    use OrchestrationState::{
        Applying, Committed, Pending, RolledBack, RollingBack, Validating, Verifying,
    };

    // Pending -> Committed is the empty plan. Verifying -> Validating starts
    // the next step.
    let valid = matches!(
        (from, to),
        (Pending | Verifying, Validating)
            | (Pending | Verifying, Committed)
            | (Validating, Applying)
            | (Applying, Verifying)
            | (Pending | Validating | Applying | Verifying, RollingBack)
            | (RollingBack, RolledBack)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
