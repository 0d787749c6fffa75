//! Transaction status and the legal-transition table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FateError, Result};
use crate::id::FateId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    /// Row exists but the transaction has not been seeded.
    New,
    /// Seeded and waiting for a worker to claim it.
    Submitted,
    /// A worker is (or was) driving the step stack.
    InProgress,
    /// All steps completed; terminal.
    Successful,
    /// A step failed or the transaction was cancelled; compensation pending.
    FailedInProgress,
    /// Compensation finished; terminal.
    Failed,
    /// No row exists for the id.
    Unknown,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Successful | TxStatus::Failed)
    }

    /// Statuses the executor will pick work up in.
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            TxStatus::New | TxStatus::Submitted | TxStatus::InProgress | TxStatus::FailedInProgress
        )
    }

    /// The legal transitions. Everything else is a contract violation and
    /// is rejected by `ReservedTx::set_status`.
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (New, Submitted)
                | (New, FailedInProgress)
                | (Submitted, InProgress)
                | (Submitted, FailedInProgress)
                | (InProgress, Successful)
                | (InProgress, FailedInProgress)
                | (FailedInProgress, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::New => "NEW",
            TxStatus::Submitted => "SUBMITTED",
            TxStatus::InProgress => "IN_PROGRESS",
            TxStatus::Successful => "SUCCESSFUL",
            TxStatus::FailedInProgress => "FAILED_IN_PROGRESS",
            TxStatus::Failed => "FAILED",
            TxStatus::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TxStatus {
    type Err = FateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "NEW" => Ok(TxStatus::New),
            "SUBMITTED" => Ok(TxStatus::Submitted),
            "IN_PROGRESS" => Ok(TxStatus::InProgress),
            "SUCCESSFUL" => Ok(TxStatus::Successful),
            "FAILED_IN_PROGRESS" => Ok(TxStatus::FailedInProgress),
            "FAILED" => Ok(TxStatus::Failed),
            "UNKNOWN" => Ok(TxStatus::Unknown),
            other => Err(FateError::Serialization(format!(
                "unrecognized transaction status: {other}"
            ))),
        }
    }
}

/// Shared guard used by store implementations before writing a new status.
pub fn check_transition(id: FateId, from: TxStatus, to: TxStatus) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(FateError::wrong_status(
            id,
            format!("a status that may transition to {to}"),
            from,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use TxStatus::*;
        let legal = [
            (New, Submitted),
            (New, FailedInProgress),
            (Submitted, InProgress),
            (Submitted, FailedInProgress),
            (InProgress, Successful),
            (InProgress, FailedInProgress),
            (FailedInProgress, Failed),
        ];
        for (from, to) in legal {
            assert!(from.can_transition_to(to), "{from} -> {to} should be legal");
        }
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        use TxStatus::*;
        let all = [
            New,
            Submitted,
            InProgress,
            Successful,
            FailedInProgress,
            Failed,
            Unknown,
        ];
        let legal_count = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .count();
        assert_eq!(legal_count, 7);

        // A couple of the important negatives.
        assert!(!Successful.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(FailedInProgress));
        assert!(!InProgress.can_transition_to(Submitted));
        assert!(!InProgress.can_transition_to(Failed));
    }

    #[test]
    fn test_status_string_round_trip() {
        use TxStatus::*;
        for status in [
            New,
            Submitted,
            InProgress,
            Successful,
            FailedInProgress,
            Failed,
            Unknown,
        ] {
            assert_eq!(status.as_str().parse::<TxStatus>().unwrap(), status);
        }
    }
}
