//! Transaction status machine and phase enums.

use serde::{Deserialize, Serialize};

/// The status of a TCC transaction in its lifecycle.
///
/// State transitions:
/// ```text
/// Trying ──┬──► Confirming ──┬──► Confirmed
///          │                 └──► Stuck
///          └──► Canceling ───┬──► Canceled
///                            └──► Stuck
/// ```
///
/// `Stuck` only leaves through an explicit operator re-drive, which returns
/// the transaction to the phase it was stuck in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    /// Participants are being registered or the Try phase is running.
    #[default]
    Trying,

    /// Every Try succeeded; Confirm is in progress.
    Confirming,

    /// Every participant confirmed (terminal state).
    Confirmed,

    /// A Try failed; Cancel is in progress.
    Canceling,

    /// Every Try-successful participant was cancelled (terminal state).
    Canceled,

    /// Confirm or Cancel exhausted its retries; needs an operator.
    Stuck,
}

impl TransactionStatus {
    /// Returns true if the transaction may move from `self` to `next`.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Trying, Confirming)
                | (Trying, Canceling)
                | (Confirming, Confirmed)
                | (Confirming, Stuck)
                | (Canceling, Canceled)
                | (Canceling, Stuck)
                | (Stuck, Confirming)
                | (Stuck, Canceling)
        )
    }

    /// Returns true if no further protocol work happens without outside action.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Confirmed | TransactionStatus::Canceled | TransactionStatus::Stuck
        )
    }

    /// Returns true if every participant confirmed.
    pub fn is_confirmed(&self) -> bool {
        matches!(self, TransactionStatus::Confirmed)
    }

    /// Returns true if the coordinator is expected to keep driving this transaction.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Trying => "TRYING",
            TransactionStatus::Confirming => "CONFIRMING",
            TransactionStatus::Confirmed => "CONFIRMED",
            TransactionStatus::Canceling => "CANCELING",
            TransactionStatus::Canceled => "CANCELED",
            TransactionStatus::Stuck => "STUCK",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A phase of the TCC protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Try,
    Confirm,
    Cancel,
}

impl Phase {
    /// Returns the phase name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Try => "TRY",
            Phase::Confirm => "CONFIRM",
            Phase::Cancel => "CANCEL",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TRY" => Ok(Phase::Try),
            "CONFIRM" => Ok(Phase::Confirm),
            "CANCEL" => Ok(Phase::Cancel),
            other => Err(format!("unknown phase: {other}")),
        }
    }
}

/// Outcome of a participant in one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseOutcome {
    #[default]
    Pending,
    Success,
    Failed,
}

impl PhaseOutcome {
    /// Returns the outcome name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseOutcome::Pending => "PENDING",
            PhaseOutcome::Success => "SUCCESS",
            PhaseOutcome::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for PhaseOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PhaseOutcome::Pending),
            "SUCCESS" => Ok(PhaseOutcome::Success),
            "FAILED" => Ok(PhaseOutcome::Failed),
            other => Err(format!("unknown phase outcome: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_trying() {
        assert_eq!(TransactionStatus::default(), TransactionStatus::Trying);
    }

    #[test]
    fn test_confirm_path_transitions() {
        use TransactionStatus::*;
        assert!(Trying.can_transition_to(Confirming));
        assert!(Confirming.can_transition_to(Confirmed));
        assert!(Confirming.can_transition_to(Stuck));
        assert!(!Confirming.can_transition_to(Canceling));
        assert!(!Confirmed.can_transition_to(Confirming));
    }

    #[test]
    fn test_cancel_path_transitions() {
        use TransactionStatus::*;
        assert!(Trying.can_transition_to(Canceling));
        assert!(Canceling.can_transition_to(Canceled));
        assert!(Canceling.can_transition_to(Stuck));
        assert!(!Canceling.can_transition_to(Confirming));
        assert!(!Canceled.can_transition_to(Canceling));
    }

    #[test]
    fn test_stuck_only_returns_to_a_phase() {
        use TransactionStatus::*;
        assert!(Stuck.can_transition_to(Confirming));
        assert!(Stuck.can_transition_to(Canceling));
        assert!(!Stuck.can_transition_to(Confirmed));
        assert!(!Stuck.can_transition_to(Trying));
        assert!(!Trying.can_transition_to(Stuck));
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TransactionStatus::Trying.is_terminal());
        assert!(!TransactionStatus::Confirming.is_terminal());
        assert!(!TransactionStatus::Canceling.is_terminal());
        assert!(TransactionStatus::Confirmed.is_terminal());
        assert!(TransactionStatus::Canceled.is_terminal());
        assert!(TransactionStatus::Stuck.is_terminal());
        assert!(TransactionStatus::Confirming.is_in_flight());
    }

    #[test]
    fn test_serialization_uses_wire_names() {
        let json = serde_json::to_string(&TransactionStatus::Canceling).unwrap();
        assert_eq!(json, "\"CANCELING\"");
        let phase: Phase = serde_json::from_str("\"CONFIRM\"").unwrap();
        assert_eq!(phase, Phase::Confirm);
        let outcome: PhaseOutcome = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(outcome, PhaseOutcome::Failed);
    }

    #[test]
    fn test_phase_and_outcome_parse_their_display_form() {
        for phase in [Phase::Try, Phase::Confirm, Phase::Cancel] {
            assert_eq!(phase.to_string().parse::<Phase>().unwrap(), phase);
        }
        for outcome in [
            PhaseOutcome::Pending,
            PhaseOutcome::Success,
            PhaseOutcome::Failed,
        ] {
            assert_eq!(outcome.to_string().parse::<PhaseOutcome>().unwrap(), outcome);
        }
        assert!("COMMIT".parse::<Phase>().is_err());
    }
}
