use serde::Serialize;
use strum::Display;

use crate::services::ledger::LedgerError;

/// What to do with a job after a failed ledger call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RetryAction {
    /// Permanent failure; the job fails now regardless of remaining attempts.
    None,
    /// Retry resuming the saved invocation.
    SameInvocation,
    /// Retry with the saved invocation discarded.
    NewInvocation,
}

impl RetryAction {
    pub fn is_retry(self) -> bool {
        !matches!(self, RetryAction::None)
    }
}

/// Map a ledger failure to a retry decision.
///
/// Resuming an invocation is only allowed when the ledger applies each
/// invocation id at most once (`exactly_once`); otherwise a timeout on a write
/// fails closed. Unknown failures are never retried. `AlreadyApplied` only
/// reaches here when the worker could not settle it from the commit status.
pub fn classify(error: &LedgerError, exactly_once: bool) -> RetryAction {
    match error {
        LedgerError::Timeout(_) | LedgerError::Unavailable(_) if exactly_once => {
            RetryAction::SameInvocation
        }
        LedgerError::Timeout(_) | LedgerError::Unavailable(_) => RetryAction::None,
        LedgerError::InvalidInvocation(_) => RetryAction::NewInvocation,
        LedgerError::AlreadyApplied(_) | LedgerError::Rejected(_) | LedgerError::Unknown(_) => {
            RetryAction::None
        }
    }
}
