//! Book lifecycle state machine.
//!
//! Every status mutation in the crate goes through [`transition`]; an
//! illegal pair is rejected with the allowed set for the current state,
//! never silently coerced.

use crate::book::BookStatus;
use crate::error::BusinessRuleError;

/// Statuses reachable from `from` in a single step.
pub fn allowed_transitions(from: BookStatus) -> &'static [BookStatus] {
    match from {
        BookStatus::Draft => &[BookStatus::Processing],
        BookStatus::Processing => &[BookStatus::Completed, BookStatus::Failed],
        // A completed book may be regenerated.
        BookStatus::Completed => &[BookStatus::Processing],
        BookStatus::Failed => &[BookStatus::Draft, BookStatus::Processing],
    }
}

/// Validates a status change and returns the new status.
pub fn transition(from: BookStatus, to: BookStatus) -> Result<BookStatus, BusinessRuleError> {
    let allowed = allowed_transitions(from);
    if allowed.contains(&to) {
        Ok(to)
    } else {
        Err(BusinessRuleError::InvalidTransition {
            from,
            to,
            allowed: allowed.to_vec(),
        })
    }
}
