//! Pure propagation decision table.

use crate::definition::Propagation;

/// What the coordinator must do for a `begin` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Acquire a resource and start a new physical transaction.
    StartNew,
    /// Participate in the active physical transaction.
    Join,
    /// Participate in the active physical transaction behind a savepoint.
    JoinWithSavepoint,
    /// Suspend the active transaction, then start a new physical one.
    SuspendAndStartNew,
    /// Run without a transaction; nothing is acquired.
    NonTransactional,
    /// Suspend the active transaction, then run without one.
    SuspendAndRunNonTransactional,
    /// The behavior requires an active transaction and there is none.
    ErrorNoExisting,
    /// The behavior forbids an active transaction and there is one.
    ErrorExistingPresent,
}

impl Action {
    /// Whether the action detaches the currently active transaction.
    pub fn suspends(&self) -> bool {
        matches!(
            self,
            Action::SuspendAndStartNew | Action::SuspendAndRunNonTransactional
        )
    }
}

/// Stateless resolver mapping `(propagation, active transaction?)` to an [`Action`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PropagationResolver;

impl PropagationResolver {
    pub fn resolve(&self, propagation: Propagation, active: bool) -> Action {
        resolve(propagation, active)
    }
}

/// Decides how a `begin` request relates to the active transaction, if any.
///
/// # Examples
///
/// ```rust
/// use sqlx_tx_propagation::{resolve, Action, Propagation};
///
/// assert_eq!(resolve(Propagation::Required, true), Action::Join);
/// assert_eq!(resolve(Propagation::RequiresNew, true), Action::SuspendAndStartNew);
/// assert_eq!(resolve(Propagation::Mandatory, false), Action::ErrorNoExisting);
/// ```
pub fn resolve(propagation: Propagation, active: bool) -> Action {
    use Propagation::*;

    match (propagation, active) {
        (Required, false) => Action::StartNew,
        (Required, true) => Action::Join,
        (RequiresNew, false) => Action::StartNew,
        (RequiresNew, true) => Action::SuspendAndStartNew,
        (Mandatory, false) => Action::ErrorNoExisting,
        (Mandatory, true) => Action::Join,
        (Never, false) => Action::NonTransactional,
        (Never, true) => Action::ErrorExistingPresent,
        (Supports, false) => Action::NonTransactional,
        (Supports, true) => Action::Join,
        (NotSupported, false) => Action::NonTransactional,
        (NotSupported, true) => Action::SuspendAndRunNonTransactional,
        (Nested, false) => Action::StartNew,
        (Nested, true) => Action::JoinWithSavepoint,
    }
}
