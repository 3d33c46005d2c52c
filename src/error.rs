/// Boxed error coming out of a resource adapter.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error types for transaction propagation
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The coordinator was used in a way that violates the transaction
    /// nesting discipline (double completion, out-of-order completion,
    /// `MANDATORY` without a transaction, `NEVER` inside one, ...).
    #[error("Illegal transaction state: {0}")]
    IllegalTransactionState(String),

    /// A commit was requested on a transaction that another participant
    /// already marked rollback-only. The transaction has been rolled back
    /// (or will be, by its outermost owner).
    #[error("Unexpected rollback: {0}")]
    UnexpectedRollback(String),

    /// Failure reported by the resource adapter, passed through unchanged.
    #[error("Resource failure: {0}")]
    ResourceFailure(#[source] BoxError),
}

impl Error {
    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalTransactionState(msg.into())
    }

    pub(crate) fn resource(err: impl Into<BoxError>) -> Self {
        Error::ResourceFailure(err.into())
    }

    /// Returns `true` for [`Error::UnexpectedRollback`].
    pub fn is_unexpected_rollback(&self) -> bool {
        matches!(self, Error::UnexpectedRollback(_))
    }

    /// Returns `true` for [`Error::IllegalTransactionState`].
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Error::IllegalTransactionState(_))
    }

    /// Returns the adapter error if this is a [`Error::ResourceFailure`].
    pub fn resource_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            Error::ResourceFailure(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::ResourceFailure(Box::new(err))
    }
}

/// Result type alias for transaction operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_failure_keeps_the_adapter_error() {
        let err = Error::from(sqlx::Error::RowNotFound);
        let inner = err.resource_error().unwrap();
        assert!(matches!(
            inner.downcast_ref::<sqlx::Error>(),
            Some(sqlx::Error::RowNotFound)
        ));
        assert!(!err.is_illegal_state());
    }

    #[test]
    fn display_names_the_category() {
        let err = Error::UnexpectedRollback("marked rollback-only".into());
        assert!(err.is_unexpected_rollback());
        assert_eq!(err.to_string(), "Unexpected rollback: marked rollback-only");
    }
}
