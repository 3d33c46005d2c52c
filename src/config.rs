/// Behavior switches for [`TransactionManager`](crate::TransactionManager).
///
/// # Examples
///
/// ```rust
/// use sqlx_tx_propagation::ManagerConfig;
///
/// let config = ManagerConfig::default()
///     .with_validate_existing_transaction(true)
///     .with_nested_transaction_allowed(false);
///
/// assert!(config.fail_early_on_global_rollback_only);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Report `UnexpectedRollback` as soon as a joined participant commits
    /// into a transaction already marked rollback-only, instead of leaving
    /// the report to the outermost commit.
    pub fail_early_on_global_rollback_only: bool,
    /// Allow `NESTED` to run on savepoints of the active transaction.
    pub nested_transaction_allowed: bool,
    /// Reject joins whose isolation level or read-only flag conflict with
    /// the active transaction.
    pub validate_existing_transaction: bool,
    /// Attempt a physical rollback when the physical commit fails.
    pub rollback_on_commit_failure: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            fail_early_on_global_rollback_only: true,
            nested_transaction_allowed: true,
            validate_existing_transaction: false,
            rollback_on_commit_failure: false,
        }
    }
}

impl ManagerConfig {
    pub fn with_fail_early_on_global_rollback_only(mut self, value: bool) -> Self {
        self.fail_early_on_global_rollback_only = value;
        self
    }

    pub fn with_nested_transaction_allowed(mut self, value: bool) -> Self {
        self.nested_transaction_allowed = value;
        self
    }

    pub fn with_validate_existing_transaction(mut self, value: bool) -> Self {
        self.validate_existing_transaction = value;
        self
    }

    pub fn with_rollback_on_commit_failure(mut self, value: bool) -> Self {
        self.rollback_on_commit_failure = value;
        self
    }
}
