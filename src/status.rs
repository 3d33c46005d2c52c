/// Handle for one logical transaction, returned by `begin`.
///
/// Must be passed back to exactly one of
/// [`TransactionManager::commit`](crate::TransactionManager::commit) or
/// [`TransactionManager::rollback`](crate::TransactionManager::rollback),
/// on the same context, before any scope begun earlier is completed.
#[derive(Debug)]
pub struct TransactionStatus {
    pub(crate) context: u64,
    pub(crate) scope: u64,
    /// Physical transaction this scope runs in; `None` when non-transactional.
    pub(crate) transaction: Option<u64>,
    pub(crate) new_transaction: bool,
    pub(crate) new_resource: bool,
    pub(crate) suspended: bool,
    pub(crate) savepoint: Option<String>,
    pub(crate) read_only: bool,
    pub(crate) name: Option<String>,
    pub(crate) local_rollback_only: bool,
    pub(crate) completed: bool,
}

impl TransactionStatus {
    /// Did this `begin` start the physical transaction?
    pub fn is_new_transaction(&self) -> bool {
        self.new_transaction
    }

    /// Did this `begin` acquire a resource or suspend the previous one?
    pub fn is_new_resource(&self) -> bool {
        self.new_resource
    }

    /// Whether the scope runs inside a physical transaction at all.
    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn transaction_id(&self) -> Option<u64> {
        self.transaction
    }

    pub fn has_savepoint(&self) -> bool {
        self.savepoint.is_some()
    }

    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_deref()
    }

    /// Whether completing this scope restores a suspended transaction.
    pub fn has_suspended_resource(&self) -> bool {
        self.suspended
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Requests that this scope end in rollback even if `commit` is called.
    ///
    /// Committing a locally marked scope rolls back without reporting
    /// [`Error::UnexpectedRollback`](crate::Error::UnexpectedRollback); for a
    /// joined scope it marks the whole physical transaction rollback-only.
    pub fn set_rollback_only(&mut self) {
        self.local_rollback_only = true;
    }

    pub fn is_local_rollback_only(&self) -> bool {
        self.local_rollback_only
    }
}
