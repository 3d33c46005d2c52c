use crate::config::ManagerConfig;
use crate::context::{PhysicalTransaction, TransactionContext};
use crate::definition::TransactionDefinition;
use crate::error::{Error, Result};
use crate::propagation::{Action, PropagationResolver};
use crate::resource::ResourceProvider;
use crate::status::TransactionStatus;
use tracing::{debug, warn};

/// Coordinates logical transactions over physical ones.
///
/// `begin` decides, from the requested [`Propagation`](crate::Propagation)
/// and the state of the [`TransactionContext`], whether to join the active
/// physical transaction, start a new one (suspending the active one if
/// needed), or refuse. Only the participant that started a physical
/// transaction commits or rolls it back; joined participants can only mark
/// it rollback-only.
///
/// The manager itself holds no per-call state and can be cloned freely
/// (the resource provider is expected to be a shared pool handle).
///
/// # Examples
///
/// ```rust
/// use sqlx_tx_propagation::{InMemoryResource, TransactionContext, TransactionDefinition, TransactionManager};
///
/// # async fn example() -> sqlx_tx_propagation::Result<()> {
/// let resource = InMemoryResource::new();
/// let manager = TransactionManager::new(resource.clone());
/// let mut ctx = TransactionContext::new();
///
/// let mut outer = manager.begin(&mut ctx, &TransactionDefinition::required()).await?;
/// let mut inner = manager.begin(&mut ctx, &TransactionDefinition::required()).await?;
/// assert!(outer.is_new_transaction());
/// assert!(!inner.is_new_transaction());
///
/// manager.commit(&mut ctx, &mut inner).await?;
/// manager.commit(&mut ctx, &mut outer).await?;
/// assert_eq!(resource.commits(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct TransactionManager<R> {
    resource: R,
    config: ManagerConfig,
    resolver: PropagationResolver,
}

impl<R: ResourceProvider> TransactionManager<R> {
    /// Creates a manager over `resource` with the default [`ManagerConfig`].
    pub fn new(resource: R) -> Self {
        Self::with_config(resource, ManagerConfig::default())
    }

    /// Creates a manager over `resource` with explicit configuration.
    pub fn with_config(resource: R, config: ManagerConfig) -> Self {
        Self {
            resource,
            config,
            resolver: PropagationResolver,
        }
    }

    /// Returns the underlying resource provider.
    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Returns the manager's configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Begins a logical transaction.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalTransactionState`] for `MANDATORY` without an active
    ///   transaction, `NEVER` with one, a disallowed `NESTED`, or a join that
    ///   fails validation. The context is left untouched.
    /// - [`Error::ResourceFailure`] if acquiring the resource or creating the
    ///   savepoint fails. A transaction suspended for `REQUIRES_NEW` is
    ///   restored before the error is returned.
    pub async fn begin(
        &self,
        ctx: &mut TransactionContext<R::Handle>,
        definition: &TransactionDefinition,
    ) -> Result<TransactionStatus> {
        let action = self
            .resolver
            .resolve(definition.propagation, ctx.is_actual_transaction_active());
        debug!(
            context = ctx.id(),
            propagation = %definition.propagation,
            ?action,
            name = definition.name.as_deref(),
            "Resolved transaction propagation"
        );

        if action.suspends() {
            ctx.suspend();
            debug!(context = ctx.id(), "Suspending current transaction");
        }

        match action {
            Action::ErrorNoExisting => Err(Error::illegal_state(format!(
                "No existing transaction found for transaction marked with propagation '{}'",
                definition.propagation
            ))),
            Action::ErrorExistingPresent => Err(Error::illegal_state(format!(
                "Existing transaction found for transaction marked with propagation '{}'",
                definition.propagation
            ))),
            Action::StartNew => self.start_transaction(ctx, definition, false).await,
            Action::SuspendAndStartNew => {
                match self.start_transaction(ctx, definition, true).await {
                    Ok(status) => Ok(status),
                    Err(err) => {
                        if let Err(resume_err) = ctx.resume() {
                            warn!(error = %resume_err, "Failed to resume suspended transaction");
                        }
                        Err(err)
                    }
                }
            }
            Action::Join => {
                let transaction = self.joinable(ctx, definition)?;
                transaction.add_participant();
                let id = transaction.id();
                debug!(
                    context = ctx.id(),
                    transaction = id,
                    "Participating in existing transaction"
                );
                Ok(open_status(ctx, Some(id), false, false, false, None, definition))
            }
            Action::JoinWithSavepoint => {
                if !self.config.nested_transaction_allowed {
                    return Err(Error::illegal_state(
                        "Transaction manager does not allow nested transactions",
                    ));
                }
                let transaction = self.joinable(ctx, definition)?;
                let savepoint = transaction.next_savepoint_name();
                self.resource
                    .create_savepoint(transaction.handle_mut(), &savepoint)
                    .await
                    .map_err(Error::resource)?;
                transaction.add_participant();
                let id = transaction.id();
                debug!(
                    context = ctx.id(),
                    transaction = id,
                    savepoint = %savepoint,
                    "Creating nested transaction"
                );
                Ok(open_status(ctx, Some(id), false, false, false, Some(savepoint), definition))
            }
            Action::NonTransactional => {
                Ok(open_status(ctx, None, false, false, false, None, definition))
            }
            Action::SuspendAndRunNonTransactional => {
                Ok(open_status(ctx, None, false, true, true, None, definition))
            }
        }
    }

    /// Commits a logical transaction.
    ///
    /// Joined participants only leave the physical transaction; the
    /// physical commit happens when the participant that started it commits.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalTransactionState`] if `status` is already completed,
    ///   belongs to another context, or is not the innermost open scope.
    /// - [`Error::UnexpectedRollback`] if the physical transaction was marked
    ///   rollback-only by another participant. For the outermost participant
    ///   the physical rollback has been performed.
    /// - [`Error::ResourceFailure`] from the adapter. The scope is completed
    ///   and the context cleaned up in every case.
    pub async fn commit(
        &self,
        ctx: &mut TransactionContext<R::Handle>,
        status: &mut TransactionStatus,
    ) -> Result<()> {
        self.check_completable(ctx, status)?;

        if status.local_rollback_only {
            debug!(context = ctx.id(), "Transactional code has requested rollback");
            return self.process_rollback(ctx, status).await;
        }

        if status.transaction.is_none() {
            return complete(ctx, status);
        }

        if let Some(savepoint) = status.savepoint.clone() {
            return self.commit_savepoint(ctx, status, &savepoint).await;
        }

        if !status.new_transaction {
            let Some(transaction) = ctx.active_mut() else {
                return Err(missing_transaction());
            };
            transaction.remove_participant();
            let rollback_only = transaction.is_rollback_only();
            complete(ctx, status)?;
            if rollback_only && self.config.fail_early_on_global_rollback_only {
                return Err(Error::UnexpectedRollback(
                    "Participating transaction has been marked as rollback-only".into(),
                ));
            }
            return Ok(());
        }

        let Some(mut transaction) = ctx.unbind() else {
            return Err(missing_transaction());
        };
        let outcome = if transaction.is_rollback_only() {
            debug!(
                context = ctx.id(),
                transaction = transaction.id(),
                "Global transaction is marked as rollback-only but transactional code requested commit"
            );
            self.resource
                .rollback(transaction.handle_mut())
                .await
                .map_err(Error::resource)
                .and(Err(Error::UnexpectedRollback(
                    "Transaction rolled back because it has been marked as rollback-only".into(),
                )))
        } else {
            debug!(
                context = ctx.id(),
                transaction = transaction.id(),
                "Initiating transaction commit"
            );
            match self.resource.commit(transaction.handle_mut()).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    if self.config.rollback_on_commit_failure {
                        if let Err(rollback_err) = self.resource.rollback(transaction.handle_mut()).await {
                            warn!(error = %rollback_err, "Rollback after commit failure failed");
                        }
                    }
                    Err(Error::resource(err))
                }
            }
        };
        self.finish_physical(ctx, status, transaction, outcome).await
    }

    /// Rolls back a logical transaction.
    ///
    /// A joined participant marks the physical transaction rollback-only;
    /// the physical rollback is left to the participant that started it.
    ///
    /// # Errors
    ///
    /// - [`Error::IllegalTransactionState`] if `status` is already completed,
    ///   belongs to another context, or is not the innermost open scope.
    /// - [`Error::ResourceFailure`] from the adapter.
    pub async fn rollback(
        &self,
        ctx: &mut TransactionContext<R::Handle>,
        status: &mut TransactionStatus,
    ) -> Result<()> {
        self.check_completable(ctx, status)?;
        self.process_rollback(ctx, status).await
    }

    async fn process_rollback(
        &self,
        ctx: &mut TransactionContext<R::Handle>,
        status: &mut TransactionStatus,
    ) -> Result<()> {
        if status.transaction.is_none() {
            return complete(ctx, status);
        }

        if let Some(savepoint) = status.savepoint.clone() {
            let Some(transaction) = ctx.active_mut() else {
                return Err(missing_transaction());
            };
            debug!(savepoint = %savepoint, "Rolling back transaction to savepoint");
            let outcome = self.rollback_savepoint(transaction, &savepoint).await;
            transaction.remove_participant();
            complete(ctx, status)?;
            return outcome;
        }

        if !status.new_transaction {
            let Some(transaction) = ctx.active_mut() else {
                return Err(missing_transaction());
            };
            debug!(
                transaction = transaction.id(),
                "Participating transaction failed - marking existing transaction as rollback-only"
            );
            transaction.mark_rollback_only();
            transaction.remove_participant();
            return complete(ctx, status);
        }

        let Some(mut transaction) = ctx.unbind() else {
            return Err(missing_transaction());
        };
        debug!(
            context = ctx.id(),
            transaction = transaction.id(),
            "Initiating transaction rollback"
        );
        let outcome = self
            .resource
            .rollback(transaction.handle_mut())
            .await
            .map_err(Error::resource);
        self.finish_physical(ctx, status, transaction, outcome).await
    }

    async fn start_transaction(
        &self,
        ctx: &mut TransactionContext<R::Handle>,
        definition: &TransactionDefinition,
        suspended: bool,
    ) -> Result<TransactionStatus> {
        let handle = self
            .resource
            .acquire(definition)
            .await
            .map_err(Error::resource)?;
        let id = ctx.next_transaction_id();
        debug!(
            context = ctx.id(),
            transaction = id,
            propagation = %definition.propagation,
            "Creating new transaction"
        );
        ctx.bind(PhysicalTransaction::new(id, handle, definition));
        Ok(open_status(ctx, Some(id), true, true, suspended, None, definition))
    }

    async fn commit_savepoint(
        &self,
        ctx: &mut TransactionContext<R::Handle>,
        status: &mut TransactionStatus,
        savepoint: &str,
    ) -> Result<()> {
        let Some(transaction) = ctx.active_mut() else {
            return Err(missing_transaction());
        };
        let outcome = if transaction.is_rollback_only() {
            self.rollback_savepoint(transaction, savepoint)
                .await
                .and(Err(Error::UnexpectedRollback(
                    "Nested transaction rolled back because the enclosing transaction has been marked as rollback-only".into(),
                )))
        } else {
            debug!(savepoint = %savepoint, "Releasing transaction savepoint");
            self.resource
                .release_savepoint(transaction.handle_mut(), savepoint)
                .await
                .map_err(Error::resource)
        };
        transaction.remove_participant();
        complete(ctx, status)?;
        outcome
    }

    async fn rollback_savepoint(
        &self,
        transaction: &mut PhysicalTransaction<R::Handle>,
        savepoint: &str,
    ) -> Result<()> {
        let rolled_back = self
            .resource
            .rollback_to_savepoint(transaction.handle_mut(), savepoint)
            .await;
        // Work done since the savepoint may still be in the transaction.
        if let Err(err) = rolled_back {
            warn!(
                transaction = transaction.id(),
                savepoint = %savepoint,
                error = %err,
                "Rollback to savepoint failed - marking transaction as rollback-only"
            );
            transaction.mark_rollback_only();
            return Err(Error::resource(err));
        }
        self.resource
            .release_savepoint(transaction.handle_mut(), savepoint)
            .await
            .map_err(Error::resource)
    }

    /// Releases the handle of a finished physical transaction and closes the
    /// scope. The outcome of the physical commit/rollback wins over a
    /// release failure.
    async fn finish_physical(
        &self,
        ctx: &mut TransactionContext<R::Handle>,
        status: &mut TransactionStatus,
        transaction: PhysicalTransaction<R::Handle>,
        outcome: Result<()>,
    ) -> Result<()> {
        let id = transaction.id();
        let released = self
            .resource
            .release(transaction.into_handle())
            .await
            .map_err(Error::resource);
        if status.suspended {
            debug!(context = ctx.id(), transaction = id, "Resuming suspended transaction after completion of inner transaction");
        }
        complete(ctx, status)?;
        match (outcome, released) {
            (Err(err), Err(release_err)) => {
                warn!(transaction = id, error = %release_err, "Failed to release transaction resource");
                Err(err)
            }
            (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    fn check_completable(
        &self,
        ctx: &TransactionContext<R::Handle>,
        status: &TransactionStatus,
    ) -> Result<()> {
        if status.completed {
            return Err(Error::illegal_state(
                "Transaction is already completed - do not call commit or rollback more than once per transaction",
            ));
        }
        if status.context != ctx.id() {
            return Err(Error::illegal_state(format!(
                "Transaction status belongs to context {}, not {}",
                status.context,
                ctx.id()
            )));
        }
        if ctx.innermost_scope() != Some(status.scope) {
            return Err(Error::illegal_state(
                "Transaction completed out of order - inner transactions must complete first",
            ));
        }
        if let Some(id) = status.transaction {
            if ctx.current_transaction().map(|tx| tx.id()) != Some(id) {
                return Err(Error::illegal_state(format!(
                    "Transaction {id} is not bound to the context"
                )));
            }
        }
        Ok(())
    }

    fn joinable<'c>(
        &self,
        ctx: &'c mut TransactionContext<R::Handle>,
        definition: &TransactionDefinition,
    ) -> Result<&'c mut PhysicalTransaction<R::Handle>> {
        let transaction = ctx.active_mut().ok_or_else(missing_transaction)?;
        if self.config.validate_existing_transaction {
            if let Some(isolation) = definition.isolation {
                if transaction.isolation() != Some(isolation) {
                    return Err(Error::illegal_state(format!(
                        "Participating transaction specifies isolation level {} which is incompatible with existing transaction",
                        isolation.as_sql()
                    )));
                }
            }
            if !definition.read_only && transaction.is_read_only() {
                return Err(Error::illegal_state(
                    "Participating transaction is not marked as read-only but existing transaction is",
                ));
            }
        }
        Ok(transaction)
    }
}

fn open_status<H>(
    ctx: &mut TransactionContext<H>,
    transaction: Option<u64>,
    new_transaction: bool,
    new_resource: bool,
    suspended: bool,
    savepoint: Option<String>,
    definition: &TransactionDefinition,
) -> TransactionStatus {
    TransactionStatus {
        context: ctx.id(),
        scope: ctx.open_scope(),
        transaction,
        new_transaction,
        new_resource,
        suspended,
        savepoint,
        read_only: definition.read_only,
        name: definition.name.clone(),
        local_rollback_only: false,
        completed: false,
    }
}

/// Marks the scope completed and restores what it suspended.
fn complete<H>(ctx: &mut TransactionContext<H>, status: &mut TransactionStatus) -> Result<()> {
    status.completed = true;
    ctx.close_scope(status.scope);
    if status.suspended {
        ctx.resume()?;
    }
    Ok(())
}

fn missing_transaction() -> Error {
    Error::illegal_state("No transaction is bound to the context")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{IsolationLevel, Propagation};
    use crate::memory::{InMemoryResource, MemoryHandle, Operation, ResourceEvent};

    fn setup() -> (
        InMemoryResource,
        TransactionManager<InMemoryResource>,
        TransactionContext<MemoryHandle>,
    ) {
        let resource = InMemoryResource::new();
        let manager = TransactionManager::new(resource.clone());
        (resource, manager, TransactionContext::new())
    }

    fn def(propagation: Propagation) -> TransactionDefinition {
        TransactionDefinition::new(propagation)
    }

    #[tokio::test]
    async fn single_commit_and_rollback() {
        let (resource, manager, mut ctx) = setup();

        let mut tx = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        assert!(tx.is_new_transaction());
        assert!(tx.is_new_resource());
        manager.commit(&mut ctx, &mut tx).await.unwrap();

        let mut tx = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        manager.rollback(&mut ctx, &mut tx).await.unwrap();

        assert_eq!(resource.acquisitions(), 2);
        assert_eq!(resource.commits(), 1);
        assert_eq!(resource.rollbacks(), 1);
        assert_eq!(resource.open_handles(), 0);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn required_and_mandatory_join_and_count_participants() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut required = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        assert!(!required.is_new_transaction());
        assert!(!required.is_new_resource());
        assert_eq!(required.transaction_id(), outer.transaction_id());
        assert_eq!(ctx.current_transaction().unwrap().participant_count(), 2);

        let mut mandatory = manager.begin(&mut ctx, &def(Propagation::Mandatory)).await.unwrap();
        assert!(!mandatory.is_new_transaction());
        assert_eq!(ctx.current_transaction().unwrap().participant_count(), 3);

        manager.commit(&mut ctx, &mut mandatory).await.unwrap();
        manager.commit(&mut ctx, &mut required).await.unwrap();
        assert_eq!(ctx.current_transaction().unwrap().participant_count(), 1);
        manager.commit(&mut ctx, &mut outer).await.unwrap();

        assert_eq!(resource.acquisitions(), 1);
        assert_eq!(resource.commits(), 1);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn inner_rollback_marks_rollback_only_and_fails_outer_commit() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut inner = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        manager.rollback(&mut ctx, &mut inner).await.unwrap();
        assert!(ctx.is_rollback_only());
        assert_eq!(resource.rollbacks(), 0);

        let err = manager.commit(&mut ctx, &mut outer).await.unwrap_err();
        assert!(err.is_unexpected_rollback());
        assert!(outer.is_completed());
        assert_eq!(resource.commits(), 0);
        assert_eq!(resource.rollbacks(), 1);
        assert_eq!(resource.open_handles(), 0);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn participant_commit_after_sibling_rollback_fails_early() {
        let (_, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut first = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        manager.rollback(&mut ctx, &mut first).await.unwrap();

        let mut second = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let err = manager.commit(&mut ctx, &mut second).await.unwrap_err();
        assert!(err.is_unexpected_rollback());
        assert!(second.is_completed());
        assert!(ctx.is_rollback_only());

        manager.rollback(&mut ctx, &mut outer).await.unwrap();
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn late_failure_mode_defers_report_to_outermost() {
        let resource = InMemoryResource::new();
        let manager = TransactionManager::with_config(
            resource.clone(),
            ManagerConfig::default().with_fail_early_on_global_rollback_only(false),
        );
        let mut ctx = TransactionContext::new();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut first = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        manager.rollback(&mut ctx, &mut first).await.unwrap();
        let mut second = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        manager.commit(&mut ctx, &mut second).await.unwrap();

        let err = manager.commit(&mut ctx, &mut outer).await.unwrap_err();
        assert!(err.is_unexpected_rollback());
        assert_eq!(resource.rollbacks(), 1);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn local_rollback_only_rolls_back_without_error() {
        let (resource, manager, mut ctx) = setup();

        let mut tx = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        tx.set_rollback_only();
        manager.commit(&mut ctx, &mut tx).await.unwrap();

        assert_eq!(resource.commits(), 0);
        assert_eq!(resource.rollbacks(), 1);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn local_rollback_only_on_participant_dooms_the_transaction() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut inner = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        inner.set_rollback_only();
        manager.commit(&mut ctx, &mut inner).await.unwrap();
        assert!(ctx.is_rollback_only());

        assert!(manager
            .commit(&mut ctx, &mut outer)
            .await
            .unwrap_err()
            .is_unexpected_rollback());
        assert_eq!(resource.rollbacks(), 1);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn requires_new_suspends_and_restores_outer() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let outer_id = outer.transaction_id();

        let mut inner = manager.begin(&mut ctx, &def(Propagation::RequiresNew)).await.unwrap();
        assert!(inner.is_new_transaction());
        assert!(inner.has_suspended_resource());
        assert_ne!(inner.transaction_id(), outer_id);
        assert_eq!(ctx.suspended_depth(), 1);

        manager.rollback(&mut ctx, &mut inner).await.unwrap();
        assert_eq!(resource.rollbacks(), 1);
        assert_eq!(ctx.current_transaction().map(|tx| tx.id()), outer_id);
        assert!(!ctx.is_rollback_only());
        assert_eq!(ctx.current_transaction().unwrap().participant_count(), 1);

        manager.commit(&mut ctx, &mut outer).await.unwrap();
        assert_eq!(resource.commits(), 1);
        assert_eq!(resource.acquisitions(), 2);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn requires_new_keeps_outer_rollback_only_flag() {
        let (_, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut joined = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        manager.rollback(&mut ctx, &mut joined).await.unwrap();

        let mut inner = manager.begin(&mut ctx, &def(Propagation::RequiresNew)).await.unwrap();
        assert!(!ctx.is_rollback_only());
        manager.commit(&mut ctx, &mut inner).await.unwrap();

        assert!(ctx.is_rollback_only());
        assert!(manager.commit(&mut ctx, &mut outer).await.is_err());
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn mandatory_without_transaction_acquires_nothing() {
        let (resource, manager, mut ctx) = setup();

        let err = manager.begin(&mut ctx, &def(Propagation::Mandatory)).await.unwrap_err();
        assert!(err.is_illegal_state());
        assert_eq!(resource.acquisitions(), 0);
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn never_inside_transaction_is_rejected() {
        let (_, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let err = manager.begin(&mut ctx, &def(Propagation::Never)).await.unwrap_err();
        assert!(err.is_illegal_state());
        assert_eq!(ctx.open_scopes(), 1);
        assert_eq!(ctx.current_transaction().unwrap().participant_count(), 1);

        manager.commit(&mut ctx, &mut outer).await.unwrap();
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn never_and_supports_run_without_transaction() {
        let (resource, manager, mut ctx) = setup();

        for propagation in [Propagation::Never, Propagation::Supports, Propagation::NotSupported] {
            let mut status = manager.begin(&mut ctx, &def(propagation)).await.unwrap();
            assert!(!status.has_transaction());
            assert!(!status.is_new_transaction());
            assert!(!ctx.is_actual_transaction_active());
            manager.rollback(&mut ctx, &mut status).await.unwrap();
        }
        assert_eq!(resource.acquisitions(), 0);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn not_supported_hides_the_active_transaction() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut plain = manager.begin(&mut ctx, &def(Propagation::NotSupported)).await.unwrap();
        assert!(plain.is_new_resource());
        assert!(!ctx.is_actual_transaction_active());

        let mut inner = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        assert!(inner.is_new_transaction());
        manager.commit(&mut ctx, &mut inner).await.unwrap();

        manager.commit(&mut ctx, &mut plain).await.unwrap();
        assert!(ctx.is_actual_transaction_active());
        manager.commit(&mut ctx, &mut outer).await.unwrap();

        assert_eq!(resource.commits(), 2);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn nested_rollback_only_undoes_the_savepoint() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        ctx.resource_mut().unwrap().insert("member", "kim");

        let mut nested = manager.begin(&mut ctx, &def(Propagation::Nested)).await.unwrap();
        assert!(nested.has_savepoint());
        assert!(!nested.is_new_transaction());
        ctx.resource_mut().unwrap().insert("log", "kim");
        manager.rollback(&mut ctx, &mut nested).await.unwrap();
        assert!(!ctx.is_rollback_only());

        manager.commit(&mut ctx, &mut outer).await.unwrap();
        assert!(resource.contains("member", "kim"));
        assert!(!resource.contains("log", "kim"));
        assert!(resource
            .events()
            .contains(&ResourceEvent::RolledBackToSavepoint(1, "SAVEPOINT_1".into())));
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn nested_commit_releases_the_savepoint() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Nested)).await.unwrap();
        assert!(outer.is_new_transaction());
        let mut nested = manager.begin(&mut ctx, &def(Propagation::Nested)).await.unwrap();
        manager.commit(&mut ctx, &mut nested).await.unwrap();
        manager.commit(&mut ctx, &mut outer).await.unwrap();

        assert!(resource
            .events()
            .contains(&ResourceEvent::SavepointReleased(1, "SAVEPOINT_1".into())));
        assert_eq!(resource.commits(), 1);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn nested_can_be_disabled() {
        let manager = TransactionManager::with_config(
            InMemoryResource::new(),
            ManagerConfig::default().with_nested_transaction_allowed(false),
        );
        let mut ctx = TransactionContext::new();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let err = manager.begin(&mut ctx, &def(Propagation::Nested)).await.unwrap_err();
        assert!(err.is_illegal_state());
        manager.commit(&mut ctx, &mut outer).await.unwrap();
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn double_completion_is_rejected() {
        let (resource, manager, mut ctx) = setup();

        let mut tx = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        manager.commit(&mut ctx, &mut tx).await.unwrap();

        assert!(manager.commit(&mut ctx, &mut tx).await.unwrap_err().is_illegal_state());
        assert!(manager.rollback(&mut ctx, &mut tx).await.unwrap_err().is_illegal_state());
        assert_eq!(resource.commits(), 1);
        assert_eq!(resource.rollbacks(), 0);
    }

    #[tokio::test]
    async fn out_of_order_completion_is_rejected() {
        let (_, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut inner = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();

        let err = manager.commit(&mut ctx, &mut outer).await.unwrap_err();
        assert!(err.is_illegal_state());
        assert!(!outer.is_completed());
        assert_eq!(ctx.open_scopes(), 2);

        manager.commit(&mut ctx, &mut inner).await.unwrap();
        manager.commit(&mut ctx, &mut outer).await.unwrap();
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn status_from_another_context_is_rejected() {
        let (_, manager, mut ctx) = setup();
        let mut other = TransactionContext::new();

        let mut tx = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut foreign = manager.begin(&mut other, &def(Propagation::Required)).await.unwrap();
        assert!(foreign.is_new_transaction());

        assert!(manager.commit(&mut other, &mut tx).await.unwrap_err().is_illegal_state());
        manager.commit(&mut ctx, &mut tx).await.unwrap();
        manager.commit(&mut other, &mut foreign).await.unwrap();
        ctx.finish().unwrap();
        other.finish().unwrap();
    }

    #[tokio::test]
    async fn acquire_failure_under_requires_new_restores_outer() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let outer_id = outer.transaction_id();
        resource.fail_next(Operation::Acquire);

        let err = manager.begin(&mut ctx, &def(Propagation::RequiresNew)).await.unwrap_err();
        assert!(matches!(err, Error::ResourceFailure(_)));
        assert_eq!(ctx.current_transaction().map(|tx| tx.id()), outer_id);
        assert_eq!(ctx.suspended_depth(), 0);

        manager.commit(&mut ctx, &mut outer).await.unwrap();
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn commit_failure_still_releases_and_clears() {
        let (resource, manager, mut ctx) = setup();

        let mut tx = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        resource.fail_next(Operation::Commit);

        let err = manager.commit(&mut ctx, &mut tx).await.unwrap_err();
        let inner = err.resource_error().unwrap();
        assert!(inner.downcast_ref::<crate::memory::MemoryError>().is_some());
        assert!(tx.is_completed());
        assert_eq!(resource.open_handles(), 0);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn commit_failure_can_trigger_rollback() {
        let resource = InMemoryResource::new();
        let manager = TransactionManager::with_config(
            resource.clone(),
            ManagerConfig::default().with_rollback_on_commit_failure(true),
        );
        let mut ctx = TransactionContext::new();

        let mut tx = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        resource.fail_next(Operation::Commit);
        assert!(manager.commit(&mut ctx, &mut tx).await.is_err());
        assert_eq!(resource.rollbacks(), 1);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn failed_savepoint_rollback_dooms_the_transaction() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut nested = manager.begin(&mut ctx, &def(Propagation::Nested)).await.unwrap();
        ctx.resource_mut().unwrap().insert("log", "lost");
        resource.fail_next(Operation::RollbackToSavepoint);

        let err = manager.rollback(&mut ctx, &mut nested).await.unwrap_err();
        assert!(matches!(err, Error::ResourceFailure(_)));
        assert!(nested.is_completed());
        assert!(ctx.is_rollback_only());

        let err = manager.commit(&mut ctx, &mut outer).await.unwrap_err();
        assert!(err.is_unexpected_rollback());
        assert!(!resource.contains("log", "lost"));
        assert_eq!(resource.commits(), 0);
        assert_eq!(resource.rollbacks(), 1);
        assert_eq!(resource.open_handles(), 0);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn rollback_failures_still_release_and_clear() {
        for operation in [Operation::Rollback, Operation::Release] {
            let (resource, manager, mut ctx) = setup();

            let mut tx = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
            ctx.resource_mut().unwrap().insert("member", "ghost");
            resource.fail_next(operation);

            let err = manager.rollback(&mut ctx, &mut tx).await.unwrap_err();
            assert!(matches!(err, Error::ResourceFailure(_)), "{operation:?}");
            assert!(tx.is_completed());
            assert!(!resource.contains("member", "ghost"));
            assert_eq!(resource.open_handles(), 0);
            ctx.finish().unwrap();
        }
    }

    #[tokio::test]
    async fn rollback_only_commit_reports_rollback_failure() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut inner = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        manager.rollback(&mut ctx, &mut inner).await.unwrap();
        resource.fail_next(Operation::Rollback);

        let err = manager.commit(&mut ctx, &mut outer).await.unwrap_err();
        assert!(matches!(err, Error::ResourceFailure(_)));
        assert!(outer.is_completed());
        assert_eq!(resource.commits(), 0);
        assert_eq!(resource.open_handles(), 0);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn rollback_only_commit_prefers_unexpected_rollback_over_release_failure() {
        let (resource, manager, mut ctx) = setup();

        let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        let mut inner = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
        manager.rollback(&mut ctx, &mut inner).await.unwrap();
        resource.fail_next(Operation::Release);

        let err = manager.commit(&mut ctx, &mut outer).await.unwrap_err();
        assert!(err.is_unexpected_rollback());
        assert!(outer.is_completed());
        assert_eq!(resource.rollbacks(), 1);
        assert_eq!(resource.open_handles(), 0);
        ctx.finish().unwrap();
    }

    #[tokio::test]
    async fn requires_new_rollback_failure_restores_outer() {
        for operation in [Operation::Rollback, Operation::Release] {
            let (resource, manager, mut ctx) = setup();

            let mut outer = manager.begin(&mut ctx, &def(Propagation::Required)).await.unwrap();
            let outer_id = outer.transaction_id();
            let mut inner = manager.begin(&mut ctx, &def(Propagation::RequiresNew)).await.unwrap();
            resource.fail_next(operation);

            let err = manager.rollback(&mut ctx, &mut inner).await.unwrap_err();
            assert!(matches!(err, Error::ResourceFailure(_)), "{operation:?}");
            assert!(inner.is_completed());
            assert_eq!(ctx.current_transaction().map(|tx| tx.id()), outer_id);
            assert_eq!(ctx.suspended_depth(), 0);
            assert!(!ctx.is_rollback_only());

            manager.commit(&mut ctx, &mut outer).await.unwrap();
            assert_eq!(resource.commits(), 1);
            assert_eq!(resource.open_handles(), 0);
            ctx.finish().unwrap();
        }
    }

    #[tokio::test]
    async fn join_validation_rejects_conflicting_definitions() {
        let manager = TransactionManager::with_config(
            InMemoryResource::new(),
            ManagerConfig::default().with_validate_existing_transaction(true),
        );
        let mut ctx = TransactionContext::new();

        let read_only = TransactionDefinition::required()
            .with_read_only(true)
            .with_isolation(IsolationLevel::ReadCommitted);
        let mut outer = manager.begin(&mut ctx, &read_only).await.unwrap();
        assert!(ctx.is_current_transaction_read_only());

        let writer = TransactionDefinition::required();
        assert!(manager.begin(&mut ctx, &writer).await.unwrap_err().is_illegal_state());

        let serializable = TransactionDefinition::required()
            .with_read_only(true)
            .with_isolation(IsolationLevel::Serializable);
        assert!(manager.begin(&mut ctx, &serializable).await.unwrap_err().is_illegal_state());

        let mut reader = manager
            .begin(&mut ctx, &TransactionDefinition::required().with_read_only(true))
            .await
            .unwrap();
        manager.commit(&mut ctx, &mut reader).await.unwrap();
        manager.commit(&mut ctx, &mut outer).await.unwrap();
        ctx.finish().unwrap();
    }
}
