use crate::definition::{IsolationLevel, TransactionDefinition};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// The single physical transaction bound to a context.
///
/// Created by the outermost `begin` that starts a new transaction and
/// dropped once that participant completes. Joined participants refer to
/// it by id only.
#[derive(Debug)]
pub struct PhysicalTransaction<H> {
    id: u64,
    handle: H,
    rollback_only: bool,
    participants: usize,
    savepoints: usize,
    name: Option<String>,
    read_only: bool,
    isolation: Option<IsolationLevel>,
}

impl<H> PhysicalTransaction<H> {
    pub(crate) fn new(id: u64, handle: H, definition: &TransactionDefinition) -> Self {
        Self {
            id,
            handle,
            rollback_only: false,
            participants: 1,
            savepoints: 0,
            name: definition.name.clone(),
            read_only: definition.read_only,
            isolation: definition.isolation,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn participant_count(&self) -> usize {
        self.participants
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn isolation(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    /// One-way: there is no way back to `false`.
    pub(crate) fn mark_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    pub(crate) fn add_participant(&mut self) {
        self.participants += 1;
    }

    pub(crate) fn remove_participant(&mut self) {
        self.participants = self.participants.saturating_sub(1);
    }

    pub(crate) fn next_savepoint_name(&mut self) -> String {
        self.savepoints += 1;
        format!("SAVEPOINT_{}", self.savepoints)
    }

    pub(crate) fn into_handle(self) -> H {
        self.handle
    }
}

/// A physical transaction detached from its context while an independent
/// scope (`REQUIRES_NEW`, `NOT_SUPPORTED`) runs.
#[derive(Debug)]
pub struct SuspendedResource<H> {
    transaction: PhysicalTransaction<H>,
}

impl<H> SuspendedResource<H> {
    pub fn transaction(&self) -> &PhysicalTransaction<H> {
        &self.transaction
    }
}

/// Transaction state of one logical call chain.
///
/// Holds at most one active [`PhysicalTransaction`], the stack of suspended
/// ones, and the stack of logical scopes that have begun but not completed.
/// A context is never shared: pass it down the call chain as
/// `&mut TransactionContext<_>` and create a fresh one for every spawned
/// task. A task created that way starts with no transaction, whatever its
/// parent was doing.
///
/// # Examples
///
/// ```rust
/// use sqlx_tx_propagation::{InMemoryResource, TransactionContext, TransactionDefinition, TransactionManager};
///
/// # async fn example() -> sqlx_tx_propagation::Result<()> {
/// let manager = TransactionManager::new(InMemoryResource::new());
/// let mut ctx = TransactionContext::new();
///
/// let mut status = manager.begin(&mut ctx, &TransactionDefinition::required()).await?;
/// assert!(ctx.is_actual_transaction_active());
///
/// manager.commit(&mut ctx, &mut status).await?;
/// ctx.finish()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct TransactionContext<H> {
    id: u64,
    active: Option<PhysicalTransaction<H>>,
    suspended: Vec<SuspendedResource<H>>,
    open: Vec<u64>,
    next_scope_id: u64,
    next_transaction_id: u64,
}

impl<H> TransactionContext<H> {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            active: None,
            suspended: Vec::new(),
            open: Vec::new(),
            next_scope_id: 1,
            next_transaction_id: 1,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether a physical transaction is bound to this context right now.
    ///
    /// `false` inside `NOT_SUPPORTED`/`NEVER`/`SUPPORTS` scopes that have no
    /// transaction, even if an outer one is suspended.
    pub fn is_actual_transaction_active(&self) -> bool {
        self.active.is_some()
    }

    /// Rollback-only flag of the active physical transaction.
    pub fn is_rollback_only(&self) -> bool {
        self.active.as_ref().is_some_and(|tx| tx.rollback_only)
    }

    pub fn current_transaction_name(&self) -> Option<&str> {
        self.active.as_ref().and_then(|tx| tx.name())
    }

    pub fn is_current_transaction_read_only(&self) -> bool {
        self.active.as_ref().is_some_and(|tx| tx.read_only)
    }

    pub fn current_transaction(&self) -> Option<&PhysicalTransaction<H>> {
        self.active.as_ref()
    }

    /// The resource handle of the active transaction, for running work on it.
    pub fn resource_mut(&mut self) -> Option<&mut H> {
        self.active.as_mut().map(|tx| &mut tx.handle)
    }

    pub fn suspended_depth(&self) -> usize {
        self.suspended.len()
    }

    /// Number of logical scopes begun and not yet completed.
    pub fn open_scopes(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_none() && self.suspended.is_empty() && self.open.is_empty()
    }

    /// Ends the call chain, reporting any scope that was never completed.
    ///
    /// Leaked handles are dropped without a physical commit or rollback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransactionState`](crate::Error::IllegalTransactionState)
    /// if a transaction is still bound, suspended, or a scope is still open.
    pub fn finish(mut self) -> crate::Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        let msg = format!(
            "transaction context {} finished with {} open scope(s), {} suspended transaction(s), active transaction: {}",
            self.id,
            self.open.len(),
            self.suspended.len(),
            self.active.is_some()
        );
        self.active = None;
        self.suspended.clear();
        self.open.clear();
        Err(crate::Error::illegal_state(msg))
    }

    pub(crate) fn active_mut(&mut self) -> Option<&mut PhysicalTransaction<H>> {
        self.active.as_mut()
    }

    pub(crate) fn next_transaction_id(&mut self) -> u64 {
        let id = self.next_transaction_id;
        self.next_transaction_id += 1;
        id
    }

    pub(crate) fn bind(&mut self, transaction: PhysicalTransaction<H>) {
        debug_assert!(self.active.is_none(), "context already has an active transaction");
        self.active = Some(transaction);
    }

    pub(crate) fn unbind(&mut self) -> Option<PhysicalTransaction<H>> {
        self.active.take()
    }

    /// Moves the active transaction onto the suspension stack.
    /// Returns `false` if there was nothing to suspend.
    pub(crate) fn suspend(&mut self) -> bool {
        match self.active.take() {
            Some(transaction) => {
                self.suspended.push(SuspendedResource { transaction });
                true
            }
            None => false,
        }
    }

    /// Rebinds the most recently suspended transaction.
    pub(crate) fn resume(&mut self) -> crate::Result<()> {
        if self.active.is_some() {
            return Err(crate::Error::illegal_state(
                "cannot resume a suspended transaction while another is active",
            ));
        }
        let suspended = self
            .suspended
            .pop()
            .ok_or_else(|| crate::Error::illegal_state("no suspended transaction to resume"))?;
        self.active = Some(suspended.transaction);
        Ok(())
    }

    pub(crate) fn open_scope(&mut self) -> u64 {
        let id = self.next_scope_id;
        self.next_scope_id += 1;
        self.open.push(id);
        id
    }

    pub(crate) fn innermost_scope(&self) -> Option<u64> {
        self.open.last().copied()
    }

    pub(crate) fn close_scope(&mut self, scope: u64) {
        if self.open.last() == Some(&scope) {
            self.open.pop();
        }
    }
}

impl<H> Default for TransactionContext<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> Drop for TransactionContext<H> {
    /// Drops leaked handles without completing them.
    ///
    /// For the sqlx adapter this closes the connection, which makes the
    /// server roll the open transaction back.
    fn drop(&mut self) {
        if !self.is_empty() {
            tracing::warn!(
                context = self.id,
                open_scopes = self.open.len(),
                suspended = self.suspended.len(),
                "Transaction context dropped with uncompleted transactions"
            );
        }
    }
}
