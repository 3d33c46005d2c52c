//! In-process resource that records every physical operation.
//!
//! Writes made through a [`MemoryHandle`] stay pending until the physical
//! transaction commits, so the effect of propagation decisions can be
//! observed without a database.

use crate::definition::{IsolationLevel, TransactionDefinition};
use crate::resource::ResourceProvider;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// Physical operation kinds, used for the journal and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Acquire,
    Commit,
    Rollback,
    Release,
    CreateSavepoint,
    RollbackToSavepoint,
    ReleaseSavepoint,
}

/// Journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Acquired {
        handle: u64,
        isolation: Option<IsolationLevel>,
        read_only: bool,
    },
    Committed(u64),
    RolledBack(u64),
    Released(u64),
    SavepointCreated(u64, String),
    RolledBackToSavepoint(u64, String),
    SavepointReleased(u64, String),
}

/// Injected failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("injected {operation:?} failure")]
pub struct MemoryError {
    pub operation: Operation,
}

#[derive(Debug, Default)]
struct Shared {
    next_handle: u64,
    events: Vec<ResourceEvent>,
    open: BTreeSet<u64>,
    committed: BTreeSet<(String, String)>,
    failures: Vec<Operation>,
}

/// Cloneable in-memory [`ResourceProvider`]; clones share one journal.
#[derive(Debug, Clone, Default)]
pub struct InMemoryResource {
    shared: Arc<Mutex<Shared>>,
}

/// Connection-like handle onto an [`InMemoryResource`].
#[derive(Debug)]
pub struct MemoryHandle {
    id: u64,
    pending: Vec<(String, String)>,
    savepoints: Vec<(String, usize)>,
}

impl MemoryHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stages a row; it becomes visible when the transaction commits.
    pub fn insert(&mut self, table: &str, key: &str) {
        self.pending.push((table.to_string(), key.to_string()));
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl InMemoryResource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Makes the next call of `operation` fail with [`MemoryError`].
    pub fn fail_next(&self, operation: Operation) {
        self.lock().failures.push(operation);
    }

    /// Writes a row outside any transaction (auto-commit).
    pub fn insert_auto_commit(&self, table: &str, key: &str) {
        self.lock()
            .committed
            .insert((table.to_string(), key.to_string()));
    }

    /// Whether a committed row exists.
    pub fn contains(&self, table: &str, key: &str) -> bool {
        self.lock()
            .committed
            .contains(&(table.to_string(), key.to_string()))
    }

    pub fn events(&self) -> Vec<ResourceEvent> {
        self.lock().events.clone()
    }

    pub fn acquisitions(&self) -> usize {
        self.count(|e| matches!(e, ResourceEvent::Acquired { .. }))
    }

    pub fn commits(&self) -> usize {
        self.count(|e| matches!(e, ResourceEvent::Committed(_)))
    }

    pub fn rollbacks(&self) -> usize {
        self.count(|e| matches!(e, ResourceEvent::RolledBack(_)))
    }

    /// Handles acquired and not yet released.
    pub fn open_handles(&self) -> usize {
        self.lock().open.len()
    }

    fn count(&self, pred: impl Fn(&ResourceEvent) -> bool) -> usize {
        self.lock().events.iter().filter(|e| pred(e)).count()
    }

    fn check(shared: &mut Shared, operation: Operation) -> Result<(), MemoryError> {
        match shared.failures.iter().position(|op| *op == operation) {
            Some(idx) => {
                shared.failures.remove(idx);
                Err(MemoryError { operation })
            }
            None => Ok(()),
        }
    }
}

impl ResourceProvider for InMemoryResource {
    type Handle = MemoryHandle;
    type Error = MemoryError;

    async fn acquire(&self, definition: &TransactionDefinition) -> Result<MemoryHandle, MemoryError> {
        let mut shared = self.lock();
        Self::check(&mut shared, Operation::Acquire)?;
        shared.next_handle += 1;
        let id = shared.next_handle;
        shared.open.insert(id);
        shared.events.push(ResourceEvent::Acquired {
            handle: id,
            isolation: definition.isolation,
            read_only: definition.read_only,
        });
        Ok(MemoryHandle {
            id,
            pending: Vec::new(),
            savepoints: Vec::new(),
        })
    }

    async fn commit(&self, handle: &mut MemoryHandle) -> Result<(), MemoryError> {
        let mut shared = self.lock();
        Self::check(&mut shared, Operation::Commit)?;
        shared.committed.extend(handle.pending.drain(..));
        handle.savepoints.clear();
        shared.events.push(ResourceEvent::Committed(handle.id));
        Ok(())
    }

    async fn rollback(&self, handle: &mut MemoryHandle) -> Result<(), MemoryError> {
        let mut shared = self.lock();
        Self::check(&mut shared, Operation::Rollback)?;
        handle.pending.clear();
        handle.savepoints.clear();
        shared.events.push(ResourceEvent::RolledBack(handle.id));
        Ok(())
    }

    async fn release(&self, handle: MemoryHandle) -> Result<(), MemoryError> {
        let mut shared = self.lock();
        shared.open.remove(&handle.id);
        Self::check(&mut shared, Operation::Release)?;
        shared.events.push(ResourceEvent::Released(handle.id));
        Ok(())
    }

    async fn create_savepoint(&self, handle: &mut MemoryHandle, name: &str) -> Result<(), MemoryError> {
        let mut shared = self.lock();
        Self::check(&mut shared, Operation::CreateSavepoint)?;
        handle.savepoints.push((name.to_string(), handle.pending.len()));
        shared
            .events
            .push(ResourceEvent::SavepointCreated(handle.id, name.to_string()));
        Ok(())
    }

    async fn rollback_to_savepoint(
        &self,
        handle: &mut MemoryHandle,
        name: &str,
    ) -> Result<(), MemoryError> {
        let mut shared = self.lock();
        Self::check(&mut shared, Operation::RollbackToSavepoint)?;
        if let Some((_, mark)) = handle.savepoints.iter().rev().find(|(n, _)| n == name) {
            handle.pending.truncate(*mark);
        }
        shared
            .events
            .push(ResourceEvent::RolledBackToSavepoint(handle.id, name.to_string()));
        Ok(())
    }

    async fn release_savepoint(&self, handle: &mut MemoryHandle, name: &str) -> Result<(), MemoryError> {
        let mut shared = self.lock();
        Self::check(&mut shared, Operation::ReleaseSavepoint)?;
        if let Some(idx) = handle.savepoints.iter().rposition(|(n, _)| n == name) {
            handle.savepoints.truncate(idx);
        }
        shared
            .events
            .push(ResourceEvent::SavepointReleased(handle.id, name.to_string()));
        Ok(())
    }
}
