use crate::definition::TransactionDefinition;
use std::future::Future;

/// Adapter around the physical resource a transaction runs on.
///
/// The coordinator never looks inside a handle: it acquires one when a new
/// physical transaction starts, drives commit/rollback/savepoints through
/// this trait, and releases it when the outermost participant completes.
/// Errors are passed to the caller unchanged inside
/// [`Error::ResourceFailure`](crate::Error::ResourceFailure); nothing is retried.
///
/// Implementations are expected to be cheap handles onto a shared pool
/// (the way `MySqlPool` is), so the coordinator can be cloned into tasks.
pub trait ResourceProvider: Send + Sync {
    /// One physical connection with an open transaction.
    type Handle: Send;
    type Error: std::error::Error + Send + Sync + 'static;

    /// Takes a resource and starts a physical transaction on it.
    fn acquire(
        &self,
        definition: &TransactionDefinition,
    ) -> impl Future<Output = Result<Self::Handle, Self::Error>> + Send;

    fn commit(
        &self,
        handle: &mut Self::Handle,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn rollback(
        &self,
        handle: &mut Self::Handle,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Gives the resource back. Called exactly once per acquired handle,
    /// after commit or rollback (successful or not).
    fn release(&self, handle: Self::Handle) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn create_savepoint(
        &self,
        handle: &mut Self::Handle,
        name: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn rollback_to_savepoint(
        &self,
        handle: &mut Self::Handle,
        name: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    fn release_savepoint(
        &self,
        handle: &mut Self::Handle,
        name: &str,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}
