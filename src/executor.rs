use crate::context::TransactionContext;
use crate::definition::TransactionDefinition;
use crate::error::Error;
use crate::manager::TransactionManager;
use crate::resource::ResourceProvider;
use std::future::Future;
use std::pin::Pin;
use tracing::{debug, warn};

/// Executes a function within a logical transaction.
///
/// This is the explicit replacement for annotation-driven interception:
/// the transaction boundary exists exactly where this function is called,
/// and calling the body directly never silently skips it.
///
/// - Begins a logical transaction with the given definition
/// - Executes the provided function with the context
/// - Commits on success
/// - Rolls back on error
///
/// Whether begin/commit/rollback touch the physical resource depends on the
/// propagation and on what is already active in `ctx`: a `REQUIRED` call
/// inside another transaction only joins it, and its rollback only marks the
/// shared transaction rollback-only.
///
/// # Type Parameters
///
/// * `F` - A function that takes the mutable `TransactionContext` and returns a pinned future
/// * `T` - The return type of the function (must be `Send`)
/// * `E` - The error type of the function; coordinator errors convert into it
///
/// # Errors
///
/// Returns the body's error if it fails. A rollback failure after a body
/// error is logged and the body's error is returned. Coordinator errors from
/// `begin` or `commit` (including [`Error::UnexpectedRollback`]) are
/// converted into `E`.
///
/// # Examples
///
/// ```rust
/// use sqlx_tx_propagation::{with_transaction, InMemoryResource, TransactionContext, TransactionDefinition, TransactionManager};
///
/// # async fn example() -> sqlx_tx_propagation::Result<()> {
/// let resource = InMemoryResource::new();
/// let manager = TransactionManager::new(resource.clone());
/// let mut ctx = TransactionContext::new();
///
/// with_transaction(&manager, &mut ctx, &TransactionDefinition::required(), |tx| {
///     Box::pin(async move {
///         if let Some(conn) = tx.resource_mut() {
///             conn.insert("member", "alice");
///         }
///         Ok::<_, sqlx_tx_propagation::Error>(())
///     })
/// })
/// .await?;
///
/// assert!(resource.contains("member", "alice"));
/// # Ok(())
/// # }
/// ```
pub async fn with_transaction<R, F, T, E>(
    manager: &TransactionManager<R>,
    ctx: &mut TransactionContext<R::Handle>,
    definition: &TransactionDefinition,
    f: F,
) -> std::result::Result<T, E>
where
    R: ResourceProvider,
    F: for<'a> FnOnce(
        &'a mut TransactionContext<R::Handle>,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send + 'a>>,
    T: Send,
    E: From<Error>,
{
    with_transaction_rule(manager, ctx, definition, |_: &E| true, f).await
}

/// Executes a function within a logical transaction, rolling back only for
/// errors selected by `rollback_on`.
///
/// An error for which `rollback_on` returns `false` is a business outcome:
/// the work done so far is committed and the error is still returned to the
/// caller. If that commit fails, the commit error is returned instead.
///
/// # Examples
///
/// ```rust
/// use sqlx_tx_propagation::{with_transaction_rule, InMemoryResource, TransactionContext, TransactionDefinition, TransactionManager};
///
/// #[derive(Debug)]
/// enum OrderError {
///     NotEnoughMoney,
///     Tx(sqlx_tx_propagation::Error),
/// }
///
/// impl From<sqlx_tx_propagation::Error> for OrderError {
///     fn from(e: sqlx_tx_propagation::Error) -> Self {
///         OrderError::Tx(e)
///     }
/// }
///
/// # async fn example() {
/// let resource = InMemoryResource::new();
/// let manager = TransactionManager::new(resource.clone());
/// let mut ctx = TransactionContext::new();
///
/// let result = with_transaction_rule(
///     &manager,
///     &mut ctx,
///     &TransactionDefinition::required(),
///     |e: &OrderError| !matches!(e, OrderError::NotEnoughMoney),
///     |tx| {
///         Box::pin(async move {
///             if let Some(conn) = tx.resource_mut() {
///                 conn.insert("orders", "waiting");
///             }
///             Err::<(), _>(OrderError::NotEnoughMoney)
///         })
///     },
/// )
/// .await;
///
/// assert!(matches!(result, Err(OrderError::NotEnoughMoney)));
/// assert!(resource.contains("orders", "waiting"));
/// # }
/// ```
pub async fn with_transaction_rule<R, F, T, E, P>(
    manager: &TransactionManager<R>,
    ctx: &mut TransactionContext<R::Handle>,
    definition: &TransactionDefinition,
    rollback_on: P,
    f: F,
) -> std::result::Result<T, E>
where
    R: ResourceProvider,
    F: for<'a> FnOnce(
        &'a mut TransactionContext<R::Handle>,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<T, E>> + Send + 'a>>,
    T: Send,
    E: From<Error>,
    P: Fn(&E) -> bool,
{
    let mut status = manager.begin(ctx, definition).await?;

    match f(&mut *ctx).await {
        Ok(result) => {
            manager.commit(ctx, &mut status).await?;
            Ok(result)
        }
        Err(e) if rollback_on(&e) => {
            if let Err(rollback_err) = manager.rollback(ctx, &mut status).await {
                warn!(error = %rollback_err, "Rollback after application error failed");
            }
            Err(e)
        }
        Err(e) => {
            debug!("Application error does not require rollback, committing");
            manager.commit(ctx, &mut status).await?;
            Err(e)
        }
    }
}
