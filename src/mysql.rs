use crate::context::TransactionContext;
use crate::definition::TransactionDefinition;
use crate::resource::ResourceProvider;
use sqlx::pool::PoolConnection;
use sqlx::{Executor, MySql, MySqlConnection, MySqlPool};
use std::ops::DerefMut;

/// [`ResourceProvider`] backed by a SQLx MySQL pool.
///
/// Each physical transaction runs on one pooled connection. Transaction
/// control statements are sent as plain text (`START TRANSACTION`,
/// `COMMIT`, `SAVEPOINT ...`), so isolation level and read-only mode can be
/// set before the transaction starts.
///
/// # Examples
///
/// ```rust,no_run
/// use sqlx::MySqlPool;
/// use sqlx_tx_propagation::{MySqlResource, TransactionContext, TransactionDefinition, TransactionManager};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = MySqlPool::connect("mysql://localhost/test").await?;
/// let manager = TransactionManager::new(MySqlResource::new(pool));
/// let mut ctx = TransactionContext::new();
///
/// let mut status = manager.begin(&mut ctx, &TransactionDefinition::required()).await?;
/// sqlx::query("INSERT INTO users (name) VALUES (?)")
///     .bind("Alice")
///     .execute(ctx.as_executor()?)
///     .await?;
/// manager.commit(&mut ctx, &mut status).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MySqlResource {
    pool: MySqlPool,
}

impl MySqlResource {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }
}

/// A pooled connection with an open transaction.
///
/// If dropped while the transaction is still open, the connection is closed
/// instead of being returned to the pool, so the server rolls it back.
#[derive(Debug)]
pub struct MySqlHandle {
    conn: Option<PoolConnection<MySql>>,
    in_transaction: bool,
}

impl MySqlHandle {
    /// Returns the connection for use as an SQLx `Executor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransactionState`](crate::Error::IllegalTransactionState)
    /// if the connection has already been released.
    pub fn as_executor(&mut self) -> crate::Result<&mut MySqlConnection> {
        self.conn
            .as_mut()
            .map(|conn| conn.deref_mut())
            .ok_or_else(|| crate::Error::illegal_state("connection has already been released"))
    }

    /// A handle whose begin statements have not all run yet. It counts as
    /// in a transaction, so a connection left half-configured by a failed
    /// `SET TRANSACTION` or `START TRANSACTION` is closed, never pooled.
    fn starting(conn: Option<PoolConnection<MySql>>) -> Self {
        Self {
            conn,
            in_transaction: true,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    async fn run(&mut self, sql: &str) -> Result<(), sqlx::Error> {
        let conn: &mut MySqlConnection = self.conn.as_mut().ok_or(sqlx::Error::PoolClosed)?;
        conn.execute(sql).await?;
        Ok(())
    }
}

impl TransactionContext<MySqlHandle> {
    /// Returns the connection of the active transaction for use as an SQLx
    /// `Executor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IllegalTransactionState`](crate::Error::IllegalTransactionState)
    /// if no transaction is active (for example inside a `NOT_SUPPORTED` scope).
    pub fn as_executor(&mut self) -> crate::Result<&mut MySqlConnection> {
        self.resource_mut()
            .ok_or_else(|| crate::Error::illegal_state("no transaction is active in this context"))?
            .as_executor()
    }
}

impl Drop for MySqlHandle {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(conn) = self.conn.as_mut() {
                conn.close_on_drop();
            }
        }
    }
}

fn begin_statements(definition: &TransactionDefinition) -> Vec<String> {
    let mut statements = Vec::with_capacity(2);
    if let Some(isolation) = definition.isolation {
        statements.push(format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ));
    }
    if definition.read_only {
        statements.push("START TRANSACTION READ ONLY".to_string());
    } else {
        statements.push("START TRANSACTION".to_string());
    }
    statements
}

fn quote_savepoint(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

impl ResourceProvider for MySqlResource {
    type Handle = MySqlHandle;
    type Error = sqlx::Error;

    async fn acquire(&self, definition: &TransactionDefinition) -> Result<MySqlHandle, sqlx::Error> {
        let conn = self.pool.acquire().await?;
        let mut handle = MySqlHandle::starting(Some(conn));
        for statement in begin_statements(definition) {
            handle.run(&statement).await?;
        }
        Ok(handle)
    }

    async fn commit(&self, handle: &mut MySqlHandle) -> Result<(), sqlx::Error> {
        handle.run("COMMIT").await?;
        handle.in_transaction = false;
        Ok(())
    }

    async fn rollback(&self, handle: &mut MySqlHandle) -> Result<(), sqlx::Error> {
        handle.run("ROLLBACK").await?;
        handle.in_transaction = false;
        Ok(())
    }

    async fn release(&self, mut handle: MySqlHandle) -> Result<(), sqlx::Error> {
        // Dropping the PoolConnection returns it to the pool.
        if let Some(mut conn) = handle.conn.take() {
            if handle.in_transaction {
                conn.close_on_drop();
            }
        }
        handle.in_transaction = false;
        Ok(())
    }

    async fn create_savepoint(&self, handle: &mut MySqlHandle, name: &str) -> Result<(), sqlx::Error> {
        handle
            .run(&format!("SAVEPOINT {}", quote_savepoint(name)))
            .await
    }

    async fn rollback_to_savepoint(
        &self,
        handle: &mut MySqlHandle,
        name: &str,
    ) -> Result<(), sqlx::Error> {
        handle
            .run(&format!("ROLLBACK TO SAVEPOINT {}", quote_savepoint(name)))
            .await
    }

    async fn release_savepoint(&self, handle: &mut MySqlHandle, name: &str) -> Result<(), sqlx::Error> {
        handle
            .run(&format!("RELEASE SAVEPOINT {}", quote_savepoint(name)))
            .await
    }
}
