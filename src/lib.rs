//! # sqlx-tx-propagation
//!
//! Transaction propagation for SQLx: several call sites open logical
//! transactions over one physical database transaction, and a single
//! coordinator decides who really commits.
//!
//! ## Features
//!
//! - **Propagation behaviors**: `REQUIRED`, `REQUIRES_NEW`, `MANDATORY`,
//!   `NEVER`, `SUPPORTS`, `NOT_SUPPORTED` and `NESTED` (savepoints)
//! - **Rollback-only tracking**: an inner participant's rollback dooms the
//!   shared transaction; the outermost commit then rolls back and reports
//!   [`Error::UnexpectedRollback`]
//! - **Suspension**: `REQUIRES_NEW` runs on its own connection and restores
//!   the outer transaction afterwards
//! - **Explicit boundaries**: no proxies; [`with_transaction`] is the
//!   boundary, and the context is passed down the call chain explicitly
//! - **Pluggable resources**: [`MySqlResource`] for SQLx, [`InMemoryResource`]
//!   for tests and demos, or any [`ResourceProvider`]
//!
//! ## Quick Start
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! sqlx = { version = "0.8", features = ["mysql", "runtime-tokio"] }
//! sqlx-tx-propagation = "0.1"
//! ```
//!
//! ## Examples
//!
//! ### Basic Transaction
//!
//! ```rust,no_run
//! use sqlx::MySqlPool;
//! use sqlx_tx_propagation::prelude::*;
//!
//! # async fn example() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let pool = MySqlPool::connect("mysql://localhost/test").await?;
//! let manager = TransactionManager::new(MySqlResource::new(pool));
//! let mut ctx = TransactionContext::new();
//!
//! with_transaction(&manager, &mut ctx, &TransactionDefinition::required(), |tx| {
//!     Box::pin(async move {
//!         sqlx::query("INSERT INTO users (name) VALUES (?)")
//!             .bind("Alice")
//!             .execute(tx.as_executor()?)
//!             .await?;
//!         Ok::<_, anyhow::Error>(())
//!     })
//! }).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Joining and Rollback-Only
//!
//! ```rust
//! use sqlx_tx_propagation::prelude::*;
//!
//! # async fn example() -> sqlx_tx_propagation::Result<()> {
//! let resource = InMemoryResource::new();
//! let manager = TransactionManager::new(resource.clone());
//! let mut ctx = TransactionContext::new();
//!
//! let mut outer = manager.begin(&mut ctx, &TransactionDefinition::required()).await?;
//! let mut inner = manager.begin(&mut ctx, &TransactionDefinition::required()).await?;
//!
//! // The inner participant cannot roll back alone; it marks the whole
//! // physical transaction rollback-only.
//! manager.rollback(&mut ctx, &mut inner).await?;
//!
//! let err = manager.commit(&mut ctx, &mut outer).await.unwrap_err();
//! assert!(err.is_unexpected_rollback());
//! assert_eq!(resource.rollbacks(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ### Independent Inner Transaction
//!
//! ```rust
//! use sqlx_tx_propagation::prelude::*;
//!
//! # async fn example() -> sqlx_tx_propagation::Result<()> {
//! let resource = InMemoryResource::new();
//! let manager = TransactionManager::new(resource.clone());
//! let mut ctx = TransactionContext::new();
//!
//! let mut outer = manager.begin(&mut ctx, &TransactionDefinition::required()).await?;
//! let mut inner = manager.begin(&mut ctx, &TransactionDefinition::requires_new()).await?;
//! assert!(inner.is_new_transaction());
//!
//! manager.rollback(&mut ctx, &mut inner).await?; // physical rollback, right now
//! manager.commit(&mut ctx, &mut outer).await?;   // outer still commits
//! assert_eq!((resource.commits(), resource.rollbacks()), (1, 1));
//! # Ok(())
//! # }
//! ```
//!
//! ## How It Works
//!
//! 1. **TransactionContext**: per call chain; holds the active physical
//!    transaction, suspended ones, and the open logical scopes
//! 2. **resolve**: a pure table from (propagation, active?) to an [`Action`]
//! 3. **TransactionManager**: applies the action, hands out a
//!    [`TransactionStatus`], and on completion either acts physically (the
//!    participant that started the transaction) or only updates shared state
//! 4. **Ordering**: scopes must complete innermost first; anything else is
//!    [`Error::IllegalTransactionState`]
//!
//! ## License
//!
//! Licensed under either of Apache License, Version 2.0 or MIT license at your option.

pub mod config;
pub mod context;
pub mod definition;
pub mod error;
pub mod executor;
pub mod manager;
pub mod memory;
pub mod mysql;
pub mod propagation;
pub mod resource;
pub mod status;

pub use config::ManagerConfig;
pub use context::{PhysicalTransaction, SuspendedResource, TransactionContext};
pub use definition::{IsolationLevel, Propagation, TransactionDefinition};
pub use error::{Error, Result};
pub use executor::{with_transaction, with_transaction_rule};
pub use manager::TransactionManager;
pub use memory::InMemoryResource;
pub use mysql::{MySqlHandle, MySqlResource};
pub use propagation::{resolve, Action, PropagationResolver};
pub use resource::ResourceProvider;
pub use status::TransactionStatus;

/// Convenience re-exports for common use cases
pub mod prelude {
    pub use crate::context::TransactionContext;
    pub use crate::definition::{Propagation, TransactionDefinition};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{with_transaction, with_transaction_rule};
    pub use crate::manager::TransactionManager;
    pub use crate::memory::InMemoryResource;
    pub use crate::mysql::MySqlResource;
}
