use std::fmt;

/// Propagation behavior of a logical transaction.
///
/// Controls what [`TransactionManager::begin`](crate::TransactionManager::begin)
/// does relative to a transaction that is already active in the
/// [`TransactionContext`](crate::TransactionContext).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Propagation {
    /// Join the active transaction, or start a new one if there is none.
    #[default]
    Required,
    /// Always start a new physical transaction, suspending the active one.
    RequiresNew,
    /// Join the active transaction; fail if there is none.
    Mandatory,
    /// Run without a transaction; fail if one is active.
    Never,
    /// Join the active transaction, or run without one.
    Supports,
    /// Run without a transaction, suspending the active one.
    NotSupported,
    /// Run inside a savepoint of the active transaction, or start a new one.
    Nested,
}

impl Propagation {
    pub const ALL: [Propagation; 7] = [
        Propagation::Required,
        Propagation::RequiresNew,
        Propagation::Mandatory,
        Propagation::Never,
        Propagation::Supports,
        Propagation::NotSupported,
        Propagation::Nested,
    ];
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Propagation::Required => "REQUIRED",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::Mandatory => "MANDATORY",
            Propagation::Never => "NEVER",
            Propagation::Supports => "SUPPORTS",
            Propagation::NotSupported => "NOT_SUPPORTED",
            Propagation::Nested => "NESTED",
        };
        f.write_str(name)
    }
}

/// Isolation level requested for a new physical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling, as used in `SET TRANSACTION ISOLATION LEVEL ...`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Attributes of a logical transaction request.
///
/// Only `propagation` influences the join/suspend decision. Isolation and
/// read-only are applied when a new physical transaction is started and,
/// with [`ManagerConfig::validate_existing_transaction`](crate::ManagerConfig),
/// checked when joining.
///
/// # Examples
///
/// ```rust
/// use sqlx_tx_propagation::{IsolationLevel, Propagation, TransactionDefinition};
///
/// let def = TransactionDefinition::new(Propagation::RequiresNew)
///     .with_name("audit-log")
///     .with_isolation(IsolationLevel::ReadCommitted);
///
/// assert_eq!(def.propagation, Propagation::RequiresNew);
/// assert!(!def.read_only);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
    pub name: Option<String>,
}

impl TransactionDefinition {
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Self::default()
        }
    }

    pub fn required() -> Self {
        Self::new(Propagation::Required)
    }

    pub fn requires_new() -> Self {
        Self::new(Propagation::RequiresNew)
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl From<Propagation> for TransactionDefinition {
    fn from(propagation: Propagation) -> Self {
        Self::new(propagation)
    }
}
