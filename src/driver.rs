//! Driver abstraction consumed by the executor
//!
//! The crate ships no wire protocol. A host plugs in a concrete driver by
//! implementing these object-safe traits:
//! - [`DataSourceFactory`]: connection string → [`DataSource`]
//! - [`DataSource`]: produces open connections sharing pooling/configuration
//! - [`DriverConnection`]: executes materialized commands
//! - [`DriverTransaction`]: consume-on-commit/rollback transaction handle
//! - [`RowReader`]: sequential-access row iteration

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::query::{CommandKind, QueryParameter};
use crate::value::{Row, Value};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// No isolation requested; the executor starts no transaction
    Unspecified,
    /// Read uncommitted - dirty reads possible
    ReadUncommitted,
    /// Read committed - no dirty reads
    ReadCommitted,
    /// Repeatable read - no non-repeatable reads
    RepeatableRead,
    /// Serializable - full isolation
    Serializable,
    /// Snapshot isolation (SQL Server specific)
    Snapshot,
    /// Chaos - pending changes from more highly isolated transactions
    /// cannot be overwritten (legacy drivers only)
    Chaos,
}

impl IsolationLevel {
    /// Convert to SQL string for SET TRANSACTION statements
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::Unspecified => "UNSPECIFIED",
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::Snapshot => "SNAPSHOT",
            Self::Chaos => "CHAOS",
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

/// A fully materialized command, ready for the driver.
///
/// Built by the executor once per execution and re-submitted unchanged on
/// every retry attempt.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// SQL text or stored-procedure identifier
    pub text: String,
    /// Text vs stored procedure
    pub kind: CommandKind,
    /// Timeout in whole seconds; 0 is the driver's "no timeout" sentinel
    pub timeout_secs: u32,
    /// Bound parameters; absent payloads arrive as `Value::Null`
    pub parameters: Vec<QueryParameter>,
}

/// Factory for data sources; how a concrete driver is plugged in.
pub trait DataSourceFactory: Send + Sync {
    /// Create a data source for one logical connection.
    ///
    /// Called lazily on first use of a connection name and again after every
    /// configuration change for that name.
    fn create(&self, name: &str, connection_string: &str) -> Result<Arc<dyn DataSource>>;
}

/// Driver-provided factory for opened connections sharing pooling and
/// configuration.
#[async_trait]
pub trait DataSource: Send + Sync + std::fmt::Debug {
    /// Open a connection, observing the cancellation token.
    async fn open_connection(&self, cancel: &CancellationToken) -> Result<Box<dyn DriverConnection>>;

    /// Release pooled resources. Idempotent. Connections already handed out
    /// stay valid until they are themselves closed.
    async fn dispose(&self) -> Result<()>;
}

/// One open connection, confined to a single logical flow.
///
/// Commands issued while a transaction begun from this connection is open
/// run inside that transaction; the driver tracks the association.
#[async_trait]
pub trait DriverConnection: Send {
    /// Begin a transaction with the given isolation level.
    async fn begin_transaction(
        &mut self,
        isolation: IsolationLevel,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn DriverTransaction>>;

    /// Execute a command that modifies data; returns the affected row count.
    async fn execute_non_query(
        &mut self,
        command: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Execute a command and return the first column of the first row.
    /// `None` means the result set was empty (distinct from a NULL cell).
    async fn execute_scalar(
        &mut self,
        command: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>>;

    /// Execute a command and return a sequential-access row reader.
    async fn execute_reader(
        &mut self,
        command: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<Box<dyn RowReader>>;

    /// Release the connection. Idempotent.
    async fn close(&mut self) -> Result<()>;
}

/// A transaction handle. Consuming `commit`/`rollback` makes "committed
/// exactly once or rolled back exactly once" hold by construction.
#[async_trait]
pub trait DriverTransaction: Send {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll the transaction back
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Sequential row iteration over a result set.
#[async_trait]
pub trait RowReader: Send {
    /// Fetch the next row; `None` when the result set is exhausted.
    async fn next_row(&mut self, cancel: &CancellationToken) -> Result<Option<Row>>;
}
