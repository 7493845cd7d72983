//! Query execution and connection pool interface

use crate::builder::common::is_identifier;
use crate::error::{Error, Result};
use crate::value::Value;
use std::future::Future;

#[cfg(feature = "postgres")]
pub mod postgres;

/// A fetched row, keyed by column name
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Trait for database connection pools
///
/// Implementations run one statement per call, with `$1..$n` placeholders bound
/// to `params` in order. Finishers are written against this trait, so a
/// [`Transaction`] runs them on its pinned connection.
pub trait ConnectionPool: Send + Sync {
    /// Execute a statement and return the number of affected rows
    fn execute(&self, sql: &str, params: &[Value]) -> impl Future<Output = Result<u64>> + Send;

    /// Execute a query and return every row
    fn fetch_all(&self, sql: &str, params: &[Value])
        -> impl Future<Output = Result<Vec<Row>>> + Send;
}

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn to_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }

    pub(crate) fn statement(&self) -> String {
        format!("SET TRANSACTION ISOLATION LEVEL {}", self.to_sql())
    }
}

/// Trait for database transactions
///
/// Handles are cheap clones of one pinned connection. `commit` and `rollback`
/// close it for every clone; afterwards, and on a second close, calls fail with
/// [`ErrorKind::NotValid`](crate::ErrorKind::NotValid).
pub trait Transaction: ConnectionPool + Clone {
    /// Commit the transaction
    fn commit(&self) -> impl Future<Output = Result<()>> + Send;

    /// Rollback the transaction
    fn rollback(&self) -> impl Future<Output = Result<()>> + Send;

    /// Create a savepoint with the given name
    fn savepoint(&self, name: &str) -> impl Future<Output = Result<()>> + Send {
        async move {
            let name = savepoint_name(name)?;
            self.execute(&format!("SAVEPOINT {name}"), &[]).await?;
            Ok(())
        }
    }

    /// Rollback to a savepoint
    fn rollback_to_savepoint(&self, name: &str) -> impl Future<Output = Result<()>> + Send {
        async move {
            let name = savepoint_name(name)?;
            self.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[]).await?;
            Ok(())
        }
    }

    /// Release a savepoint
    fn release_savepoint(&self, name: &str) -> impl Future<Output = Result<()>> + Send {
        async move {
            let name = savepoint_name(name)?;
            self.execute(&format!("RELEASE SAVEPOINT {name}"), &[]).await?;
            Ok(())
        }
    }
}

fn savepoint_name(name: &str) -> Result<&str> {
    if is_identifier(name) {
        Ok(name)
    } else {
        Err(Error::not_valid(format!("`{name}` is not a valid savepoint name")))
    }
}

/// Pools (and transactions) that can open a transaction
///
/// Transactions implement this too and always refuse: nesting is expressed with
/// savepoints instead.
pub trait TransactionalPool: ConnectionPool {
    type Transaction: Transaction;

    /// Start a new transaction with default isolation level
    fn begin(&self) -> impl Future<Output = Result<Self::Transaction>> + Send;

    /// Start a new transaction with specified isolation level
    fn begin_with_isolation(
        &self,
        isolation: IsolationLevel,
    ) -> impl Future<Output = Result<Self::Transaction>> + Send;
}

pub(crate) fn nested_begin() -> Error {
    Error::not_valid("a transaction is already open on this connection; use a savepoint")
}

pub(crate) fn closed_transaction() -> Error {
    Error::not_valid("transaction is already committed or rolled back")
}

/// Run `f` in a transaction: commit on `Ok`, roll back on `Err`
///
/// The closure receives its own handle to the transaction. A rollback failure
/// is logged and the closure's error is returned.
pub async fn transaction<P, F, Fut, T>(pool: &P, f: F) -> Result<T>
where
    P: TransactionalPool,
    F: FnOnce(P::Transaction) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let tx = pool.begin().await?;

    match f(tx.clone()).await {
        Ok(result) => {
            tx.commit().await?;
            Ok(result)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback after failed transaction body failed");
            }
            Err(err)
        }
    }
}
