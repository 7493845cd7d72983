//! Quarry - an immutable, chainable query layer for PostgreSQL
//!
//! Every builder method returns a new [`QueryState`] and leaves its receiver
//! untouched. Mistakes made while building (a bad argument count, an unknown
//! association, a negative limit) are recorded on the state and surface from
//! the finisher that runs it; no statement reaches the database once a state
//! has failed. All failures map onto a small [`ErrorKind`] taxonomy.
//!
//! ```no_run
//! use quarry_core::{model, Model, PgPool, DatabaseConfig, Result};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct User {
//!     #[serde(default)]
//!     id: i64,
//!     email: String,
//! }
//!
//! impl Model for User {
//!     const TABLE: &'static str = "users";
//! }
//!
//! # async fn run() -> Result<()> {
//! let pool = PgPool::connect(&DatabaseConfig::default()).await?;
//! let active: Vec<User> = model::<User>()
//!     .where_("email LIKE ?", ("%@example.com",))
//!     .order("id")
//!     .limit(20)
//!     .find(&pool)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod classify;
pub mod config;
pub mod error;
pub mod executor;
mod finisher;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod model;
pub mod pagination;
mod preload;
pub mod scope;
pub mod updates;
pub mod value;

// Re-export main types
pub use builder::{Args, IntoArgs, JoinType, QueryState, SortDirection};
pub use config::DatabaseConfig;
pub use error::{Error, ErrorKind, Result};
pub use executor::{
    transaction, ConnectionPool, IsolationLevel, Row, Transaction, TransactionalPool,
};
#[cfg(feature = "postgres")]
pub use executor::postgres::{PgPool, PgTransaction};
pub use model::{Association, Model, Relation, Target};
pub use pagination::{page_count, PagedResult};
pub use scope::{compose, Scope};
pub use updates::Updates;
pub use value::Value;

/// Start a query against a table by name
pub fn table(name: impl Into<String>) -> QueryState {
    QueryState::new().table(name)
}

/// Start a query against a model's table, with its primary key, soft-delete
/// column and associations
pub fn model<T: Model>() -> QueryState {
    QueryState::new().model::<T>()
}

/// An empty state, for raw statements or for finishers that bind the table
/// from the record they are given
pub fn query() -> QueryState {
    QueryState::new()
}
