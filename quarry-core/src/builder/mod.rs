//! Query builder module

pub mod args;
pub mod common;
pub mod render;
pub mod state;

// Re-export types from submodules
pub use args::{Arg, Args, IntoArg, IntoArgs};
pub use common::{quote_ident, quote_name, Connector, IntoColumns, JoinType, SortDirection};
pub use render::{Fragment, SqlWriter};
pub use state::QueryState;
