//! Static bindings from record types to tables

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A record type backed by a table
///
/// The binding is declared, never inferred:
///
/// ```
/// use quarry_core::Model;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct User {
///     id: i64,
///     email: String,
/// }
///
/// impl Model for User {
///     const TABLE: &'static str = "users";
/// }
/// ```
pub trait Model: Serialize + DeserializeOwned + Send + Sync + Unpin {
    const TABLE: &'static str;

    const PRIMARY_KEY: &'static str = "id";

    /// Timestamp column marking a row as deleted; reads skip such rows
    const SOFT_DELETE: Option<&'static str> = None;

    /// Associations available to `preload`
    fn associations() -> Vec<Association> {
        Vec::new()
    }

    fn target() -> Target {
        Target {
            table: Self::TABLE.to_string(),
            primary_key: Some(Self::PRIMARY_KEY.to_string()),
            soft_delete: Self::SOFT_DELETE.map(str::to_string),
            associations: Self::associations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    /// Children hold `foreign_key` pointing at the parent's `references` column
    HasMany,
    HasOne,
    /// The parent holds `foreign_key` pointing at the child's `references` column
    BelongsTo,
}

/// A named relation from one table to another
#[derive(Debug, Clone)]
pub struct Association {
    pub name: &'static str,
    pub relation: Relation,
    pub table: &'static str,
    pub foreign_key: &'static str,
    pub references: &'static str,
    pub soft_delete: Option<&'static str>,
    pub associations: fn() -> Vec<Association>,
}

impl Association {
    /// Describe the association through the child model's binding
    ///
    /// For `HasMany`/`HasOne`, `foreign_key` lives on `T` and `references` is the
    /// parent's primary key. For `BelongsTo` it is the reverse.
    pub fn of<T: Model>(name: &'static str, relation: Relation, foreign_key: &'static str) -> Self {
        Self {
            name,
            relation,
            table: T::TABLE,
            foreign_key,
            references: "id",
            soft_delete: T::SOFT_DELETE,
            associations: T::associations,
        }
    }

    pub fn has_many<T: Model>(name: &'static str, foreign_key: &'static str) -> Self {
        Self::of::<T>(name, Relation::HasMany, foreign_key)
    }

    pub fn has_one<T: Model>(name: &'static str, foreign_key: &'static str) -> Self {
        Self::of::<T>(name, Relation::HasOne, foreign_key)
    }

    pub fn belongs_to<T: Model>(name: &'static str, foreign_key: &'static str) -> Self {
        let mut assoc = Self::of::<T>(name, Relation::BelongsTo, foreign_key);
        assoc.references = T::PRIMARY_KEY;
        assoc
    }

    /// Override the referenced column (defaults to `id`, or the child's primary key for `BelongsTo`)
    pub fn references(mut self, column: &'static str) -> Self {
        self.references = column;
        self
    }

    /// Column on the parent row holding the join key
    pub(crate) fn parent_key(&self) -> &'static str {
        match self.relation {
            Relation::BelongsTo => self.foreign_key,
            Relation::HasMany | Relation::HasOne => self.references,
        }
    }

    /// Column on the child rows matched against the parent key
    pub(crate) fn child_key(&self) -> &'static str {
        match self.relation {
            Relation::BelongsTo => self.references,
            Relation::HasMany | Relation::HasOne => self.foreign_key,
        }
    }

    pub(crate) fn target(&self) -> Target {
        Target {
            table: self.table.to_string(),
            primary_key: None,
            soft_delete: self.soft_delete.map(str::to_string),
            associations: self.associations,
        }
    }
}

fn no_associations() -> Vec<Association> {
    Vec::new()
}

/// The table a query is bound to
#[derive(Clone)]
pub struct Target {
    pub table: String,
    pub primary_key: Option<String>,
    pub soft_delete: Option<String>,
    pub associations: fn() -> Vec<Association>,
}

impl Target {
    /// A bare table with no model behind it
    pub fn table(name: impl Into<String>) -> Self {
        Self {
            table: name.into(),
            primary_key: None,
            soft_delete: None,
            associations: no_associations,
        }
    }

    pub fn association(&self, name: &str) -> Option<Association> {
        (self.associations)().into_iter().find(|a| a.name == name)
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("soft_delete", &self.soft_delete)
            .finish()
    }
}
