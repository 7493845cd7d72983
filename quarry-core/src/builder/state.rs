//! The immutable query state and its builders
//!
//! Every builder takes the state by value and returns a new one; nothing is
//! shared between a state and the states derived from it, so forks made with
//! `clone()` can be extended independently on any thread. Misuse is recorded as
//! a sticky error that the next finisher returns without touching the database.

use super::args::{Arg, IntoArgs};
use super::common::{quote_ident, Connector, IntoColumns, JoinType, SortDirection};
use super::render::{arity_error, count_placeholders, Fragment, SqlWriter};
use crate::error::{Error, Result};
use crate::model::{Association, Model, Target};
use crate::scope::Scope;
use crate::value::Value;

#[derive(Debug, Clone)]
pub(crate) struct Predicate {
    pub connector: Connector,
    pub fragment: Fragment,
}

/// An association to load after the primary rows, rooted on its own table
#[derive(Debug, Clone)]
pub(crate) struct Preload {
    pub association: Association,
    pub query: QueryState,
}

#[derive(Debug, Clone, Default)]
pub struct QueryState {
    pub(crate) target: Option<Target>,
    pub(crate) predicates: Vec<Predicate>,
    /// Conditions ANDed outside the caller's predicates so an OR cannot widen them
    pub(crate) guards: Vec<Fragment>,
    pub(crate) joins: Vec<Fragment>,
    pub(crate) group: Vec<String>,
    pub(crate) having: Vec<Fragment>,
    pub(crate) order: Vec<String>,
    pub(crate) limit: Option<i64>,
    pub(crate) offset: Option<i64>,
    pub(crate) select: Vec<String>,
    pub(crate) distinct: bool,
    pub(crate) unscoped: bool,
    pub(crate) preloads: Vec<Preload>,
    pub(crate) error: Option<Error>,
}

impl QueryState {
    /// An unbound state; bind a table with [`table`](Self::table) or [`model`](Self::model)
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn rooted(target: Target) -> Self {
        Self {
            target: Some(target),
            ..Self::default()
        }
    }

    /// The sticky error, if a builder call was misused
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn table_name(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.table.as_str())
    }

    /// Apply `f` unless the state already carries an error; the first error wins
    fn chain(mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Self {
        if self.error.is_none() {
            if let Err(err) = f(&mut self) {
                self.error = Some(err);
            }
        }
        self
    }

    pub(crate) fn fail(self, err: Error) -> Self {
        self.chain(|_| Err(err))
    }

    // ----- binding -----

    /// Bind the state to a bare table
    pub fn table(self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.chain(|q| {
            if name.trim().is_empty() {
                return Err(Error::missing_data("table name is empty"));
            }
            q.target = Some(Target::table(name));
            Ok(())
        })
    }

    /// Bind the state to a model's table, primary key, soft-delete column and associations
    pub fn model<T: Model>(self) -> Self {
        self.chain(|q| {
            if T::TABLE.trim().is_empty() {
                return Err(Error::missing_data(format!(
                    "{} has no table mapping",
                    std::any::type_name::<T>()
                )));
            }
            q.target = Some(T::target());
            Ok(())
        })
    }

    // ----- predicates -----

    /// Add a predicate, ANDed with the previous ones
    ///
    /// `?` marks a positional argument. At most one argument group is accepted.
    pub fn where_(self, sql: impl Into<String>, args: impl IntoArgs) -> Self {
        self.predicate(Connector::And, sql.into(), args)
    }

    /// Add a predicate, ORed with the previous ones
    pub fn or(self, sql: impl Into<String>, args: impl IntoArgs) -> Self {
        self.predicate(Connector::Or, sql.into(), args)
    }

    /// Shorthand for `where_("<column> = ?", (value,))` with the column quoted
    pub fn where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        let sql = format!("{} = ?", quote_ident(column));
        self.predicate(Connector::And, sql, (value.into(),))
    }

    fn predicate(self, connector: Connector, sql: String, args: impl IntoArgs) -> Self {
        self.chain(|q| {
            let fragment = predicate_fragment(sql, args)?;
            q.predicates.push(Predicate {
                connector,
                fragment,
            });
            Ok(())
        })
    }

    pub(crate) fn guard(self, sql: impl Into<String>, args: Vec<Arg>) -> Self {
        let fragment = Fragment::new(sql, args);
        self.chain(|q| {
            q.guards.push(fragment);
            Ok(())
        })
    }

    // ----- joins, grouping, ordering -----

    /// Append a raw join clause, e.g. `"LEFT JOIN posts ON posts.user_id = users.id"`
    pub fn joins(self, sql: impl Into<String>, args: impl IntoArgs) -> Self {
        let sql = sql.into();
        self.chain(|q| {
            let fragment = predicate_fragment(sql, args)?;
            q.joins.push(fragment);
            Ok(())
        })
    }

    pub fn join(self, join_type: JoinType, table: &str, on: &str) -> Self {
        let sql = format!("{join_type} JOIN {} ON {on}", quote_ident(table));
        self.joins(sql, ())
    }

    /// Replace the GROUP BY list
    pub fn group(self, columns: impl IntoColumns) -> Self {
        let columns = columns.into_columns();
        self.chain(|q| {
            q.group = non_blank_columns("group", columns)?;
            Ok(())
        })
    }

    /// Add a HAVING condition, ANDed with previous ones
    pub fn having(self, sql: impl Into<String>, args: impl IntoArgs) -> Self {
        let sql = sql.into();
        self.chain(|q| {
            let fragment = predicate_fragment(sql, args)?;
            q.having.push(fragment);
            Ok(())
        })
    }

    /// Append a raw ORDER BY term, e.g. `"created_at DESC"`
    pub fn order(self, term: impl Into<String>) -> Self {
        let term = term.into();
        self.chain(|q| {
            if term.trim().is_empty() {
                return Err(Error::not_valid("order term is empty"));
            }
            q.order.push(term);
            Ok(())
        })
    }

    pub fn order_by(self, column: &str, direction: SortDirection) -> Self {
        self.order(format!("{} {direction}", quote_ident(column)))
    }

    pub fn limit(self, limit: i64) -> Self {
        self.chain(|q| {
            if limit < 0 {
                return Err(Error::not_valid(format!("limit must not be negative, got {limit}")));
            }
            q.limit = Some(limit);
            Ok(())
        })
    }

    pub fn offset(self, offset: i64) -> Self {
        self.chain(|q| {
            if offset < 0 {
                return Err(Error::not_valid(format!("offset must not be negative, got {offset}")));
            }
            q.offset = Some(offset);
            Ok(())
        })
    }

    /// Replace the selected columns
    pub fn select(self, columns: impl IntoColumns) -> Self {
        let columns = columns.into_columns();
        self.chain(|q| {
            q.select = non_blank_columns("select", columns)?;
            Ok(())
        })
    }

    pub fn distinct(self) -> Self {
        self.chain(|q| {
            q.distinct = true;
            Ok(())
        })
    }

    /// Include soft-deleted rows, and make `delete` hard-delete
    pub fn unscoped(self) -> Self {
        self.chain(|q| {
            q.unscoped = true;
            Ok(())
        })
    }

    // ----- scopes and preloads -----

    pub fn scope(self, scope: &Scope) -> Self {
        if self.error.is_some() {
            return self;
        }
        scope.apply(self)
    }

    pub fn scopes(self, scopes: &[Scope]) -> Self {
        scopes.iter().fold(self, |q, scope| q.scope(scope))
    }

    /// Load a named association (dotted for nesting, e.g. `"posts.comments"`)
    pub fn preload(self, path: &str) -> Self {
        self.preload_with(path, &[])
    }

    /// Load an association, filtering its rows with `scopes`
    ///
    /// The scopes see a fresh state rooted on the association's table and apply
    /// only to the final segment of `path`; the primary query is unaffected.
    pub fn preload_with(self, path: &str, scopes: &[Scope]) -> Self {
        self.chain(|q| {
            let segments: Vec<&str> = path.split('.').map(str::trim).collect();
            if segments.iter().any(|s| s.is_empty()) {
                return Err(Error::missing_data(format!("invalid preload path `{path}`")));
            }
            q.add_preload(&segments, scopes)
        })
    }

    fn add_preload(&mut self, segments: &[&str], scopes: &[Scope]) -> Result<()> {
        let Some((name, rest)) = segments.split_first() else {
            return Err(Error::missing_data("empty preload path"));
        };
        let target = self.target.as_ref().ok_or_else(|| {
            Error::missing_data(format!("cannot preload `{name}` without a bound table"))
        })?;
        let association = target.association(name).ok_or_else(|| {
            Error::missing_data(format!("table `{}` has no association `{name}`", target.table))
        })?;

        let index = match self.preloads.iter().position(|p| p.association.name == *name) {
            Some(index) => index,
            None => {
                self.preloads.push(Preload {
                    query: QueryState::rooted(association.target()),
                    association,
                });
                self.preloads.len() - 1
            }
        };
        let preload = &mut self.preloads[index];

        if rest.is_empty() {
            let query = std::mem::take(&mut preload.query).scopes(scopes);
            if let Some(err) = &query.error {
                return Err(err.clone());
            }
            preload.query = query;
            Ok(())
        } else {
            preload.query.add_preload(rest, scopes)
        }
    }

    // ----- rendering -----

    /// Render the SELECT this state describes
    pub fn to_sql(&self) -> Result<(String, Vec<Value>)> {
        let mut w = SqlWriter::new();
        self.write_select(&mut w)?;
        Ok(w.finish())
    }

    pub(crate) fn require_target(&self) -> Result<&Target> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        self.target
            .as_ref()
            .ok_or_else(|| Error::missing_data("no table bound to the query"))
    }

    pub(crate) fn write_select(&self, w: &mut SqlWriter) -> Result<()> {
        self.write_select_shaped(w, true)
    }

    /// `ordered = false` drops ORDER BY, LIMIT and OFFSET (for counting)
    pub(crate) fn write_select_shaped(&self, w: &mut SqlWriter, ordered: bool) -> Result<()> {
        let target = self.require_target()?;
        let table = quote_ident(&target.table);

        w.push("SELECT ");
        if self.distinct {
            w.push("DISTINCT ");
        }
        if self.select.is_empty() {
            w.push(&format!("{table}.*"));
        } else {
            w.push(&self.select.join(", "));
        }
        w.push(" FROM ").push(&table);

        for join in &self.joins {
            w.push(" ");
            w.fragment(join)?;
        }
        self.write_where(w)?;

        if !self.group.is_empty() {
            w.push(" GROUP BY ").push(&self.group.join(", "));
        }
        for (i, having) in self.having.iter().enumerate() {
            w.push(if i == 0 { " HAVING (" } else { " AND (" });
            w.fragment(having)?;
            w.push(")");
        }

        if ordered {
            if !self.order.is_empty() {
                w.push(" ORDER BY ").push(&self.order.join(", "));
            }
            if let Some(limit) = self.limit {
                w.push(&format!(" LIMIT {limit}"));
            }
            if let Some(offset) = self.offset {
                w.push(&format!(" OFFSET {offset}"));
            }
        }
        Ok(())
    }

    /// The soft-delete guard, when the target has one and the state is scoped
    pub(crate) fn soft_delete_guard(&self) -> Option<String> {
        if self.unscoped {
            return None;
        }
        let target = self.target.as_ref()?;
        let column = target.soft_delete.as_ref()?;
        Some(format!(
            "{}.{} IS NULL",
            quote_ident(&target.table),
            quote_ident(column)
        ))
    }

    pub(crate) fn has_predicates(&self) -> bool {
        !self.predicates.is_empty() || !self.guards.is_empty()
    }

    pub(crate) fn write_where(&self, w: &mut SqlWriter) -> Result<()> {
        let soft_delete = self.soft_delete_guard();
        if soft_delete.is_none() && !self.has_predicates() {
            return Ok(());
        }

        w.push(" WHERE ");
        let mut first = true;
        let mut and = |w: &mut SqlWriter| {
            if !first {
                w.push(" AND ");
            }
            first = false;
        };

        if let Some(guard) = &soft_delete {
            and(w);
            w.push(guard);
        }
        for guard in &self.guards {
            and(w);
            w.push("(");
            w.fragment(guard)?;
            w.push(")");
        }
        if !self.predicates.is_empty() {
            and(w);
            let grouped = soft_delete.is_some() || !self.guards.is_empty();
            if grouped {
                w.push("(");
            }
            for (i, predicate) in self.predicates.iter().enumerate() {
                if i > 0 {
                    w.push(&format!(" {} ", predicate.connector));
                }
                w.push("(");
                w.fragment(&predicate.fragment)?;
                w.push(")");
            }
            if grouped {
                w.push(")");
            }
        }
        Ok(())
    }

    pub(crate) fn has_shape_modifiers(&self) -> bool {
        !self.joins.is_empty()
            || !self.group.is_empty()
            || !self.having.is_empty()
            || !self.order.is_empty()
            || self.limit.is_some()
            || self.offset.is_some()
    }
}

/// Validate a predicate-position fragment and take its single argument group
fn predicate_fragment(sql: String, args: impl IntoArgs) -> Result<Fragment> {
    let fragment = statement_fragment(sql, args)?;
    if fragment.sql.trim().is_empty() {
        return Err(Error::not_valid("fragment is empty"));
    }
    for arg in &fragment.args {
        if let Arg::Value(value) = arg {
            if value.is_null_equivalent() {
                return Err(Error::not_valid(format!(
                    "NULL bound in `{}`; use IS NULL instead",
                    fragment.sql
                )));
            }
        }
    }
    Ok(fragment)
}

/// Validate a raw statement fragment: one argument group, matching arity, clean sub-queries
pub(crate) fn statement_fragment(sql: String, args: impl IntoArgs) -> Result<Fragment> {
    let mut groups = args.into_groups();
    if groups.len() > 1 {
        return Err(Error::not_valid(format!(
            "`{sql}` accepts one argument group, got {}",
            groups.len()
        )));
    }
    let args = groups.pop().unwrap_or_default();

    let placeholders = count_placeholders(&sql);
    if placeholders != args.len() {
        return Err(arity_error(&sql, placeholders, args.len()));
    }
    for arg in &args {
        if let Arg::Query(sub) = arg {
            sub.require_target()?;
        }
    }
    Ok(Fragment::new(sql, args))
}

fn non_blank_columns(clause: &str, columns: Vec<String>) -> Result<Vec<String>> {
    if columns.is_empty() || columns.iter().any(|c| c.trim().is_empty()) {
        return Err(Error::not_valid(format!("{clause} list contains an empty column")));
    }
    Ok(columns)
}
