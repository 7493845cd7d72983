//! Finishers: run a query state against a pool
//!
//! Every finisher checks the sticky error first and returns it without
//! touching the pool. Errors leaving a finisher carry the bound table as
//! their target.

use crate::builder::common::{quote_ident, quote_name};
use crate::builder::state::statement_fragment;
use crate::builder::{Arg, IntoArgs, QueryState, SortDirection, SqlWriter};
use crate::error::{Error, Result};
use crate::executor::{ConnectionPool, Row};
use crate::model::{Model, Target};
use crate::preload;
use crate::updates::{json_kind, Updates};
use crate::value::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;

impl QueryState {
    fn locate(&self, err: Error) -> Error {
        match self.table_name() {
            Some(table) => err.with_target(table),
            None => err,
        }
    }

    /// Bind the model's table unless the state already names one
    fn bind_model<T: Model>(self) -> Self {
        if self.target.is_some() || self.error.is_some() {
            self
        } else {
            self.model::<T>()
        }
    }

    /// Run the SELECT and attach every declared preload
    pub(crate) async fn fetch_rows(&self, pool: &impl ConnectionPool) -> Result<Vec<Row>> {
        let (sql, params) = self.to_sql()?;
        let mut rows = pool.fetch_all(&sql, &params).await?;
        preload::load(&mut rows, &self.preloads, pool).await?;
        Ok(rows)
    }

    /// Fetch every matching row
    ///
    /// Zero rows is an empty vector, never an error.
    #[tracing::instrument(skip_all, fields(table = self.table_name()))]
    pub async fn find<T: DeserializeOwned>(self, pool: &impl ConnectionPool) -> Result<Vec<T>> {
        let result = match self.fetch_rows(pool).await {
            Ok(rows) => decode_rows(rows),
            Err(err) => Err(err),
        };
        result.map_err(|err| self.locate(err))
    }

    /// Fetch the first matching row, by primary key unless an order is set
    ///
    /// Fails with [`ErrorKind::NotFound`](crate::ErrorKind::NotFound) when
    /// nothing matches.
    #[tracing::instrument(skip_all, fields(table = self.table_name()))]
    pub async fn first<T: DeserializeOwned>(self, pool: &impl ConnectionPool) -> Result<T> {
        self.single(pool, SortDirection::Asc).await
    }

    /// The mirror of [`first`](Self::first): primary key descending
    #[tracing::instrument(skip_all, fields(table = self.table_name()))]
    pub async fn last<T: DeserializeOwned>(self, pool: &impl ConnectionPool) -> Result<T> {
        self.single(pool, SortDirection::Desc).await
    }

    async fn single<T: DeserializeOwned>(
        self,
        pool: &impl ConnectionPool,
        direction: SortDirection,
    ) -> Result<T> {
        let key_order = match &self.target {
            Some(Target {
                table,
                primary_key: Some(pk),
                ..
            }) if self.order.is_empty() => Some(format!(
                "{}.{} {direction}",
                quote_ident(table),
                quote_name(pk)
            )),
            _ => None,
        };
        let query = match key_order {
            Some(term) => self.order(term),
            None => self,
        }
        .limit(1);

        let result = match query.fetch_rows(pool).await {
            Ok(rows) => match rows.into_iter().next() {
                Some(row) => decode_row(row),
                None => Err(Error::not_found("no row matched the query")),
            },
            Err(err) => Err(err),
        };
        result.map_err(|err| query.locate(err))
    }

    /// Insert one record and write the stored row back into it
    ///
    /// Null fields, association fields and a zero-valued primary key are left
    /// out so the table's defaults apply. The state's table wins over the
    /// model's when both are set.
    #[tracing::instrument(skip_all, fields(table = self.table_name().unwrap_or(T::TABLE)))]
    pub async fn create<T: Model>(self, pool: &impl ConnectionPool, record: &mut T) -> Result<()> {
        let query = self.bind_model::<T>();
        let result: Result<()> = async {
            let target = query.require_target()?;
            let object = record_object(record)?;
            let columns = insertable::<T>(&object);
            let (sql, params) = insert_sql(target, std::slice::from_ref(&columns));
            let row = pool
                .fetch_all(&sql, &params)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| Error::unexpected("insert returned no row"))?;
            *record = merge_returned(object, row)?;
            Ok(())
        }
        .await;
        result.map_err(|err| query.locate(err))
    }

    /// Insert a batch in one statement and write every stored row back
    ///
    /// The column list is the union over the batch; a record missing one of
    /// those columns inserts NULL for it rather than the column default.
    #[tracing::instrument(skip_all, fields(table = self.table_name().unwrap_or(T::TABLE), count = records.len()))]
    pub async fn create_many<T: Model>(
        self,
        pool: &impl ConnectionPool,
        records: &mut [T],
    ) -> Result<()> {
        let query = self.bind_model::<T>();
        let result: Result<()> = async {
            let target = query.require_target()?;
            if records.is_empty() {
                return Err(Error::missing_data("no records to create"));
            }
            let objects = records
                .iter()
                .map(|record| record_object(record))
                .collect::<Result<Vec<_>>>()?;
            let rows: Vec<Row> = objects.iter().map(insertable::<T>).collect();

            let returned = if rows.iter().all(Row::is_empty) {
                let mut returned = Vec::with_capacity(rows.len());
                for row in &rows {
                    let (sql, params) = insert_sql(target, std::slice::from_ref(row));
                    returned.extend(pool.fetch_all(&sql, &params).await?);
                }
                returned
            } else {
                let (sql, params) = insert_sql(target, &rows);
                pool.fetch_all(&sql, &params).await?
            };

            if returned.len() != records.len() {
                return Err(Error::unexpected(format!(
                    "inserted {} record(s) but {} row(s) came back",
                    records.len(),
                    returned.len()
                )));
            }
            for ((record, object), row) in records.iter_mut().zip(objects).zip(returned) {
                *record = merge_returned(object, row)?;
            }
            Ok(())
        }
        .await;
        result.map_err(|err| query.locate(err))
    }

    /// Insert one row from a column map and return it as stored
    #[tracing::instrument(skip_all, fields(table = self.table_name()))]
    pub async fn create_from(self, pool: &impl ConnectionPool, values: Updates) -> Result<Row> {
        let result: Result<Row> = async {
            let target = self.require_target()?;
            if values.is_empty() {
                return Err(Error::missing_data("no columns to insert"));
            }
            let (sql, params) = insert_sql(target, &[values.to_row()]);
            pool.fetch_all(&sql, &params)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| Error::unexpected("insert returned no row"))
        }
        .await;
        result.map_err(|err| self.locate(err))
    }

    /// Apply a column map to every matching row
    ///
    /// Requires at least one predicate. Every value in the map is written,
    /// NULLs included; chain [`Updates::strip_nils`] to skip unset fields.
    /// Fails with [`ErrorKind::NotFound`](crate::ErrorKind::NotFound) when no
    /// row matched.
    #[tracing::instrument(skip_all, fields(table = self.table_name(), columns = updates.len()))]
    pub async fn update(self, pool: &impl ConnectionPool, updates: Updates) -> Result<u64> {
        let result: Result<u64> = async {
            let target = self.require_target()?;
            if updates.is_empty() {
                return Err(Error::missing_data("no columns to update"));
            }
            if !self.has_predicates() {
                return Err(Error::not_valid(
                    "update without a where clause would touch every row",
                ));
            }
            if self.has_shape_modifiers() {
                return Err(Error::not_valid(
                    "update cannot carry joins, grouping, ordering or paging",
                ));
            }

            let table = quote_ident(&target.table);
            let mut w = SqlWriter::new();
            let document = w.param(Value::Json(updates.to_document()));
            let assignments = updates
                .columns()
                .map(|column| {
                    let column = quote_name(column);
                    format!("{column} = (jsonb_populate_record(NULL::{table}, {document})).{column}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            w.push(&format!("UPDATE {table} SET {assignments}"));
            self.write_where(&mut w)?;

            let (sql, params) = w.finish();
            let affected = pool.execute(&sql, &params).await?;
            if affected == 0 {
                return Err(Error::not_found("no row matched the update"));
            }
            Ok(affected)
        }
        .await;
        result.map_err(|err| self.locate(err))
    }

    /// Delete one record by its primary key
    ///
    /// Soft-delete tables stamp the marker column instead, unless the state is
    /// [`unscoped`](Self::unscoped). A record whose key matches nothing, the
    /// zero key included, fails with
    /// [`ErrorKind::NotFound`](crate::ErrorKind::NotFound).
    #[tracing::instrument(skip_all, fields(table = self.table_name().unwrap_or(T::TABLE)))]
    pub async fn delete<T: Model>(self, pool: &impl ConnectionPool, record: &T) -> Result<u64> {
        let query = self.bind_model::<T>();
        let query = match key_guard::<T>(&query, record) {
            Ok((sql, args)) => query.guard(sql, args),
            Err(err) => query.fail(err),
        };
        query.remove(pool).await
    }

    /// Delete every matching row; requires at least one predicate
    #[tracing::instrument(skip_all, fields(table = self.table_name()))]
    pub async fn delete_where(self, pool: &impl ConnectionPool) -> Result<u64> {
        if self.error.is_none() && !self.has_predicates() {
            let err = Error::not_valid("delete without a where clause would remove every row");
            return Err(self.locate(err));
        }
        self.remove(pool).await
    }

    async fn remove(self, pool: &impl ConnectionPool) -> Result<u64> {
        let result: Result<u64> = async {
            let target = self.require_target()?;
            if self.has_shape_modifiers() {
                return Err(Error::not_valid(
                    "delete cannot carry joins, grouping, ordering or paging",
                ));
            }

            let table = quote_ident(&target.table);
            let mut w = SqlWriter::new();
            match (&target.soft_delete, self.unscoped) {
                (Some(column), false) => {
                    w.push(&format!("UPDATE {table} SET {} = NOW()", quote_name(column)))
                }
                _ => w.push(&format!("DELETE FROM {table}")),
            };
            self.write_where(&mut w)?;

            let (sql, params) = w.finish();
            let affected = pool.execute(&sql, &params).await?;
            if affected == 0 {
                return Err(Error::not_found("no row matched the delete"));
            }
            Ok(affected)
        }
        .await;
        result.map_err(|err| self.locate(err))
    }

    /// Run a raw statement; zero affected rows is
    /// [`ErrorKind::NotFound`](crate::ErrorKind::NotFound)
    #[tracing::instrument(skip_all, fields(table = self.table_name()))]
    pub async fn exec(
        self,
        pool: &impl ConnectionPool,
        sql: &str,
        args: impl IntoArgs,
    ) -> Result<u64> {
        let result = match self.run_statement(pool, sql, args).await {
            Ok(0) => Err(Error::not_found("statement affected no rows")),
            other => other,
        };
        result.map_err(|err| self.locate(err))
    }

    /// Like [`exec`](Self::exec), but zero affected rows is `Ok(0)`
    #[tracing::instrument(skip_all, fields(table = self.table_name()))]
    pub async fn exec_allow_empty(
        self,
        pool: &impl ConnectionPool,
        sql: &str,
        args: impl IntoArgs,
    ) -> Result<u64> {
        let result = self.run_statement(pool, sql, args).await;
        result.map_err(|err| self.locate(err))
    }

    async fn run_statement(
        &self,
        pool: &impl ConnectionPool,
        sql: &str,
        args: impl IntoArgs,
    ) -> Result<u64> {
        let (sql, params) = self.statement(sql, args)?;
        pool.execute(&sql, &params).await
    }

    /// Run a raw query and decode its rows; the state's preloads do not apply
    #[tracing::instrument(skip_all, fields(table = self.table_name()))]
    pub async fn raw<T: DeserializeOwned>(
        self,
        pool: &impl ConnectionPool,
        sql: &str,
        args: impl IntoArgs,
    ) -> Result<Vec<T>> {
        let result: Result<Vec<T>> = async {
            let (sql, params) = self.statement(sql, args)?;
            decode_rows(pool.fetch_all(&sql, &params).await?)
        }
        .await;
        result.map_err(|err| self.locate(err))
    }

    fn statement(&self, sql: &str, args: impl IntoArgs) -> Result<(String, Vec<Value>)> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        let fragment = statement_fragment(sql.to_string(), args)?;
        let mut w = SqlWriter::new();
        w.fragment(&fragment)?;
        Ok(w.finish())
    }

    /// Count the rows the SELECT would return
    ///
    /// Ordering and paging are dropped; grouping and DISTINCT are kept, so a
    /// grouped state counts groups.
    #[tracing::instrument(skip_all, fields(table = self.table_name()))]
    pub async fn count(self, pool: &impl ConnectionPool) -> Result<u64> {
        let result: Result<u64> = async {
            let mut w = SqlWriter::new();
            w.push("SELECT COUNT(*) AS count FROM (");
            self.write_select_shaped(&mut w, false)?;
            w.push(") AS count_subquery");

            let (sql, params) = w.finish();
            let rows = pool.fetch_all(&sql, &params).await?;
            let count = scalar(rows, "count")?;
            count
                .as_u64()
                .ok_or_else(|| Error::unexpected(format!("count came back as {}", json_kind(&count))))
        }
        .await;
        result.map_err(|err| self.locate(err))
    }

    /// True when at least one row matches
    #[tracing::instrument(skip_all, fields(table = self.table_name()))]
    pub async fn exists(self, pool: &impl ConnectionPool) -> Result<bool> {
        let result: Result<bool> = async {
            let mut w = SqlWriter::new();
            w.push("SELECT EXISTS(");
            self.write_select(&mut w)?;
            w.push(") AS \"exists\"");

            let (sql, params) = w.finish();
            let rows = pool.fetch_all(&sql, &params).await?;
            let exists = scalar(rows, "exists")?;
            exists
                .as_bool()
                .ok_or_else(|| Error::unexpected(format!("exists came back as {}", json_kind(&exists))))
        }
        .await;
        result.map_err(|err| self.locate(err))
    }
}

fn decode_row<T: DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(serde_json::Value::Object(row))?)
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
    rows.into_iter().map(decode_row).collect()
}

fn scalar(rows: Vec<Row>, column: &str) -> Result<serde_json::Value> {
    rows.into_iter()
        .next()
        .and_then(|mut row| row.remove(column))
        .ok_or_else(|| Error::unexpected(format!("result has no `{column}` column")))
}

fn record_object<T: Serialize>(record: &T) -> Result<Row> {
    match serde_json::to_value(record)? {
        serde_json::Value::Object(object) => Ok(object),
        other => Err(Error::missing_data(format!(
            "record serialized to {} rather than an object of columns",
            json_kind(&other)
        ))),
    }
}

/// The columns of a record that an INSERT should name
fn insertable<T: Model>(object: &Row) -> Row {
    let associations = T::associations();
    object
        .iter()
        .filter(|(column, value)| {
            !value.is_null()
                && !associations.iter().any(|a| a.name == column.as_str())
                && !(column.as_str() == T::PRIMARY_KEY && is_zero_key(value))
        })
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect()
}

/// Null, numeric zero, the empty string and the nil UUID
fn is_zero_key(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::Number(n) => n.as_f64() == Some(0.0),
        serde_json::Value::String(s) => {
            s.is_empty() || uuid::Uuid::parse_str(s).is_ok_and(|u| u.is_nil())
        }
        _ => false,
    }
}

/// `INSERT ... SELECT ... FROM jsonb_populate_record(set)` so Postgres casts
/// every value to its column type
fn insert_sql(target: &Target, rows: &[Row]) -> (String, Vec<Value>) {
    let table = quote_ident(&target.table);
    let columns: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();
    if columns.is_empty() {
        return (format!("INSERT INTO {table} DEFAULT VALUES RETURNING *"), Vec::new());
    }

    let list = columns
        .iter()
        .map(|column| quote_name(column))
        .collect::<Vec<_>>()
        .join(", ");
    let (function, document) = match rows {
        [row] => ("jsonb_populate_record", serde_json::Value::Object(row.clone())),
        _ => (
            "jsonb_populate_recordset",
            serde_json::Value::Array(rows.iter().cloned().map(serde_json::Value::Object).collect()),
        ),
    };
    (
        format!(
            "INSERT INTO {table} ({list}) SELECT {list} FROM {function}(NULL::{table}, $1) RETURNING *"
        ),
        vec![Value::Json(document)],
    )
}

fn merge_returned<T: DeserializeOwned>(mut object: Row, row: Row) -> Result<T> {
    object.extend(row);
    decode_row(object)
}

/// Primary-key guard for deleting one record
fn key_guard<T: Model>(query: &QueryState, record: &T) -> Result<(String, Vec<Arg>)> {
    let target = query.require_target()?;
    let pk = target.primary_key.as_deref().unwrap_or(T::PRIMARY_KEY);
    let object = record_object(record)?;
    let key = object
        .get(pk)
        .cloned()
        .ok_or_else(|| Error::missing_data(format!("record has no `{pk}` field")))?;

    let table = quote_ident(&target.table);
    let column = quote_name(pk);
    let mut keyed = Row::new();
    keyed.insert(pk.to_string(), key);
    Ok((
        format!("{table}.{column} = (jsonb_populate_record(NULL::{table}, ?)).{column}"),
        vec![Arg::Value(Value::Json(serde_json::Value::Object(keyed)))],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPool;
    use crate::model::fixtures::{Post, Unmapped, User};
    use crate::ErrorKind;
    use serde_json::json;

    fn ada() -> User {
        User {
            id: 0,
            email: "ada@example.com".to_string(),
            nickname: None,
            posts: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_find_with_no_rows_is_empty() {
        let pool = MockPool::new();
        let users: Vec<User> = crate::model::<User>()
            .where_("email LIKE ?", ("%@example.com",))
            .find(&pool)
            .await
            .unwrap();

        assert!(users.is_empty());
        assert_eq!(
            pool.calls(),
            vec![(
                r#"SELECT "users".* FROM "users" WHERE (email LIKE $1)"#.to_string(),
                vec![Value::from("%@example.com")]
            )]
        );
    }

    #[tokio::test]
    async fn test_first_orders_by_primary_key() {
        let pool = MockPool::new();
        pool.push_rows(vec![json!({"id": 3, "email": "c@example.com"})]);

        let user: User = crate::model::<User>().first(&pool).await.unwrap();
        assert_eq!(user.id, 3);

        let err = crate::model::<User>().last::<User>(&pool).await.unwrap_err();
        assert!(err.is(ErrorKind::NotFound));
        assert_eq!(err.target(), Some("users"));
        assert_eq!(
            pool.statements(),
            vec![
                r#"SELECT "users".* FROM "users" ORDER BY "users"."id" ASC LIMIT 1"#,
                r#"SELECT "users".* FROM "users" ORDER BY "users"."id" DESC LIMIT 1"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_first_keeps_explicit_order() {
        let pool = MockPool::new();
        let _ = crate::table("events").order("at DESC").first::<Row>(&pool).await;
        assert_eq!(
            pool.statements(),
            vec![r#"SELECT "events".* FROM "events" ORDER BY at DESC LIMIT 1"#]
        );
    }

    #[tokio::test]
    async fn test_sticky_error_skips_the_pool() {
        let pool = MockPool::new();
        let errored = crate::model::<User>().where_("a = ? AND b = ?", (1,));

        let err = errored.clone().find::<User>(&pool).await.unwrap_err();
        assert!(err.is(ErrorKind::NotValid));
        assert!(errored.clone().count(&pool).await.is_err());
        assert!(errored.clone().delete_where(&pool).await.is_err());
        assert!(errored
            .clone()
            .update(&pool, Updates::new().set("a", 1))
            .await
            .is_err());
        assert!(errored.exec(&pool, "SELECT 1", ()).await.is_err());
        assert!(pool.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_writes_back_generated_columns() {
        let pool = MockPool::new();
        pool.push_rows(vec![
            json!({"id": 7, "email": "ada@example.com", "nickname": null}),
        ]);

        let mut user = ada();
        crate::query().create(&pool, &mut user).await.unwrap();

        assert_eq!(user.id, 7);
        assert_eq!(
            pool.calls(),
            vec![(
                r#"INSERT INTO "users" ("email") SELECT "email" FROM jsonb_populate_record(NULL::"users", $1) RETURNING *"#.to_string(),
                vec![Value::Json(json!({"email": "ada@example.com"}))]
            )]
        );
    }

    #[tokio::test]
    async fn test_create_keeps_explicit_primary_key() {
        let pool = MockPool::new();
        pool.push_rows(vec![json!({"id": 42, "email": "ada@example.com"})]);

        let mut user = User { id: 42, ..ada() };
        crate::query().create(&pool, &mut user).await.unwrap();
        let (sql, _) = pool.last_call().unwrap();
        assert!(sql.starts_with(r#"INSERT INTO "users" ("email", "id") SELECT "email", "id""#));
    }

    #[tokio::test]
    async fn test_create_requires_a_mapped_table() {
        let pool = MockPool::new();
        let mut record = Unmapped { id: 1 };
        let err = crate::query().create(&pool, &mut record).await.unwrap_err();
        assert!(err.is(ErrorKind::MissingData));
        assert!(pool.calls().is_empty());
    }

    #[tokio::test]
    async fn test_create_many() {
        let pool = MockPool::new();
        pool.push_rows(vec![
            json!({"id": 1, "user_id": 9, "title": "one", "deleted_at": null}),
            json!({"id": 2, "user_id": 9, "title": "two", "deleted_at": null}),
        ]);

        let mut posts = vec![
            Post { id: 0, user_id: 9, title: "one".into(), deleted_at: None },
            Post { id: 0, user_id: 9, title: "two".into(), deleted_at: None },
        ];
        crate::query().create_many(&pool, &mut posts).await.unwrap();
        assert_eq!(posts.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2]);

        let (sql, params) = pool.last_call().unwrap();
        assert_eq!(
            sql,
            r#"INSERT INTO "posts" ("title", "user_id") SELECT "title", "user_id" FROM jsonb_populate_recordset(NULL::"posts", $1) RETURNING *"#
        );
        assert_eq!(
            params,
            vec![Value::Json(json!([
                {"user_id": 9, "title": "one"},
                {"user_id": 9, "title": "two"}
            ]))]
        );

        let err = crate::query()
            .create_many::<Post>(&pool, &mut [])
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::MissingData));
    }

    #[tokio::test]
    async fn test_create_from_column_map() {
        let pool = MockPool::new();
        pool.push_rows(vec![json!({"id": 5, "name": "widget"})]);

        let row = crate::table("gadgets")
            .create_from(&pool, Updates::new().set("name", "widget"))
            .await
            .unwrap();
        assert_eq!(row["id"], json!(5));

        let err = crate::table("gadgets")
            .create_from(&pool, Updates::new())
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::MissingData));
        assert_eq!(err.target(), Some("gadgets"));
    }

    #[tokio::test]
    async fn test_update_sql() {
        let pool = MockPool::new();
        pool.push_affected(2);

        let affected = crate::model::<Post>()
            .where_("user_id = ?", (9,))
            .update(&pool, Updates::new().set("title", "renamed").set("user_id", 10))
            .await
            .unwrap();

        assert_eq!(affected, 2);
        assert_eq!(
            pool.calls(),
            vec![(
                concat!(
                    r#"UPDATE "posts" SET "title" = (jsonb_populate_record(NULL::"posts", $1))."title", "#,
                    r#""user_id" = (jsonb_populate_record(NULL::"posts", $1))."user_id" "#,
                    r#"WHERE "posts"."deleted_at" IS NULL AND ((user_id = $2))"#
                )
                .to_string(),
                vec![
                    Value::Json(json!({"title": "renamed", "user_id": 10})),
                    Value::I32(9)
                ]
            )]
        );
    }

    #[tokio::test]
    async fn test_update_rejections() {
        let pool = MockPool::new();

        let err = crate::table("users")
            .where_eq("id", 1)
            .update(&pool, Updates::new())
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::MissingData));

        let err = crate::table("users")
            .update(&pool, Updates::new().set("email", "x"))
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::NotValid));

        let err = crate::table("users")
            .where_eq("id", 1)
            .limit(1)
            .update(&pool, Updates::new().set("email", "x"))
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::NotValid));
        assert!(pool.calls().is_empty());

        let err = crate::table("users")
            .where_eq("id", 1)
            .update(&pool, Updates::new().set("email", "x"))
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::NotFound));
        assert_eq!(err.target(), Some("users"));
    }

    #[tokio::test]
    async fn test_delete_by_primary_key() {
        let pool = MockPool::new();
        pool.push_affected(1);

        let user = User { id: 7, ..ada() };
        crate::query().delete(&pool, &user).await.unwrap();
        assert_eq!(
            pool.calls(),
            vec![(
                r#"DELETE FROM "users" WHERE ("users"."id" = (jsonb_populate_record(NULL::"users", $1))."id")"#.to_string(),
                vec![Value::Json(json!({"id": 7}))]
            )]
        );

        // nothing scripted: zero rows affected
        let err = crate::query().delete(&pool, &ada()).await.unwrap_err();
        assert!(err.is(ErrorKind::NotFound));
    }

    #[tokio::test]
    async fn test_soft_delete_and_unscoped() {
        let pool = MockPool::new();
        pool.push_affected(1);
        pool.push_affected(1);

        let post = Post { id: 3, user_id: 1, title: "t".into(), deleted_at: None };
        crate::query().delete(&pool, &post).await.unwrap();
        crate::query().unscoped().delete(&pool, &post).await.unwrap();

        assert_eq!(
            pool.statements(),
            vec![
                r#"UPDATE "posts" SET "deleted_at" = NOW() WHERE "posts"."deleted_at" IS NULL AND ("posts"."id" = (jsonb_populate_record(NULL::"posts", $1))."id")"#,
                r#"DELETE FROM "posts" WHERE ("posts"."id" = (jsonb_populate_record(NULL::"posts", $1))."id")"#,
            ]
        );
    }

    #[tokio::test]
    async fn test_delete_where_requires_a_predicate() {
        let pool = MockPool::new();
        let err = crate::table("sessions").delete_where(&pool).await.unwrap_err();
        assert!(err.is(ErrorKind::NotValid));
        assert!(pool.calls().is_empty());

        pool.push_affected(4);
        let removed = crate::table("sessions")
            .where_("expires_at < NOW()", ())
            .delete_where(&pool)
            .await
            .unwrap();
        assert_eq!(removed, 4);
    }

    #[tokio::test]
    async fn test_exec_zero_rows() {
        let pool = MockPool::new();
        let err = crate::query()
            .exec(&pool, "UPDATE jobs SET state = ? WHERE id = ?", ("done", 1))
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::NotFound));

        let affected = crate::query()
            .exec_allow_empty(&pool, "DELETE FROM jobs WHERE id IN ?", (vec![1, 2],))
            .await
            .unwrap();
        assert_eq!(affected, 0);
        assert_eq!(
            pool.last_call().unwrap().0,
            "DELETE FROM jobs WHERE id IN ($1, $2)"
        );
    }

    #[tokio::test]
    async fn test_raw_decodes_rows() {
        let pool = MockPool::new();
        pool.push_rows(vec![json!({"id": 1, "email": "a@example.com"})]);
        pool.push_rows(vec![json!({"id": "not a number"})]);

        let users: Vec<User> = crate::query()
            .raw(&pool, "SELECT * FROM users WHERE id = ?", (1,))
            .await
            .unwrap();
        assert_eq!(users[0].email, "a@example.com");

        let err = crate::query()
            .raw::<User>(&pool, "SELECT * FROM users", ())
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::NotValid));
    }

    #[tokio::test]
    async fn test_count_and_exists() {
        let pool = MockPool::new();
        pool.push_rows(vec![json!({"count": 12})]);
        pool.push_rows(vec![json!({"exists": true})]);

        let count = crate::model::<User>()
            .where_eq("active", true)
            .order("id")
            .limit(5)
            .count(&pool)
            .await
            .unwrap();
        assert_eq!(count, 12);

        let exists = crate::model::<User>()
            .where_eq("email", "ada@example.com")
            .exists(&pool)
            .await
            .unwrap();
        assert!(exists);

        assert_eq!(
            pool.statements(),
            vec![
                r#"SELECT COUNT(*) AS count FROM (SELECT "users".* FROM "users" WHERE ("active" = $1)) AS count_subquery"#,
                r#"SELECT EXISTS(SELECT "users".* FROM "users" WHERE ("email" = $1)) AS "exists""#,
            ]
        );
    }

    #[derive(Debug, Clone, Serialize, serde::Deserialize)]
    struct Code {
        code: String,
        label: String,
    }

    impl Model for Code {
        const TABLE: &'static str = "codes";
        const PRIMARY_KEY: &'static str = "code";
    }

    #[tokio::test]
    async fn test_text_keys_of_zeros_are_inserted() {
        let pool = MockPool::new();
        pool.push_rows(vec![json!({"code": "000", "label": "none"})]);

        let mut code = Code { code: "000".into(), label: "none".into() };
        crate::query().create(&pool, &mut code).await.unwrap();

        let (sql, params) = pool.last_call().unwrap();
        assert!(sql.starts_with(r#"INSERT INTO "codes" ("code", "label")"#));
        assert_eq!(params, vec![Value::Json(json!({"code": "000", "label": "none"}))]);
    }

    #[test]
    fn test_zero_keys() {
        assert!(is_zero_key(&json!(null)));
        assert!(is_zero_key(&json!(0)));
        assert!(is_zero_key(&json!("")));
        assert!(is_zero_key(&json!("00000000-0000-0000-0000-000000000000")));
        assert!(!is_zero_key(&json!("0")));
        assert!(!is_zero_key(&json!("000")));
        assert!(!is_zero_key(&json!("-")));
        assert!(!is_zero_key(&json!(7)));
    }

    #[tokio::test]
    async fn test_exec_binds_null_inline() {
        let pool = MockPool::new();
        pool.push_affected(3);

        let affected = crate::query()
            .exec(&pool, "UPDATE jobs SET attempts = ?, note = ?", (None::<i32>, "reset"))
            .await
            .unwrap();
        assert_eq!(affected, 3);
        assert_eq!(
            pool.last_call().unwrap(),
            (
                "UPDATE jobs SET attempts = NULL, note = $1".to_string(),
                vec![Value::from("reset")]
            )
        );
    }

    #[tokio::test]
    async fn test_multiple_arg_groups_fail_at_the_finisher() {
        let pool = MockPool::new();
        let err = crate::model::<User>()
            .where_("id = ?", crate::Args::new().group((1,)).group((2,)))
            .find::<User>(&pool)
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::NotValid));
        assert_eq!(err.target(), Some("users"));

        let err = crate::model::<User>()
            .where_eq("active", true)
            .or("id = ?", crate::Args::new().group((1,)).group((2,)))
            .count(&pool)
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::NotValid));
        assert!(pool.calls().is_empty());
    }

    #[test]
    fn test_state_is_shareable() {
        fn assert_send_sync<T: Send + Sync + Clone + 'static>() {}
        assert_send_sync::<QueryState>();
        assert_send_sync::<MockPool>();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_forks_run_independently_across_tasks() {
        let base = crate::model::<User>().where_("active", ());

        let handles: Vec<_> = (0..8i64)
            .map(|i| {
                let fork = base.clone().where_("id > ?", (i,)).limit(i + 1);
                tokio::spawn(async move {
                    let pool = MockPool::new();
                    let users = fork.find::<User>(&pool).await?;
                    assert!(users.is_empty());
                    Ok::<_, Error>(pool.calls())
                })
            })
            .collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let calls = handle.await.unwrap().unwrap();
            assert_eq!(
                calls,
                vec![(
                    format!(
                        r#"SELECT "users".* FROM "users" WHERE (active) AND (id > $1) LIMIT {}"#,
                        i + 1
                    ),
                    vec![Value::I64(i as i64)]
                )]
            );
        }
        assert_eq!(base.to_sql().unwrap().0, r#"SELECT "users".* FROM "users" WHERE (active)"#);
    }

    #[test]
    fn test_forks_built_on_threads() {
        let base = crate::model::<User>().order("id");
        let forks: Vec<QueryState> = std::thread::scope(|scope| {
            let handles: Vec<_> = ["a", "b", "c"]
                .into_iter()
                .map(|role| {
                    let base = &base;
                    scope.spawn(move || base.clone().where_eq("role", role))
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (fork, role) in forks.iter().zip(["a", "b", "c"]) {
            let (sql, params) = fork.to_sql().unwrap();
            assert_eq!(sql, r#"SELECT "users".* FROM "users" WHERE ("role" = $1) ORDER BY id"#);
            assert_eq!(params, vec![Value::from(role)]);
        }
        assert_eq!(base.to_sql().unwrap().1, Vec::<Value>::new());
    }

    #[tokio::test]
    async fn test_database_errors_carry_the_table() {
        let pool = MockPool::new();
        pool.push_error(Error::exists("duplicate key value violates unique constraint"));

        let mut user = ada();
        let err = crate::query().create(&pool, &mut user).await.unwrap_err();
        assert!(err.is(ErrorKind::Exists));
        assert_eq!(err.target(), Some("users"));
    }
}
