//! Association loading for `preload`
//!
//! Each association costs one extra query per level: the child table is read
//! once for all parent keys and the results are grouped back onto the parents
//! under the association name.

use crate::builder::common::{quote_ident, quote_name};
use crate::builder::state::Preload;
use crate::builder::Arg;
use crate::error::Result;
use crate::executor::{ConnectionPool, Row};
use crate::model::Relation;
use crate::value::Value;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};

/// Attach every preload to `rows`, recursing into nested preloads
pub(crate) fn load<'a, P: ConnectionPool>(
    rows: &'a mut [Row],
    preloads: &'a [Preload],
    pool: &'a P,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        for preload in preloads {
            load_one(rows, preload, pool).await?;
        }
        Ok(())
    })
}

async fn load_one<P: ConnectionPool>(rows: &mut [Row], preload: &Preload, pool: &P) -> Result<()> {
    let association = &preload.association;
    let parent_key = association.parent_key();
    let child_key = association.child_key();

    let mut seen = HashSet::new();
    let keys: Vec<serde_json::Value> = rows
        .iter()
        .filter_map(|row| row.get(parent_key))
        .filter(|key| !key.is_null() && seen.insert(key.to_string()))
        .map(|key| {
            let mut keyed = Row::new();
            keyed.insert(child_key.to_string(), key.clone());
            serde_json::Value::Object(keyed)
        })
        .collect();

    let mut children: HashMap<String, Vec<serde_json::Value>> = HashMap::new();
    if !keys.is_empty() {
        let table = quote_ident(association.table);
        let column = quote_name(child_key);
        let query = preload.query.clone().guard(
            format!(
                "{table}.{column} IN (SELECT {column} FROM jsonb_populate_recordset(NULL::{table}, ?))"
            ),
            vec![Arg::Value(Value::Json(serde_json::Value::Array(keys)))],
        );

        let fetched = query.fetch_rows(pool).await?;
        tracing::debug!(
            association = association.name,
            rows = fetched.len(),
            "preloaded association"
        );
        for child in fetched {
            let Some(key) = child.get(child_key).filter(|key| !key.is_null()) else {
                continue;
            };
            children
                .entry(key.to_string())
                .or_default()
                .push(serde_json::Value::Object(child));
        }
    }

    for row in rows.iter_mut() {
        let related = row
            .get(parent_key)
            .and_then(|key| children.get(&key.to_string()));
        let value = match association.relation {
            Relation::HasMany => serde_json::Value::Array(related.cloned().unwrap_or_default()),
            Relation::HasOne | Relation::BelongsTo => related
                .and_then(|matches| matches.first().cloned())
                .unwrap_or(serde_json::Value::Null),
        };
        row.insert(association.name.to_string(), value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::mock::MockPool;
    use crate::model::fixtures::{Post, User};
    use crate::{Row, Scope};
    use serde_json::json;

    fn two_users(pool: &MockPool) {
        pool.push_rows(vec![
            json!({"id": 1, "email": "a@example.com"}),
            json!({"id": 2, "email": "b@example.com"}),
        ]);
    }

    #[tokio::test]
    async fn test_has_many_groups_children() {
        let pool = MockPool::new();
        two_users(&pool);
        pool.push_rows(vec![
            json!({"id": 10, "user_id": 1, "title": "first", "deleted_at": null}),
            json!({"id": 11, "user_id": 1, "title": "second", "deleted_at": null}),
        ]);

        let users: Vec<User> = crate::model::<User>()
            .preload("posts")
            .find(&pool)
            .await
            .unwrap();

        assert_eq!(users[0].posts.len(), 2);
        assert!(users[1].posts.is_empty());

        let (sql, params) = pool.last_call().unwrap();
        assert_eq!(
            sql,
            r#"SELECT "posts".* FROM "posts" WHERE "posts"."deleted_at" IS NULL AND ("posts"."user_id" IN (SELECT "user_id" FROM jsonb_populate_recordset(NULL::"posts", $1)))"#
        );
        assert_eq!(
            params,
            vec![crate::Value::Json(json!([{"user_id": 1}, {"user_id": 2}]))]
        );
    }

    #[tokio::test]
    async fn test_scope_filters_only_the_association() {
        let pool = MockPool::new();
        two_users(&pool);

        let published = Scope::new(|q| q.where_("published = ?", (true,)));
        let users: Vec<User> = crate::model::<User>()
            .preload_with("posts", &[published])
            .find(&pool)
            .await
            .unwrap();

        assert_eq!(users.len(), 2);
        let statements = pool.statements();
        assert_eq!(statements[0], r#"SELECT "users".* FROM "users""#);
        assert!(statements[1].ends_with(" AND ((published = $2))"));
    }

    #[tokio::test]
    async fn test_has_one_and_missing_children() {
        let pool = MockPool::new();
        two_users(&pool);
        pool.push_rows(vec![json!({"id": 4, "user_id": 2, "bio": "hi"})]);

        let users: Vec<Row> = crate::model::<User>()
            .preload("profile")
            .find(&pool)
            .await
            .unwrap();

        assert_eq!(users[0]["profile"], json!(null));
        assert_eq!(users[1]["profile"]["bio"], json!("hi"));
    }

    #[tokio::test]
    async fn test_belongs_to_and_nested() {
        let pool = MockPool::new();
        pool.push_rows(vec![
            json!({"id": 10, "user_id": 1, "title": "a"}),
            json!({"id": 11, "user_id": 1, "title": "b"}),
        ]);
        pool.push_rows(vec![json!({"id": 1, "email": "a@example.com"})]);
        pool.push_rows(vec![json!({"id": 100, "post_id": 11, "body": "nice"})]);

        let posts: Vec<Row> = crate::model::<Post>()
            .preload("author")
            .preload("comments")
            .find(&pool)
            .await
            .unwrap();

        assert_eq!(posts[0]["author"]["email"], json!("a@example.com"));
        assert_eq!(posts[1]["author"]["id"], json!(1));
        assert_eq!(posts[0]["comments"], json!([]));
        assert_eq!(posts[1]["comments"][0]["body"], json!("nice"));

        // one author key despite two posts
        assert_eq!(
            pool.calls()[1].1,
            vec![crate::Value::Json(json!([{"id": 1}]))]
        );
    }

    #[tokio::test]
    async fn test_nested_path_loads_each_level() {
        let pool = MockPool::new();
        two_users(&pool);
        pool.push_rows(vec![json!({"id": 10, "user_id": 2, "title": "t"})]);
        pool.push_rows(vec![json!({"id": 100, "post_id": 10, "body": "c"})]);

        let users: Vec<Row> = crate::model::<User>()
            .preload("posts.comments")
            .find(&pool)
            .await
            .unwrap();

        assert_eq!(users[1]["posts"][0]["comments"][0]["body"], json!("c"));
        assert_eq!(pool.statements().len(), 3);
        assert!(pool.statements()[2].starts_with(r#"SELECT "comments".* FROM "comments" WHERE ("comments"."post_id" IN"#));
    }

    #[tokio::test]
    async fn test_no_parents_skips_the_child_query() {
        let pool = MockPool::new();
        let users: Vec<User> = crate::model::<User>()
            .preload("posts")
            .find(&pool)
            .await
            .unwrap();
        assert!(users.is_empty());
        assert_eq!(pool.statements().len(), 1);
    }
}
