//! Reusable query transforms

use crate::builder::QueryState;
use std::fmt;
use std::sync::Arc;

type Transform = dyn Fn(QueryState) -> QueryState + Send + Sync;

/// A named or anonymous transform over [`QueryState`]
///
/// Scopes receive the state by value and return a new one. The closure is `Fn`
/// and shared, so a scope cannot hold mutable state of its own, and applying it
/// to a preload's state never reaches the primary query.
///
/// ```
/// use quarry_core::{table, Scope};
///
/// let active = Scope::named("active", |q| q.where_("active", ()));
/// let newest = Scope::new(|q| q.order("created_at DESC"));
///
/// let q = table("users").scope(&active.then(&newest));
/// assert!(q.to_sql().unwrap().0.ends_with("WHERE (active) ORDER BY created_at DESC"));
/// ```
#[derive(Clone)]
pub struct Scope {
    name: Option<String>,
    transform: Arc<Transform>,
}

impl Scope {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(QueryState) -> QueryState + Send + Sync + 'static,
    {
        Self {
            name: None,
            transform: Arc::new(f),
        }
    }

    pub fn named<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(QueryState) -> QueryState + Send + Sync + 'static,
    {
        Self {
            name: Some(name.into()),
            transform: Arc::new(f),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn apply(&self, query: QueryState) -> QueryState {
        (self.transform)(query)
    }

    /// `self` first, then `next`
    pub fn then(&self, next: &Scope) -> Scope {
        compose(self, next)
    }
}

/// Ordered composition: `compose(a, b).apply(q) == b.apply(a.apply(q))`
pub fn compose(first: &Scope, second: &Scope) -> Scope {
    let (a, b) = (first.clone(), second.clone());
    let name = match (&a.name, &b.name) {
        (Some(x), Some(y)) => Some(format!("{x}+{y}")),
        _ => None,
    };
    Scope {
        name,
        transform: Arc::new(move |q: QueryState| b.apply(a.apply(q))),
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("name", &self.name).finish_non_exhaustive()
    }
}
