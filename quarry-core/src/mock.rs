//! Scripted in-memory pool for tests
//!
//! [`MockPool`] answers statements from a queue of scripted responses and
//! records every statement with its binds. Unscripted statements return no rows
//! and affect nothing.

use crate::error::{Error, Result};
use crate::executor::{
    closed_transaction, nested_begin, ConnectionPool, IsolationLevel, Row, Transaction,
    TransactionalPool,
};
use crate::value::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
enum Response {
    Rows(Vec<Row>),
    Affected(u64),
    Error(Error),
}

#[derive(Debug, Default)]
struct MockState {
    responses: VecDeque<Response>,
    calls: Vec<(String, Vec<Value>)>,
}

#[derive(Debug, Clone, Default)]
pub struct MockPool {
    state: Arc<Mutex<MockState>>,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script the rows of the next fetch
    ///
    /// Objects become rows; any other JSON value becomes a one-column row named
    /// `?column?`, as Postgres names unaliased expressions.
    pub fn push_rows(&self, rows: impl IntoIterator<Item = serde_json::Value>) {
        let rows = rows
            .into_iter()
            .map(|value| match value {
                serde_json::Value::Object(row) => row,
                other => {
                    let mut row = Row::new();
                    row.insert("?column?".to_string(), other);
                    row
                }
            })
            .collect();
        self.lock().responses.push_back(Response::Rows(rows));
    }

    /// Script the affected-row count of the next execute
    pub fn push_affected(&self, affected: u64) {
        self.lock().responses.push_back(Response::Affected(affected));
    }

    /// Script the next statement to fail
    pub fn push_error(&self, err: Error) {
        self.lock().responses.push_back(Response::Error(err));
    }

    /// Every statement run so far, with its binds
    pub fn calls(&self) -> Vec<(String, Vec<Value>)> {
        self.lock().calls.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.lock().calls.iter().map(|(sql, _)| sql.clone()).collect()
    }

    pub fn last_call(&self) -> Option<(String, Vec<Value>)> {
        self.lock().calls.last().cloned()
    }

    /// Scripted responses not yet consumed
    pub fn pending(&self) -> usize {
        self.lock().responses.len()
    }

    fn record(&self, sql: &str, params: &[Value]) -> Option<Response> {
        let mut state = self.lock();
        state.calls.push((sql.to_string(), params.to_vec()));
        state.responses.pop_front()
    }

    fn run_execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        match self.record(sql, params) {
            None => Ok(0),
            Some(Response::Affected(affected)) => Ok(affected),
            Some(Response::Rows(rows)) => Ok(rows.len() as u64),
            Some(Response::Error(err)) => Err(err),
        }
    }

    fn run_fetch(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        match self.record(sql, params) {
            None => Ok(Vec::new()),
            Some(Response::Rows(rows)) => Ok(rows),
            Some(Response::Affected(affected)) => Err(Error::unexpected(format!(
                "mock scripted {affected} affected row(s) but `{sql}` fetches rows"
            ))),
            Some(Response::Error(err)) => Err(err),
        }
    }

    fn log(&self, sql: &str) {
        self.lock().calls.push((sql.to_string(), Vec::new()));
    }
}

impl ConnectionPool for MockPool {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.run_execute(sql, params)
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.run_fetch(sql, params)
    }
}

impl TransactionalPool for MockPool {
    type Transaction = MockTransaction;

    async fn begin(&self) -> Result<MockTransaction> {
        self.log("BEGIN");
        Ok(MockTransaction {
            pool: self.clone(),
            open: Arc::new(AtomicBool::new(true)),
        })
    }

    async fn begin_with_isolation(&self, isolation: IsolationLevel) -> Result<MockTransaction> {
        let tx = self.begin().await?;
        self.log(&isolation.statement());
        Ok(tx)
    }
}

/// A transaction on a [`MockPool`], sharing its script and log
#[derive(Debug, Clone)]
pub struct MockTransaction {
    pool: MockPool,
    open: Arc<AtomicBool>,
}

impl MockTransaction {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(closed_transaction())
        }
    }

    fn close(&self, statement: &str) -> Result<()> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Err(closed_transaction());
        }
        self.pool.log(statement);
        Ok(())
    }
}

impl ConnectionPool for MockTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        self.pool.run_execute(sql, params)
    }

    async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        self.pool.run_fetch(sql, params)
    }
}

impl Transaction for MockTransaction {
    async fn commit(&self) -> Result<()> {
        self.close("COMMIT")
    }

    async fn rollback(&self) -> Result<()> {
        self.close("ROLLBACK")
    }
}

impl TransactionalPool for MockTransaction {
    type Transaction = MockTransaction;

    async fn begin(&self) -> Result<MockTransaction> {
        Err(nested_begin())
    }

    async fn begin_with_isolation(&self, _isolation: IsolationLevel) -> Result<MockTransaction> {
        Err(nested_begin())
    }
}
