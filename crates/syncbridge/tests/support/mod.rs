//! A scripted in-memory asynchronous driver.
//!
//! Every driver future returns `Pending` once before completing, so each
//! driver call is a real suspension of the calling bridge context.
//!
//! - statements starting with `FAIL` fail with a query error
//! - `query` returns one row whose `conn` column is the connection number
//! - a cursor opened on `GENERATE n` yields rows `1..=n` in column `n`

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use syncbridge::{
    AsyncDriver, AsyncDriverFactory, CursorId, DriverFuture, Error, IsolationLevel,
    QueryErrorKind, Row, Value,
};

#[derive(Debug, Default)]
struct ScriptState {
    statements: Vec<String>,
    connects: usize,
    closes: usize,
    cursors: HashMap<u64, VecDeque<Row>>,
    closed_cursors: Vec<u64>,
    next_cursor: u64,
}

/// Shared record of everything the scripted drivers did.
#[derive(Debug, Clone, Default)]
pub struct Script {
    state: Arc<Mutex<ScriptState>>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> ScriptedFactory {
        ScriptedFactory {
            script: self.clone(),
        }
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn connects(&self) -> usize {
        self.state.lock().unwrap().connects
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn open_cursors(&self) -> usize {
        self.state.lock().unwrap().cursors.len()
    }

    pub fn closed_cursors(&self) -> Vec<u64> {
        self.state.lock().unwrap().closed_cursors.clone()
    }
}

/// Completes with `op()` on the second poll.
struct YieldOnce<F> {
    op: Option<F>,
    yielded: bool,
}

impl<T, F: FnOnce() -> Result<T, Error> + Unpin> Future for YieldOnce<F> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if !self.yielded {
            self.yielded = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }
        let op = self.op.take().expect("polled after completion");
        Poll::Ready(op())
    }
}

fn deferred<T, F>(op: F) -> DriverFuture<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Error> + Send + Unpin + 'static,
{
    Box::pin(YieldOnce {
        op: Some(op),
        yielded: false,
    })
}

fn failure(sql: &str) -> Error {
    Error::query(QueryErrorKind::Database, Some(sql), "scripted failure")
}

pub struct ScriptedFactory {
    script: Script,
}

impl AsyncDriverFactory for ScriptedFactory {
    type Driver = ScriptedDriver;

    fn connect(&self) -> DriverFuture<ScriptedDriver> {
        let state = Arc::clone(&self.script.state);
        deferred(move || {
            let number = {
                let mut guard = state.lock().unwrap();
                guard.connects += 1;
                guard.connects
            };
            Ok(ScriptedDriver { number, state })
        })
    }
}

pub struct ScriptedDriver {
    number: usize,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedDriver {
    fn log<T, F>(&self, entry: String, op: F) -> DriverFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ScriptState) -> Result<T, Error> + Send + Unpin + 'static,
    {
        let state = Arc::clone(&self.state);
        deferred(move || {
            let mut guard = state.lock().unwrap();
            guard.statements.push(entry);
            op(&mut guard)
        })
    }
}

impl AsyncDriver for ScriptedDriver {
    fn execute(&self, sql: String, _params: Vec<Value>) -> DriverFuture<u64> {
        let failed = sql.starts_with("FAIL").then(|| failure(&sql));
        self.log(sql, move |_| match failed {
            Some(e) => Err(e),
            None => Ok(1),
        })
    }

    fn query(&self, sql: String, _params: Vec<Value>) -> DriverFuture<Vec<Row>> {
        let failed = sql.starts_with("FAIL").then(|| failure(&sql));
        let number = self.number as i64;
        self.log(sql, move |_| match failed {
            Some(e) => Err(e),
            None => Ok(vec![Row::new(
                vec!["conn".to_string()],
                vec![Value::BigInt(number)],
            )]),
        })
    }

    fn begin(&self, isolation: IsolationLevel) -> DriverFuture<()> {
        self.log(format!("BEGIN {}", isolation.as_sql()), |_| Ok(()))
    }

    fn commit(&self) -> DriverFuture<()> {
        self.log("COMMIT".to_string(), |_| Ok(()))
    }

    fn rollback(&self) -> DriverFuture<()> {
        self.log("ROLLBACK".to_string(), |_| Ok(()))
    }

    fn open_cursor(&self, sql: String, _params: Vec<Value>) -> DriverFuture<CursorId> {
        let count: i64 = sql
            .strip_prefix("GENERATE ")
            .and_then(|n| n.trim().parse().ok())
            .unwrap_or(0);
        self.log(sql, move |state| {
            state.next_cursor += 1;
            let id = state.next_cursor;
            let rows = (1..=count)
                .map(|n| Row::new(vec!["n".to_string()], vec![Value::BigInt(n)]))
                .collect();
            state.cursors.insert(id, rows);
            Ok(CursorId::new(id))
        })
    }

    fn fetch(&self, cursor: CursorId, max_rows: usize) -> DriverFuture<Vec<Row>> {
        let state = Arc::clone(&self.state);
        deferred(move || {
            let mut guard = state.lock().unwrap();
            let rows = guard.cursors.get_mut(&cursor.get()).ok_or_else(|| {
                Error::query(QueryErrorKind::Cursor, None, "unknown cursor")
            })?;
            let take = max_rows.min(rows.len());
            Ok(rows.drain(..take).collect())
        })
    }

    fn close_cursor(&self, cursor: CursorId) -> DriverFuture<()> {
        self.log(format!("CLOSE CURSOR {}", cursor.get()), move |state| {
            state.cursors.remove(&cursor.get());
            state.closed_cursors.push(cursor.get());
            Ok(())
        })
    }

    fn ping(&self) -> DriverFuture<()> {
        deferred(|| Ok(()))
    }

    fn close(&self) -> DriverFuture<()> {
        let state = Arc::clone(&self.state);
        deferred(move || {
            state.lock().unwrap().closes += 1;
            Ok(())
        })
    }
}

pub fn unwrap_outcome<T: std::fmt::Debug>(outcome: syncbridge::Outcome<T, Error>) -> T {
    match outcome {
        syncbridge::Outcome::Ok(v) => v,
        syncbridge::Outcome::Err(e) => panic!("unexpected error: {e}"),
        syncbridge::Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        syncbridge::Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

pub fn expect_error<T: std::fmt::Debug>(outcome: syncbridge::Outcome<T, Error>) -> Error {
    match outcome {
        syncbridge::Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}
