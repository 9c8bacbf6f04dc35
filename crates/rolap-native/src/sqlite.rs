//! [`SqlExecutor`] over a shared SQLite connection.

use crate::error::{NativeError, NativeResult};
use crate::executor::{CancellationToken, SqlExecutor};
use rolap_model::{Dialect, SqliteDialect, Value};
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Virtual machine instructions between cancellation checks.
const PROGRESS_STEPS: i32 = 1_000;

#[derive(Debug, Clone)]
pub struct SqliteExecutor {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteExecutor {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self::new(conn))
    }

    pub fn open_path(path: impl AsRef<Path>) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(Self::new(conn))
    }

    /// Run a batch of statements (DDL, fixture inserts) outside of any cancellation scope.
    pub fn execute_batch(&self, sql: &str) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("sqlite mutex poisoned");
        conn.execute_batch(sql)
    }
}

fn to_value(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => Value::from(f),
        ValueRef::Text(bytes) => Value::from(String::from_utf8_lossy(bytes).as_ref()),
        ValueRef::Blob(bytes) => Value::from(format!("x'{}'", hex(bytes))),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl SqlExecutor for SqliteExecutor {
    fn dialect(&self) -> &dyn Dialect {
        &SqliteDialect
    }

    fn execute(
        &self,
        sql: &str,
        cancel: &CancellationToken,
        on_row: &mut dyn FnMut(&[Value]) -> ControlFlow<()>,
    ) -> NativeResult<()> {
        cancel.check()?;
        let conn = self.conn.lock().expect("sqlite mutex poisoned");

        let token = cancel.clone();
        conn.progress_handler(PROGRESS_STEPS, Some(move || token.is_cancelled()));
        let result = run_query(&conn, sql, on_row);
        conn.progress_handler(PROGRESS_STEPS, None::<fn() -> bool>);

        match result {
            Err(_) if cancel.is_cancelled() => Err(NativeError::Cancelled),
            Err(err) => Err(NativeError::sql(sql, err.to_string())),
            Ok(()) => cancel.check(),
        }
    }
}

fn run_query(
    conn: &Connection,
    sql: &str,
    on_row: &mut dyn FnMut(&[Value]) -> ControlFlow<()>,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(sql)?;
    let width = stmt.column_count();
    let mut rows = stmt.query([])?;
    let mut buffer = Vec::with_capacity(width);
    while let Some(row) = rows.next()? {
        buffer.clear();
        for idx in 0..width {
            buffer.push(to_value(row.get_ref(idx)?));
        }
        if on_row(&buffer).is_break() {
            break;
        }
    }
    Ok(())
}
