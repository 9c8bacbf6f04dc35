use crate::error::{NativeError, NativeResult};
use rolap_model::{Dialect, Value};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between an execution and the SQL it issues.
///
/// Cloning shares the flag. Executors poll it while a statement runs; single-flight waiters poll
/// it while blocked on another caller's computation.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn check(&self) -> NativeResult<()> {
        if self.is_cancelled() {
            Err(NativeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// The driver seam: runs one SQL statement and streams its rows, and names the dialect its SQL
/// must be written in.
///
/// `on_row` may return [`ControlFlow::Break`] to stop fetching; the executor must then stop
/// reading and return `Ok(())`. A cancelled token must abort the statement with
/// [`NativeError::Cancelled`].
pub trait SqlExecutor: fmt::Debug + Send + Sync {
    fn dialect(&self) -> &dyn Dialect;

    fn execute(
        &self,
        sql: &str,
        cancel: &CancellationToken,
        on_row: &mut dyn FnMut(&[Value]) -> ControlFlow<()>,
    ) -> NativeResult<()>;
}

impl<T: SqlExecutor + ?Sized> SqlExecutor for Arc<T> {
    fn dialect(&self) -> &dyn Dialect {
        (**self).dialect()
    }

    fn execute(
        &self,
        sql: &str,
        cancel: &CancellationToken,
        on_row: &mut dyn FnMut(&[Value]) -> ControlFlow<()>,
    ) -> NativeResult<()> {
        (**self).execute(sql, cancel, on_row)
    }
}

/// Run `sql` and collect its rows, aborting as soon as more than `limit` rows arrive.
pub(crate) fn fetch_rows(
    executor: &dyn SqlExecutor,
    sql: &str,
    cancel: &CancellationToken,
    limit: Option<u64>,
    purpose: &str,
) -> NativeResult<Vec<Vec<Value>>> {
    cancel.check()?;
    log::debug!("executing {purpose} sql: {sql}");
    let mut rows = Vec::new();
    let mut exceeded = false;
    executor.execute(sql, cancel, &mut |row| {
        if limit.is_some_and(|limit| rows.len() as u64 >= limit) {
            exceeded = true;
            return ControlFlow::Break(());
        }
        rows.push(row.to_vec());
        ControlFlow::Continue(())
    })?;
    if exceeded {
        return Err(NativeError::ResourceLimitExceeded {
            limit: limit.unwrap_or_default(),
            context: format!("loading {purpose}"),
        });
    }
    cancel.check()?;
    Ok(rows)
}
