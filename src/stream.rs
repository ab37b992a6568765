//! Row streams with cooperative cancellation and scoped cleanup.
//!
//! A [`RowStream`] is a finite, single-pass sequence of rows. Every strategy
//! returns one. Two lifecycle concerns are attached to the stream itself:
//!
//! - a [`CancelToken`], shared with any background work started on behalf of
//!   the query (prefetch, remote reads). Closing the stream before
//!   exhaustion cancels the token; draining it to the end does not, so
//!   best-effort cache warming started by the query may finish.
//! - cleanup actions (scoped temporary dataset deletion) that run exactly
//!   once when the stream is closed, on success, early close, and error
//!   paths alike. A stream dropped without an explicit close detaches its
//!   cleanup onto the runtime.

use crate::error::Result;
use crate::record::Row;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::warn;

/// Cooperative cancellation flag shared between a query's stream and its
/// background tasks.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A finite, single-pass, closeable sequence of rows.
pub struct RowStream {
    inner: BoxStream<'static, Result<Row>>,
    cancel: CancelToken,
    cleanups: Vec<CleanupFn>,
    exhausted: bool,
    closed: bool,
}

impl std::fmt::Debug for RowStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowStream")
            .field("exhausted", &self.exhausted)
            .field("closed", &self.closed)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("cleanups", &self.cleanups.len())
            .finish()
    }
}

impl RowStream {
    /// Stream over already-materialized rows.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self::from_stream(stream::iter(rows.into_iter().map(Ok)))
    }

    /// Stream over an async source.
    pub fn from_stream(inner: impl futures::Stream<Item = Result<Row>> + Send + 'static) -> Self {
        Self {
            inner: inner.boxed(),
            cancel: CancelToken::new(),
            cleanups: Vec::new(),
            exhausted: false,
            closed: false,
        }
    }

    /// An empty stream.
    pub fn empty() -> Self {
        Self::from_rows(Vec::new())
    }

    /// The stream's cancel token. Clones observe early close.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Attach a cleanup action that runs exactly once at close.
    pub fn on_close<F, Fut>(mut self, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.cleanups
            .push(Box::new(move || -> BoxFuture<'static, ()> { Box::pin(f()) }));
        self
    }

    /// Next row, or `None` at the end of the stream or after cancellation.
    ///
    /// Cancellation mid-stream is not an error: the stream simply ends.
    pub async fn next(&mut self) -> Option<Result<Row>> {
        if self.exhausted || self.cancel.is_cancelled() {
            return None;
        }
        match self.inner.next().await {
            Some(item) => Some(item),
            None => {
                self.exhausted = true;
                None
            }
        }
    }

    /// Drain the stream and close it.
    ///
    /// On a row error, cleanup still runs and the single terminal error is
    /// returned; partial results are never silently returned.
    pub async fn collect(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        loop {
            match self.next().await {
                Some(Ok(row)) => rows.push(row),
                Some(Err(e)) => {
                    self.close().await;
                    return Err(e);
                }
                None => break,
            }
        }
        self.close().await;
        Ok(rows)
    }

    /// Close the stream, running cleanup actions.
    ///
    /// Closing before exhaustion cancels the query's token so in-flight
    /// background work stops promptly.
    pub async fn close(mut self) {
        if !self.exhausted {
            self.cancel.cancel();
        }
        for cleanup in self.cleanups.drain(..) {
            cleanup().await;
        }
        self.closed = true;
    }
}

impl Drop for RowStream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if !self.exhausted {
            self.cancel.cancel();
        }
        if self.cleanups.is_empty() {
            return;
        }
        // Detach cleanup onto the runtime; outside a runtime we can only
        // log the leak (mirrors best-effort background work elsewhere).
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                for cleanup in self.cleanups.drain(..) {
                    handle.spawn(cleanup());
                }
            }
            Err(_) => {
                warn!(
                    pending = self.cleanups.len(),
                    "row stream dropped outside a runtime; cleanup skipped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FieldValue, Row};
    use std::sync::atomic::AtomicUsize;

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| Row::new(vec![FieldValue::Int(i as i64)]))
            .collect()
    }

    #[tokio::test]
    async fn test_collect_all_rows() {
        let stream = RowStream::from_rows(rows(5));
        let out = stream.collect().await.unwrap();
        assert_eq!(out.len(), 5);
    }

    #[tokio::test]
    async fn test_cleanup_runs_once_on_early_close() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let mut stream = RowStream::from_rows(rows(10)).on_close(move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let token = stream.cancel_token();

        let _ = stream.next().await;
        stream.close().await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_exhaustion_does_not_cancel_token() {
        let stream = RowStream::from_rows(rows(2));
        let token = stream.cancel_token();
        let _ = stream.collect().await.unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_drop_detaches_cleanup() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        {
            let _stream = RowStream::from_rows(rows(3)).on_close(move || async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        // Let the detached cleanup task run.
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_token_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
            true
        });
        token.cancel();
        assert!(handle.await.unwrap());
    }
}
