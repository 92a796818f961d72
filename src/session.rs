//! # Query sessions
//!
//! ## Responsibility
//! Turns one [`SearchRequest`] into a single-pass, pull-based sequence of
//! [`ResultRow`]s. A background worker runs the export on the connection's
//! runtime and feeds a bounded queue; the caller drains it through a
//! [`QueryCursor`], either blocking ([`Iterator`]) or async
//! ([`QueryCursor::next_row`]).
//!
//! ## Guarantees
//! - Bounded: at most `queue_capacity` rows are buffered; the worker waits
//!   when the queue is full and never drops rows.
//! - Ordered: rows arrive in the order the service sent them.
//! - Terminated: the worker enqueues exactly one end marker after the search
//!   returns, including when it failed or panicked, so a consumer is never
//!   left waiting forever.
//! - Cancellable: cancelling (or dropping) the cursor wakes a worker blocked
//!   on the queue or on the network and closes the response body.
//!
//! ## NOT Responsible For
//! - Retrying failed searches
//! - Surfacing transport errors on the pull interface (see [`SearchReport`])

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use futures_util::Stream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::connection::Connection;
use crate::error::{Result, SearchError};
use crate::parser::{ParseSummary, RowSink, Schema};
use crate::request::SearchRequest;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One result, shaped by schema width.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultRow {
    /// The schema has exactly one field.
    Scalar(String),
    /// Values in schema order.
    Tuple(Vec<String>),
}

impl ResultRow {
    /// Shape `fields` for a schema of `width` fields.
    pub fn shape(mut fields: Vec<String>, width: usize) -> Self {
        if width == 1 && fields.len() == 1 {
            ResultRow::Scalar(fields.pop().unwrap_or_default())
        } else {
            ResultRow::Tuple(fields)
        }
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            ResultRow::Scalar(v) => Some(v),
            ResultRow::Tuple(_) => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[String]> {
        match self {
            ResultRow::Scalar(_) => None,
            ResultRow::Tuple(v) => Some(v),
        }
    }

    /// Values in schema order, whatever the shape.
    pub fn values(&self) -> &[String] {
        match self {
            ResultRow::Scalar(v) => std::slice::from_ref(v),
            ResultRow::Tuple(v) => v,
        }
    }

    pub fn into_values(self) -> Vec<String> {
        match self {
            ResultRow::Scalar(v) => vec![v],
            ResultRow::Tuple(v) => v,
        }
    }
}

/// Queue element: a row, or the end-of-stream marker.
#[derive(Debug)]
enum Envelope {
    Row(ResultRow),
    End,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// What happened in one session, available once the worker has finished.
#[derive(Debug, Clone)]
pub struct SearchReport {
    pub session_id: Uuid,
    /// Header width, or `None` when the search returned no results.
    pub schema_width: Option<usize>,
    pub rows_delivered: u64,
    /// Records dropped for not matching the header width.
    pub dropped: u64,
    pub cancelled: bool,
    /// Transport, HTTP or read failure that ended the stream.
    pub error: Option<String>,
    pub elapsed: Duration,
}

impl SearchReport {
    fn from_summary(session_id: Uuid, summary: ParseSummary, cancelled: bool, elapsed: Duration) -> Self {
        Self {
            session_id,
            schema_width: summary.schema_width,
            rows_delivered: summary.rows,
            dropped: summary.dropped,
            cancelled,
            error: summary.error,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.cancelled
    }
}

// ---------------------------------------------------------------------------
// Query
// ---------------------------------------------------------------------------

/// A reusable query description. Each [`cursor`](Self::cursor) call runs the
/// search again in a fresh session.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    connection: Arc<Connection>,
    request: SearchRequest,
}

impl SearchQuery {
    pub fn new(connection: Arc<Connection>, request: SearchRequest) -> Self {
        Self { connection, request }
    }

    pub fn request(&self) -> &SearchRequest {
        &self.request
    }

    /// Start a session and return its cursor.
    ///
    /// The worker is spawned immediately, so login state is used and the
    /// export request is sent before the first pull.
    pub fn cursor(&self) -> QueryCursor {
        self.cursor_with_cancel(&CancellationToken::new())
    }

    /// Like [`cursor`](Self::cursor), with the session cancelled when `parent` is.
    pub fn cursor_with_cancel(&self, parent: &CancellationToken) -> QueryCursor {
        QueryCursor::start(
            Arc::clone(&self.connection),
            self.request.clone(),
            parent.child_token(),
        )
    }
}

impl std::fmt::Display for SearchQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SearchQuery {{{}}}", self.request.search())
    }
}

impl IntoIterator for &SearchQuery {
    type Item = ResultRow;
    type IntoIter = QueryCursor;

    fn into_iter(self) -> QueryCursor {
        self.cursor()
    }
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Lifecycle of a session as seen from the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The worker is still producing rows.
    Running,
    /// The worker has finished; queued rows and the end marker remain.
    Draining,
    /// The end marker was consumed or the session was cancelled.
    Done,
}

/// Consumer side of one query session.
///
/// Blocking pulls ([`Iterator::next`], [`try_next`](Self::try_next)) must not
/// be called from inside an async context; use
/// [`next_row`](Self::next_row) there instead. They also need the connection
/// to live on a multi-threaded runtime, since the worker has to make progress
/// while the calling thread is parked.
pub struct QueryCursor {
    id: Uuid,
    rx: mpsc::Receiver<Envelope>,
    schema: Arc<OnceLock<Schema>>,
    report_rx: Option<oneshot::Receiver<SearchReport>>,
    report: Option<SearchReport>,
    producer_done: Arc<AtomicBool>,
    cancel: CancellationToken,
    runtime: Handle,
    done: bool,
}

impl std::fmt::Debug for QueryCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCursor")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl QueryCursor {
    fn start(connection: Arc<Connection>, request: SearchRequest, cancel: CancellationToken) -> Self {
        let id = Uuid::new_v4();
        let runtime = connection.runtime().clone();
        let (tx, rx) = mpsc::channel(connection.queue_capacity());
        let (report_tx, report_rx) = oneshot::channel();
        let schema = Arc::new(OnceLock::new());
        let producer_done = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            id,
            connection,
            request,
            tx,
            schema: Arc::clone(&schema),
            report_tx,
            producer_done: Arc::clone(&producer_done),
            cancel: cancel.clone(),
        };
        let span = tracing::info_span!("search_session", id = %id);
        // Detached; the worker always ends on its own once the search returns
        // or the token fires.
        runtime.spawn(worker.run().instrument(span));

        Self {
            id,
            rx,
            schema,
            report_rx: Some(report_rx),
            report: None,
            producer_done,
            cancel,
            runtime,
            done: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The result schema, once the worker has read the header.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.get()
    }

    pub fn state(&self) -> SessionState {
        if self.done {
            SessionState::Done
        } else if self.producer_done.load(Ordering::Acquire) {
            SessionState::Draining
        } else {
            SessionState::Running
        }
    }

    /// Cancel the session. The worker stops and releases the connection;
    /// further pulls end the sequence.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this session when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next row, waiting while the queue is empty.
    ///
    /// `Ok(None)` means the end marker was reached (now or earlier).
    /// `Err(Cancelled)` means the session was cancelled; the cursor is then done.
    pub async fn try_next_row(&mut self) -> Result<Option<ResultRow>> {
        if self.done {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            self.finish();
            return Err(SearchError::Cancelled);
        }

        let received = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.finish();
                return Err(SearchError::Cancelled);
            }
            received = self.rx.recv() => received,
        };

        match received {
            Some(Envelope::Row(row)) => Ok(Some(row)),
            Some(Envelope::End) => {
                debug!(session = %self.id, "end of results");
                self.finish();
                Ok(None)
            }
            // The worker was torn down with its runtime.
            None => {
                self.finish();
                Ok(None)
            }
        }
    }

    /// Next row, or `None` at the end of the sequence or after cancellation.
    pub async fn next_row(&mut self) -> Option<ResultRow> {
        self.try_next_row().await.ok().flatten()
    }

    /// Blocking form of [`try_next_row`](Self::try_next_row).
    pub fn try_next(&mut self) -> Result<Option<ResultRow>> {
        if self.done {
            return Ok(None);
        }
        let runtime = self.runtime.clone();
        runtime.block_on(self.try_next_row())
    }

    /// Cursors are single-pass. Always fails with
    /// [`SearchError::ResetUnsupported`]; run the query again instead.
    pub fn reset(&mut self) -> Result<()> {
        Err(SearchError::ResetUnsupported)
    }

    /// The worker's report, once it has finished.
    pub fn report(&mut self) -> Option<&SearchReport> {
        if self.report.is_none() {
            if let Some(rx) = self.report_rx.as_mut() {
                if let Ok(report) = rx.try_recv() {
                    self.report = Some(report);
                    self.report_rx = None;
                }
            }
        }
        self.report.as_ref()
    }

    /// Wait for the worker to finish and return its report.
    ///
    /// Rows still queued are discarded. Returns `None` only if the worker was
    /// torn down before reporting.
    pub async fn finish_report(mut self) -> Option<SearchReport> {
        while !self.done {
            if self.try_next_row().await.is_err() {
                break;
            }
        }
        if let Some(report) = self.report.take() {
            return Some(report);
        }
        let rx = self.report_rx.take()?;
        rx.await.ok()
    }

    /// Adapt the cursor into an async stream of rows.
    pub fn into_stream(self) -> impl Stream<Item = ResultRow> + Send {
        futures_util::stream::unfold(self, |mut cursor| async move {
            cursor.next_row().await.map(|row| (row, cursor))
        })
    }

    fn finish(&mut self) {
        self.done = true;
        self.rx.close();
    }
}

impl Iterator for QueryCursor {
    type Item = ResultRow;

    fn next(&mut self) -> Option<ResultRow> {
        self.try_next().ok().flatten()
    }
}

impl Drop for QueryCursor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Worker {
    id: Uuid,
    connection: Arc<Connection>,
    request: SearchRequest,
    tx: mpsc::Sender<Envelope>,
    schema: Arc<OnceLock<Schema>>,
    report_tx: oneshot::Sender<SearchReport>,
    producer_done: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        let started = Instant::now();
        debug!(search = %self.request.search(), "search session started");

        let sink = ChannelSink {
            tx: self.tx.clone(),
            schema: Arc::clone(&self.schema),
            width: None,
            cancel: self.cancel.clone(),
            runtime: Handle::current(),
        };

        // Run the search in its own task so a panic inside it still reaches
        // the end-marker path below.
        let search = {
            let connection = Arc::clone(&self.connection);
            let request = self.request.clone();
            let cancel = self.cancel.clone();
            tokio::spawn(
                async move { connection.execute_search(&request, sink, &cancel).await }
                    .in_current_span(),
            )
        };

        let summary = match search.await {
            Ok(summary) => summary,
            Err(e) => {
                warn!(error = %e, "search task terminated abnormally");
                ParseSummary {
                    error: Some(SearchError::Worker(e.to_string()).to_string()),
                    ..ParseSummary::default()
                }
            }
        };

        let cancelled = self.cancel.is_cancelled();
        let report = SearchReport::from_summary(self.id, summary, cancelled, started.elapsed());
        debug!(
            rows = report.rows_delivered,
            dropped = report.dropped,
            cancelled,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "search session finished"
        );
        let _ = self.report_tx.send(report);
        self.producer_done.store(true, Ordering::Release);

        // The consumer is gone or cancelled if this fails.
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {}
            _ = self.tx.send(Envelope::End) => {}
        }
    }
}

/// Row sink feeding the session queue. Runs on the blocking pool, so it may
/// block the calling thread while the queue is full.
struct ChannelSink {
    tx: mpsc::Sender<Envelope>,
    schema: Arc<OnceLock<Schema>>,
    width: Option<usize>,
    cancel: CancellationToken,
    runtime: Handle,
}

impl RowSink for ChannelSink {
    fn on_schema(&mut self, schema: &Schema) {
        if self.width.is_none() {
            self.width = Some(schema.width());
            let _ = self.schema.set(schema.clone());
        }
    }

    fn on_row(&mut self, fields: Vec<String>) -> ControlFlow<()> {
        let width = self.width.unwrap_or(fields.len());
        let row = ResultRow::shape(fields, width);
        let tx = &self.tx;
        let cancel = &self.cancel;
        let sent = self.runtime.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = tx.send(Envelope::Row(row)) => sent.is_ok(),
            }
        });
        if sent {
            ControlFlow::Continue(())
        } else {
            ControlFlow::Break(())
        }
    }
}
