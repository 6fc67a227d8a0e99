//! Prefetching reader over a paged data source.
//!
//! Keeps a bounded buffer of rows ahead of the consumer: a background task
//! fetches pages and pushes rows into a channel, blocking when the buffer
//! is full. The consumer sees a flat stream of rows and a coarse status
//! (idle, fetching, buffering, exhausted, error) it can surface to
//! operators.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SourceError;

/// Default number of rows buffered ahead of the consumer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 64;

/// One fetched page of rows.
#[derive(Debug, Clone)]
pub struct Page {
    /// Rows in this page.
    pub rows: Vec<Value>,
    /// Whether more pages follow.
    pub has_more: bool,
}

impl Page {
    /// The final page of a source.
    pub fn last(rows: Vec<Value>) -> Self {
        Self {
            rows,
            has_more: false,
        }
    }

    /// A page with more pages behind it.
    pub fn partial(rows: Vec<Value>) -> Self {
        Self {
            rows,
            has_more: true,
        }
    }
}

/// A data source read page by page.
#[async_trait]
pub trait PagedSource: Send + 'static {
    /// Fetch one page by index (starting at 0).
    async fn fetch_page(&mut self, page: usize) -> Result<Page, SourceError>;
}

/// Coarse state of the prefetch task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefetchStatus {
    /// Not started yet.
    Idle,
    /// A page fetch is in flight.
    Fetching,
    /// Rows fetched, waiting for buffer space.
    Buffering,
    /// Every page has been fetched and delivered.
    Exhausted,
    /// The source failed; no further rows will arrive.
    Error(String),
}

/// Handle to a running prefetch task.
///
/// Dropping the manager aborts the task; rows already buffered are lost.
#[derive(Debug)]
pub struct PrefetchManager {
    rx: mpsc::Receiver<Value>,
    status: Arc<Mutex<PrefetchStatus>>,
    handle: JoinHandle<()>,
}

impl PrefetchManager {
    /// Start prefetching with the default buffer capacity.
    pub fn spawn<S: PagedSource>(source: S) -> Self {
        Self::spawn_with_capacity(source, DEFAULT_BUFFER_CAPACITY)
    }

    /// Start prefetching with an explicit buffer capacity.
    pub fn spawn_with_capacity<S: PagedSource>(source: S, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let status = Arc::new(Mutex::new(PrefetchStatus::Idle));
        let handle = tokio::spawn(prefetch_loop(source, tx, Arc::clone(&status)));
        Self { rx, status, handle }
    }

    /// Next row, in source order. `None` once the source is exhausted or
    /// has failed and the buffer is drained.
    pub async fn next(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Current status of the background task.
    pub fn status(&self) -> PrefetchStatus {
        self.status.lock().expect("prefetch status lock").clone()
    }

    /// Stop fetching immediately.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for PrefetchManager {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn prefetch_loop<S: PagedSource>(
    mut source: S,
    tx: mpsc::Sender<Value>,
    status: Arc<Mutex<PrefetchStatus>>,
) {
    let set = |s: PrefetchStatus| {
        *status.lock().expect("prefetch status lock") = s;
    };

    let mut page_index = 0usize;
    loop {
        set(PrefetchStatus::Fetching);
        let page = match source.fetch_page(page_index).await {
            Ok(page) => page,
            Err(e) => {
                warn!(page = page_index, error = %e, "Source fetch failed");
                set(PrefetchStatus::Error(e.to_string()));
                return;
            }
        };
        debug!(page = page_index, rows = page.rows.len(), "Page fetched");

        set(PrefetchStatus::Buffering);
        for row in page.rows {
            // send blocks when the buffer is full; a dropped receiver ends
            // the task.
            if tx.send(row).await.is_err() {
                return;
            }
        }

        if !page.has_more {
            set(PrefetchStatus::Exhausted);
            return;
        }
        page_index += 1;
    }
}
