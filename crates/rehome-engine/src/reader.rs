//! Lazy, cursor-driven reader over pending records.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use rehome_state::{PendingRecord, StateBackend};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Streams `PENDING` records in insertion order, one page at a time.
///
/// Only the current page is held in memory. The cursor is the insertion
/// sequence of the last record handed out, so a restarted reader with the
/// same cursor resumes exactly after it.
pub struct PendingRecordStream {
    store: Arc<dyn StateBackend>,
    page_size: usize,
    cursor: i64,
    buffer: VecDeque<PendingRecord>,
    exhausted: bool,
    pages_fetched: u64,
}

impl PendingRecordStream {
    #[must_use]
    pub fn new(store: Arc<dyn StateBackend>, page_size: usize) -> Self {
        Self::resume(store, page_size, 0)
    }

    /// Start after insertion sequence `cursor`.
    #[must_use]
    pub fn resume(store: Arc<dyn StateBackend>, page_size: usize, cursor: i64) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            cursor,
            buffer: VecDeque::new(),
            exhausted: false,
            pages_fetched: 0,
        }
    }

    #[must_use]
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    #[must_use]
    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    async fn fill(&mut self) -> Result<()> {
        let store = Arc::clone(&self.store);
        let after = self.cursor_of_buffer_end();
        let limit = self.page_size;
        let page = tokio::task::spawn_blocking(move || store.fetch_pending_page(after, limit))
            .await
            .context("pending page fetch task panicked")?
            .context("Failed to fetch pending records")?;
        self.pages_fetched += 1;
        if page.len() < limit {
            self.exhausted = true;
        }
        tracing::trace!(after, fetched = page.len(), "Fetched pending page");
        self.buffer.extend(page);
        Ok(())
    }

    fn cursor_of_buffer_end(&self) -> i64 {
        self.buffer.back().map_or(self.cursor, |r| r.seq)
    }

    /// Next pending record, or `None` once the store has no more.
    ///
    /// # Errors
    ///
    /// Returns an error if the state backend fails.
    pub async fn next(&mut self) -> Result<Option<PendingRecord>> {
        if self.buffer.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        let next = self.buffer.pop_front();
        if let Some(record) = &next {
            self.cursor = record.seq;
        }
        Ok(next)
    }

    /// Up to `size` records; empty once the stream is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the state backend fails.
    pub async fn next_chunk(&mut self, size: usize) -> Result<Vec<PendingRecord>> {
        let mut chunk = Vec::with_capacity(size);
        while chunk.len() < size {
            match self.next().await? {
                Some(record) => chunk.push(record),
                None => break,
            }
        }
        Ok(chunk)
    }
}

/// Run `stream` on its own task, handing chunks of `chunk_size` over a
/// channel with room for one chunk, so the next chunk is read while the
/// current one is transferred. The task stops when the receiver is dropped.
pub fn spawn_chunk_reader(
    mut stream: PendingRecordStream,
    chunk_size: usize,
) -> (mpsc::Receiver<Result<Vec<PendingRecord>>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(1);
    let chunk_size = chunk_size.max(1);
    let handle = tokio::spawn(async move {
        loop {
            let chunk = stream.next_chunk(chunk_size).await;
            let done = matches!(&chunk, Ok(c) if c.is_empty()) || chunk.is_err();
            if done {
                if let Err(e) = chunk {
                    let _ = tx.send(Err(e)).await;
                }
                break;
            }
            if tx.send(chunk).await.is_err() {
                tracing::debug!(cursor = stream.cursor(), "Chunk reader stopped early");
                break;
            }
        }
    });
    (rx, handle)
}
