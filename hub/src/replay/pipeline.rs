//! Paced delivery of a replay stream.
//!
//! Two tasks cooperate per stream:
//!
//! * the **fetcher** owns the cursor and turns store pages into serialized
//!   batches, one page per pull signal;
//! * the **emitter** pushes records into the session sink one at a time,
//!   sleeping `cadence / playback_speed` after each, and pulls the next page
//!   once a third of the current batch is out so the store round-trip overlaps
//!   playback.
//!
//! They talk over a pull channel, a batch channel and a one-shot done signal.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::registry::StreamDescriptor;
use crate::db::CandleStore;
use crate::error::HubError;

pub const DEFAULT_PAGE_SIZE: usize = 5000;
/// Every page after the first repeats the cursor record, so a page needs room
/// for at least one new record besides it.
pub const MIN_PAGE_SIZE: usize = 2;

type Batch = Vec<String>;
type FetchOutcome = Result<(), HubError>;

/// Result of one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub emitted: u64,
    pub pages: u64,
    /// The run stopped because the session was cancelled, not because the
    /// data ran out.
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct ReplayPipeline {
    store: Arc<dyn CandleStore>,
    page_size: usize,
}

impl ReplayPipeline {
    pub fn new(store: Arc<dyn CandleStore>) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(MIN_PAGE_SIZE);
        self
    }

    /// Replay `descriptor` into `sink` until the data runs out, a fetch fails,
    /// or `cancel` fires.
    pub async fn run(
        &self,
        descriptor: StreamDescriptor,
        sink: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<ReplaySummary, HubError> {
        let (pull_tx, pull_rx) = mpsc::channel::<()>(1);
        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(1);
        let (done_tx, done_rx) = oneshot::channel::<FetchOutcome>();

        let latency = descriptor.latency();
        let fetch_cancel = cancel.child_token();
        let fetcher = Fetcher {
            store: Arc::clone(&self.store),
            cursor: descriptor.start,
            descriptor,
            page_size: self.page_size,
            last_epoch: None,
            pages: 0,
        };
        let fetch_task = tokio::spawn(fetcher.run(pull_rx, batch_tx, done_tx, fetch_cancel.clone()));

        let mut emitter = Emitter {
            sink,
            pull_tx,
            batch_rx,
            done_rx,
            done: None,
            cancel,
            latency,
            emitted: 0,
        };
        let result = emitter.run().await;

        fetch_cancel.cancel();
        let pages = fetch_task.await?;

        result.map(|cancelled| ReplaySummary {
            emitted: emitter.emitted,
            pages,
            cancelled,
        })
    }
}

struct Fetcher {
    store: Arc<dyn CandleStore>,
    descriptor: StreamDescriptor,
    page_size: usize,
    cursor: DateTime<Utc>,
    last_epoch: Option<i64>,
    pages: u64,
}

impl Fetcher {
    /// Serve pull signals until end of stream, failure or cancellation.
    /// Returns the number of pages delivered.
    async fn run(
        mut self,
        mut pull_rx: mpsc::Receiver<()>,
        batch_tx: mpsc::Sender<Batch>,
        done_tx: oneshot::Sender<FetchOutcome>,
        cancel: CancellationToken,
    ) -> u64 {
        let outcome = self.serve(&mut pull_rx, &batch_tx, &cancel).await;
        if let Err(e) = &outcome {
            tracing::error!(error = %e, cursor = %self.cursor, "replay fetch failed");
        }
        let _ = done_tx.send(outcome);
        self.pages
    }

    async fn serve(
        &mut self,
        pull_rx: &mut mpsc::Receiver<()>,
        batch_tx: &mpsc::Sender<Batch>,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                pulled = pull_rx.recv() => {
                    if pulled.is_none() {
                        return Ok(());
                    }
                }
            }

            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                page = self.next_page() => page?,
            };
            let Some(batch) = page else {
                tracing::debug!(pages = self.pages, "replay reached end of range");
                return Ok(());
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                sent = batch_tx.send(batch) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Fetch and serialize the page at the cursor. `None` means end of stream.
    ///
    /// The cursor is inclusive, so every page after the first starts with the
    /// last record of the previous one again. That duplicate is delivered. A
    /// page that reaches no further than what was already delivered holds
    /// nothing new and ends the stream.
    async fn next_page(&mut self) -> Result<Option<Batch>, HubError> {
        let d = &self.descriptor;
        let page = self
            .store
            .get_range(d.interval, &d.exchange, &d.symbol, self.cursor, d.end, self.page_size)
            .await?;

        let Some(last) = page.last() else {
            return Ok(None);
        };
        if self.last_epoch.is_some_and(|prev| last.epoch <= prev) {
            return Ok(None);
        }

        let batch = page
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Batch, _>>()?;

        self.cursor = Utc
            .timestamp_opt(last.epoch, 0)
            .single()
            .ok_or_else(|| HubError::Storage(format!("epoch out of range: {}", last.epoch)))?;
        self.last_epoch = Some(last.epoch);
        self.pages += 1;
        tracing::debug!(rows = batch.len(), cursor = %self.cursor, "replay page fetched");
        Ok(Some(batch))
    }
}

enum Flow {
    Continue,
    Stop,
}

struct Emitter {
    sink: mpsc::Sender<String>,
    pull_tx: mpsc::Sender<()>,
    batch_rx: mpsc::Receiver<Batch>,
    done_rx: oneshot::Receiver<FetchOutcome>,
    /// Set once the fetcher has finished cleanly while a batch is still draining.
    done: Option<FetchOutcome>,
    cancel: CancellationToken,
    latency: Duration,
    emitted: u64,
}

impl Emitter {
    /// Returns `Ok(true)` when stopped by cancellation, `Ok(false)` at end of stream.
    async fn run(&mut self) -> Result<bool, HubError> {
        self.pull();

        loop {
            if let Some(outcome) = self.done.take() {
                return outcome.map(|_| false);
            }

            let batch = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(true),
                batch = self.batch_rx.recv() => batch,
                outcome = &mut self.done_rx, if self.done.is_none() => {
                    self.done = Some(outcome.unwrap_or(Ok(())));
                    continue;
                }
            };

            let Some(batch) = batch else {
                // Fetcher exited; its outcome is already on the done signal.
                return (&mut self.done_rx).await.unwrap_or(Ok(())).map(|_| false);
            };

            if let Flow::Stop = self.drain(batch).await? {
                return Ok(true);
            }
        }
    }

    fn pull(&self) {
        // At most one pull is ever outstanding, so the slot is free. A closed
        // channel means the fetcher already finished.
        let _ = self.pull_tx.try_send(());
    }

    async fn drain(&mut self, batch: Batch) -> Result<Flow, HubError> {
        let total = batch.len();
        let mut pulled = false;

        for (idx, frame) in batch.into_iter().enumerate() {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Flow::Stop),
                sent = self.sink.send(frame) => {
                    if sent.is_err() {
                        return Ok(Flow::Stop);
                    }
                }
            }
            self.emitted += 1;

            if !pulled && (idx + 1) * 3 > total {
                pulled = true;
                self.pull();
            }

            if let Flow::Stop = self.pace().await? {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }

    /// Sleep one record's latency. A fetch failure cuts the sleep short; a
    /// clean end of stream is remembered and the batch keeps draining.
    async fn pace(&mut self) -> Result<Flow, HubError> {
        let sleep = tokio::time::sleep(self.latency);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(Flow::Stop),
                outcome = &mut self.done_rx, if self.done.is_none() => {
                    let outcome = outcome.unwrap_or(Ok(()));
                    if let Err(e) = outcome {
                        return Err(e);
                    }
                    self.done = Some(outcome);
                }
                _ = &mut sleep => return Ok(Flow::Continue),
            }
        }
    }
}
