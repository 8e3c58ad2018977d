//! Storage reads for an event model.
//!
//! A [`QueryPipeline`] runs one fetch at a time in the configured
//! [`QueryMode`]. Off-owner reads run on a tokio blocking task, or on a
//! [`QueryWorker`] thread when one is attached, and send their rows back
//! through an unbounded `mpsc` queue drained by the owner. Every fetch is
//! tagged with the generation current at dispatch; results from older
//! generations are dropped on receipt.

use std::sync::Arc;
use std::thread::JoinHandle;

use commlog_core::{Event, EventFilter};
use commlog_settings::{QueryModeSetting, QuerySettings};
use commlog_store::{StorageGateway, StoreError};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::errors::{CacheError, Result};

/// How fetches execute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum QueryMode {
    /// Read on the caller, no chunking.
    Sync,
    /// One full read off the owner.
    #[default]
    Async,
    /// A first chunk, then further chunks on demand.
    Streamed {
        /// Rows in the first chunk.
        first_chunk_size: usize,
        /// Rows in each later chunk.
        chunk_size: usize,
    },
}

impl From<&QuerySettings> for QueryMode {
    fn from(settings: &QuerySettings) -> Self {
        match settings.mode {
            QueryModeSetting::Sync => Self::Sync,
            QueryModeSetting::Async => Self::Async,
            QueryModeSetting::Streamed => Self::Streamed {
                first_chunk_size: settings.first_chunk_size,
                chunk_size: settings.chunk_size,
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker thread
// ─────────────────────────────────────────────────────────────────────────────

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A dedicated thread that runs storage reads in submission order.
///
/// Shared between models as `Arc<QueryWorker>`; the thread exits once the
/// last handle is dropped.
#[derive(Debug)]
pub struct QueryWorker {
    tx: Option<mpsc::UnboundedSender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl QueryWorker {
    /// Start a worker thread named `name`.
    pub fn spawn(name: &str) -> Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    job();
                }
                debug!("query worker exiting");
            })
            .map_err(|e| {
                warn!(error = %e, "failed to spawn query worker");
                CacheError::WorkerGone
            })?;
        Ok(Self {
            tx: Some(tx),
            handle: Some(handle),
        })
    }

    fn submit(&self, job: Job) -> Result<()> {
        self.tx
            .as_ref()
            .ok_or(CacheError::WorkerGone)?
            .send(job)
            .map_err(|_| CacheError::WorkerGone)
    }
}

impl Drop for QueryWorker {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline
// ─────────────────────────────────────────────────────────────────────────────

/// Rows produced by one dispatched read.
#[derive(Debug)]
pub struct FetchResult {
    generation: u64,
    first: bool,
    requested: Option<usize>,
    rows: std::result::Result<Vec<Event>, StoreError>,
}

/// A current-generation result, ready to merge.
#[derive(Debug)]
pub struct Fetched {
    /// Whether this is the first (or only) chunk of the fetch.
    pub first: bool,
    /// Rows, newest first, or the storage failure.
    pub rows: std::result::Result<Vec<Event>, StoreError>,
}

/// What [`QueryPipeline::start`] did.
#[derive(Debug)]
pub enum Started {
    /// Sync mode: the rows are already here.
    Done(std::result::Result<Vec<Event>, StoreError>),
    /// The read runs in the background; watch the result queue.
    Dispatched,
}

/// Fetch state machine for one model.
pub struct QueryPipeline {
    gateway: Arc<dyn StorageGateway>,
    mode: QueryMode,
    worker: Option<Arc<QueryWorker>>,
    generation: u64,
    filter: EventFilter,
    next_offset: usize,
    started: bool,
    exhausted: bool,
    in_flight: bool,
    tx: mpsc::UnboundedSender<FetchResult>,
    rx: mpsc::UnboundedReceiver<FetchResult>,
}

impl QueryPipeline {
    /// Pipeline reading from `gateway`.
    pub fn new(gateway: Arc<dyn StorageGateway>, mode: QueryMode) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            gateway,
            mode,
            worker: None,
            generation: 0,
            filter: EventFilter::default(),
            next_offset: 0,
            started: false,
            exhausted: false,
            in_flight: false,
            tx,
            rx,
        }
    }

    /// Current mode.
    pub fn mode(&self) -> QueryMode {
        self.mode
    }

    /// Change the mode; outstanding results are dropped.
    pub fn set_mode(&mut self, mode: QueryMode) {
        self.mode = mode;
        self.cancel();
    }

    /// Route reads to `worker` (or back to blocking tasks with `None`);
    /// outstanding results are dropped.
    pub fn set_worker(&mut self, worker: Option<Arc<QueryWorker>>) {
        self.worker = worker;
        self.cancel();
    }

    /// Generation tag of the current fetch.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a dispatched read has not reported back yet.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Invalidate everything dispatched so far.
    pub fn cancel(&mut self) {
        self.generation += 1;
        self.in_flight = false;
    }

    /// Start a new fetch for `filter`.
    pub fn start(&mut self, filter: EventFilter) -> Result<Started> {
        self.cancel();
        self.filter = filter;
        self.next_offset = 0;
        self.exhausted = false;
        self.started = true;

        match self.mode {
            QueryMode::Sync => {
                self.exhausted = true;
                let rows = self.gateway.query_events(&self.filter);
                debug!(
                    generation = self.generation,
                    ok = rows.is_ok(),
                    "sync fetch complete"
                );
                Ok(Started::Done(rows))
            }
            QueryMode::Async => {
                self.dispatch(self.filter.clone(), None, true)?;
                Ok(Started::Dispatched)
            }
            QueryMode::Streamed {
                first_chunk_size, ..
            } => {
                let window = self.filter.clone().with_window(Some(first_chunk_size), Some(0));
                self.dispatch(window, Some(first_chunk_size), true)?;
                Ok(Started::Dispatched)
            }
        }
    }

    /// Whether another chunk can be requested now.
    pub fn can_fetch_more(&self) -> bool {
        matches!(self.mode, QueryMode::Streamed { .. })
            && self.started
            && !self.exhausted
            && !self.in_flight
    }

    /// Request the next chunk. Returns `false` when there is nothing to do.
    pub fn fetch_more(&mut self) -> Result<bool> {
        if !self.can_fetch_more() {
            return Ok(false);
        }
        let QueryMode::Streamed { chunk_size, .. } = self.mode else {
            return Ok(false);
        };
        let window = self
            .filter
            .clone()
            .with_window(Some(chunk_size), Some(self.next_offset));
        self.dispatch(window, Some(chunk_size), false)?;
        Ok(true)
    }

    fn dispatch(
        &mut self,
        filter: EventFilter,
        requested: Option<usize>,
        first: bool,
    ) -> Result<()> {
        let gateway = Arc::clone(&self.gateway);
        let tx = self.tx.clone();
        let generation = self.generation;
        let job = move || {
            let rows = gateway.query_events(&filter);
            if let Err(e) = &rows {
                warn!(generation, error = %e, "fetch failed");
            }
            let _ = tx.send(FetchResult {
                generation,
                first,
                requested,
                rows,
            });
        };

        match &self.worker {
            Some(worker) => worker.submit(Box::new(job))?,
            None => {
                let handle = Handle::try_current().map_err(|_| CacheError::NoRuntime)?;
                drop(handle.spawn_blocking(job));
            }
        }
        self.in_flight = true;
        debug!(generation, first, ?requested, "fetch dispatched");
        Ok(())
    }

    /// Next current-generation result, without waiting.
    pub fn try_next(&mut self) -> Option<Fetched> {
        while let Ok(result) = self.rx.try_recv() {
            if let Some(fetched) = self.complete(result) {
                return Some(fetched);
            }
        }
        None
    }

    /// Wait for the next current-generation result.
    pub async fn next(&mut self) -> Option<Fetched> {
        loop {
            let result = self.rx.recv().await?;
            if let Some(fetched) = self.complete(result) {
                return Some(fetched);
            }
        }
    }

    fn complete(&mut self, result: FetchResult) -> Option<Fetched> {
        if result.generation != self.generation {
            debug!(
                stale = result.generation,
                current = self.generation,
                "discarding stale fetch result"
            );
            return None;
        }
        self.in_flight = false;
        match &result.rows {
            Ok(rows) => {
                self.next_offset += rows.len();
                self.exhausted = result.requested.is_none_or(|n| rows.len() < n);
            }
            Err(_) => self.exhausted = true,
        }
        Some(Fetched {
            first: result.first,
            rows: result.rows,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
