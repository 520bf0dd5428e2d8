//! Bounded-concurrency executor for chunk uploads.
//!
//! A [`WorkerPool`] runs a fixed number of tokio tasks, each owning one
//! [`ChunkWorker`]. Work is submitted through a [`Batch`]: every task
//! dispatched for a batch carries the batch's result sender, and the batch
//! counts results back in. A batch that loses tasks to termination sees its
//! result channel close early and reports [`UploadError::PoolTerminated`].

use std::sync::{Arc, Mutex, MutexGuard};

use backhaul_storage::Connector;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::UploadError;
use crate::types::{ChunkResult, UploadTask};
use crate::worker::ChunkWorker;

struct Dispatch {
    task: UploadTask,
    results: mpsc::UnboundedSender<ChunkResult>,
}

type TaskQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Dispatch>>>;

/// Fixed-size pool of chunk workers.
pub struct WorkerPool {
    size: usize,
    queue: Mutex<Option<mpsc::UnboundedSender<Dispatch>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Starts `size` workers (at least one) that connect through `connector`.
    pub fn new(size: usize, connector: Arc<dyn Connector>) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let queue: TaskQueue = Arc::new(tokio::sync::Mutex::new(rx));
        let cancel = CancellationToken::new();

        let handles = (0..size)
            .map(|id| {
                let worker = ChunkWorker::new(Arc::clone(&connector), cancel.child_token());
                tokio::spawn(worker_loop(id, worker, Arc::clone(&queue), cancel.clone()))
            })
            .collect();

        debug!(workers = size, "worker pool started");
        Self {
            size,
            queue: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            cancel,
        }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Opens a new batch of tasks.
    pub fn batch(&self) -> Result<Batch, UploadError> {
        let queue = lock(&self.queue)
            .as_ref()
            .cloned()
            .ok_or(UploadError::PoolTerminated)?;
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Ok(Batch {
            queue,
            results_tx: Some(results_tx),
            results_rx,
            submitted: 0,
            received: 0,
            cancel: self.cancel.clone(),
        })
    }

    /// Stops every running and queued task and waits for the workers to exit.
    ///
    /// Idempotent; outstanding batches fail with
    /// [`UploadError::PoolTerminated`].
    pub async fn terminate(&self) {
        self.cancel.cancel();
        lock(&self.queue).take();

        let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();
        if handles.is_empty() {
            return;
        }
        info!(workers = handles.len(), "terminating worker pool");
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in lock(&self.handles).drain(..) {
            handle.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

async fn worker_loop(
    id: usize,
    mut worker: ChunkWorker,
    queue: TaskQueue,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = tokio::select! {
                _ = cancel.cancelled() => break,
                rx = queue.lock() => rx,
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                d = rx.recv() => d,
            }
        };
        let Some(dispatch) = next else { break };

        let part = dispatch.task.chunk.part_number;
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            r = worker.run(dispatch.task) => r,
        };
        if dispatch.results.send(result).is_err() {
            debug!(worker = id, part, "batch dropped before result arrived");
        }
    }
    worker.close().await;
    debug!(worker = id, "worker stopped");
}

/// A group of tasks whose results are collected together.
pub struct Batch {
    queue: mpsc::UnboundedSender<Dispatch>,
    results_tx: Option<mpsc::UnboundedSender<ChunkResult>>,
    results_rx: mpsc::UnboundedReceiver<ChunkResult>,
    submitted: usize,
    received: usize,
    cancel: CancellationToken,
}

impl Batch {
    /// Queues `task` without waiting for a worker.
    pub fn submit(&mut self, task: UploadTask) -> Result<(), UploadError> {
        let results = self
            .results_tx
            .as_ref()
            .cloned()
            .ok_or(UploadError::PoolTerminated)?;
        if self.cancel.is_cancelled() {
            return Err(UploadError::PoolTerminated);
        }
        self.queue
            .send(Dispatch { task, results })
            .map_err(|_| UploadError::PoolTerminated)?;
        self.submitted += 1;
        Ok(())
    }

    /// Tasks submitted so far.
    pub fn submitted(&self) -> usize {
        self.submitted
    }

    /// Waits for the next result in completion order. Returns `Ok(None)`
    /// once every submitted task has reported.
    ///
    /// No further tasks can be submitted after the first call.
    pub async fn next_result(&mut self) -> Result<Option<ChunkResult>, UploadError> {
        // Only dispatched tasks hold senders from here on, so the channel
        // closes if the pool drops them.
        self.results_tx = None;

        if self.received == self.submitted {
            return Ok(None);
        }
        let next = tokio::select! {
            biased;
            r = self.results_rx.recv() => r,
            _ = self.cancel.cancelled() => None,
        };
        match next {
            Some(result) => {
                self.received += 1;
                Ok(Some(result))
            }
            None => Err(UploadError::PoolTerminated),
        }
    }

    /// Waits for every submitted task and returns the results ordered by
    /// part number. Failed chunks are included, not skipped.
    pub async fn await_all(mut self) -> Result<Vec<ChunkResult>, UploadError> {
        let mut results = Vec::with_capacity(self.submitted);
        while let Some(result) = self.next_result().await? {
            results.push(result);
        }
        results.sort_by_key(|r| r.part_number);
        Ok(results)
    }
}
