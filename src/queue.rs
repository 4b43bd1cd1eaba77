use crate::error::PoolError;

use std::fmt;

use async_channel::{Receiver, Sender, TrySendError};
use tokio_util::sync::CancellationToken;

/// A bounded FIFO queue of jobs shared between submitters and workers.
///
/// The queue is a bounded multi-producer, multi-consumer `async_channel`.
/// Submitters wait for a free slot when the queue is full, which is the
/// pool's only form of back-pressure. Every worker owns a clone of the
/// receiving half, so idle workers all wait on the channel itself.
pub(crate) struct JobQueue<T: Send + 'static> {
  tx: Sender<T>,
  rx: Receiver<T>,
  capacity: usize,
  shutdown_token: CancellationToken,
}

impl<T: Send + 'static> JobQueue<T> {
  /// Creates a new `JobQueue`. A capacity of zero is raised to one.
  pub(crate) fn new(capacity: usize, shutdown_token: CancellationToken) -> Self {
    let capacity = capacity.max(1);
    let (tx, rx) = async_channel::bounded(capacity);
    Self {
      tx,
      rx,
      capacity,
      shutdown_token,
    }
  }

  /// Splits the queue into the caller-facing sender and the worker-facing receiver.
  pub(crate) fn split(self) -> (JobSender<T>, JobReceiver<T>) {
    (
      JobSender {
        tx: self.tx,
        capacity: self.capacity,
        shutdown_token: self.shutdown_token,
      },
      JobReceiver { rx: self.rx },
    )
  }
}

/// The submission handle for a pool's job queue.
///
/// Cheap to clone; every clone feeds the same queue. Submitting after the
/// pool's `close()` has begun is rejected with [`PoolError::PoolShuttingDown`].
pub struct JobSender<T: Send + 'static> {
  tx: Sender<T>,
  capacity: usize,
  shutdown_token: CancellationToken,
}

impl<T: Send + 'static> Clone for JobSender<T> {
  fn clone(&self) -> Self {
    Self {
      tx: self.tx.clone(),
      capacity: self.capacity,
      shutdown_token: self.shutdown_token.clone(),
    }
  }
}

impl<T: Send + 'static> fmt::Debug for JobSender<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobSender")
      .field("queued", &self.queued_len())
      .field("capacity", &self.capacity)
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl<T: Send + 'static> JobSender<T> {
  /// Enqueues a job, waiting for a free slot if the queue is full.
  ///
  /// # Errors
  /// Returns `PoolError::PoolShuttingDown` if the pool is closing or closed,
  /// including when close begins while this call is waiting for capacity.
  /// The job is dropped in that case.
  pub async fn submit(&self, job: T) -> Result<(), PoolError> {
    if self.is_closed() {
      return Err(PoolError::PoolShuttingDown);
    }

    tokio::select! {
      biased;
      _ = self.shutdown_token.cancelled() => Err(PoolError::PoolShuttingDown),
      send_result = self.tx.send(job) => send_result.map_err(|_| PoolError::PoolShuttingDown),
    }
  }

  /// Enqueues a job only if a slot is free right now.
  ///
  /// # Errors
  /// Returns `PoolError::QueueFull` when the queue is at capacity and
  /// `PoolError::PoolShuttingDown` when the pool is closing or closed.
  pub fn try_submit(&self, job: T) -> Result<(), PoolError> {
    if self.is_closed() {
      return Err(PoolError::PoolShuttingDown);
    }

    match self.tx.try_send(job) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(_)) => Err(PoolError::QueueFull),
      Err(TrySendError::Closed(_)) => Err(PoolError::PoolShuttingDown),
    }
  }

  /// Blocking variant of [`submit`](Self::submit) for synchronous code.
  ///
  /// Parks the calling thread until the job is enqueued or close begins,
  /// with the same outcomes as `submit`.
  ///
  /// Must not be called from within an asynchronous execution context: it
  /// would block a runtime thread.
  pub fn blocking_submit(&self, job: T) -> Result<(), PoolError> {
    futures::executor::block_on(self.submit(job))
  }

  /// Number of jobs waiting in the queue.
  pub fn queued_len(&self) -> usize {
    self.tx.len()
  }

  /// The queue's fixed capacity.
  pub fn capacity(&self) -> usize {
    self.capacity
  }

  /// Returns `true` once close has been signalled or the queue is closed.
  pub fn is_closed(&self) -> bool {
    self.shutdown_token.is_cancelled() || self.tx.is_closed()
  }
}

/// A worker's handle onto the queue. Every worker holds its own clone.
pub(crate) struct JobReceiver<T: Send + 'static> {
  rx: Receiver<T>,
}

impl<T: Send + 'static> Clone for JobReceiver<T> {
  fn clone(&self) -> Self {
    Self { rx: self.rx.clone() }
  }
}

impl<T: Send + 'static> fmt::Debug for JobReceiver<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("JobReceiver")
      .field("queued", &self.rx.len())
      .field("closed", &self.rx.is_closed())
      .finish()
  }
}

impl<T: Send + 'static> JobReceiver<T> {
  /// Receives the next job.
  ///
  /// Returns `None` only when the queue is closed and every buffered job has
  /// been handed out.
  pub(crate) async fn recv(&self) -> Option<T> {
    self.rx.recv().await.ok()
  }

  /// Closes the queue. Pending and later submissions fail; jobs already
  /// buffered are still handed out by `recv`.
  pub(crate) fn close(&self) {
    if self.rx.close() {
      tracing::debug!(buffered = self.rx.len(), "Job queue closed.");
    }
  }
}
