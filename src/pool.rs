use crate::config::PoolConfig;
use crate::counter::{spawn_aggregator, WorkerCounts};
use crate::error::PoolError;
use crate::queue::{JobQueue, JobSender};
use crate::shutdown::ShutdownCoordinator;
use crate::worker::{JobHandler, Worker, WorkerId};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Barrier;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// A fixed set of workers draining a shared, bounded job queue.
///
/// At most `num_workers` handler invocations run at once. Jobs are submitted
/// through [`submit`](Self::submit) or a cloned [`JobSender`]; the pool is
/// torn down with [`close`](Self::close), which returns only after every
/// queued job has been processed and every background task has exited.
pub struct WorkerPool<T: Send + 'static> {
  pool_name: Arc<String>,
  num_workers: usize,
  count_jobs: bool,
  sender: JobSender<T>,
  counts: WorkerCounts,
  shutdown_token: CancellationToken,
  coordinator_join_handle: Mutex<Option<JoinHandle<Result<(), PoolError>>>>,
}

impl<T: Send + 'static> fmt::Debug for WorkerPool<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerPool")
      .field("pool_name", &self.pool_name)
      .field("num_workers", &self.num_workers)
      .field("count_jobs", &self.count_jobs)
      .field("sender", &self.sender)
      .field("closed", &self.is_closed())
      .finish()
  }
}

impl<T: Send + 'static> WorkerPool<T> {
  /// Starts a pool and waits until every worker is running.
  ///
  /// When counting is enabled the counter starts before any worker, so no
  /// tally is lost. The shutdown coordinator is spawned next and then the
  /// workers. This future resolves only once each worker has reached its
  /// job loop, so jobs submitted right after are picked up without a
  /// startup race.
  ///
  /// # Errors
  /// Returns `PoolError::InvalidWorkerCount` if `config.num_workers` is zero.
  pub async fn start<H, Fut>(config: PoolConfig, tokio_handle: TokioHandle, handler: H) -> Result<Self, PoolError>
  where
    H: Fn(WorkerId, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    config.validate()?;

    let pool_name = Arc::new(config.resolve_name());
    let num_workers = config.num_workers;
    let shutdown_token = CancellationToken::new();
    let (sender, receiver) = JobQueue::new(config.effective_capacity(), shutdown_token.clone()).split();
    let counts = WorkerCounts::default();

    let (count_tx, counter_join_handle) = if config.count_jobs {
      let (tx, handle) = spawn_aggregator(counts.clone(), &tokio_handle, pool_name.clone());
      (Some(tx), Some(handle))
    } else {
      (None, None)
    };

    let workers = TaskTracker::new();
    let coordinator = ShutdownCoordinator::new(
      shutdown_token.clone(),
      receiver.clone(),
      workers.clone(),
      count_tx.clone(),
      counter_join_handle,
    );
    let coordinator_join_handle = tokio_handle.spawn(
      coordinator
        .run()
        .instrument(info_span!("shutdown_coordinator", pool_name = %*pool_name)),
    );
    // Cancels the shutdown token if this future is dropped before the pool exists.
    let startup_guard = shutdown_token.clone().drop_guard();

    let job_handler: JobHandler<T> = Arc::new(move |worker: WorkerId, job: T| handler(worker, job).boxed());
    let startup = Arc::new(Barrier::new(num_workers + 1));

    for id in 0..num_workers {
      let worker = Worker::new(id, receiver.clone(), job_handler.clone(), count_tx.clone(), startup.clone());
      workers.spawn_on(
        worker
          .run()
          .instrument(info_span!("worker", pool_name = %*pool_name, worker = id)),
        &tokio_handle,
      );
    }
    workers.close();
    drop(count_tx);
    drop(receiver);

    trace!(pool_name = %*pool_name, "Waiting for {} workers to start.", num_workers);
    startup.wait().await;
    let _ = startup_guard.disarm();
    info!(
      pool_name = %*pool_name,
      num_workers,
      queue_capacity = sender.capacity(),
      count_jobs = config.count_jobs,
      "Worker pool started."
    );

    Ok(Self {
      pool_name,
      num_workers,
      count_jobs: config.count_jobs,
      sender,
      counts,
      shutdown_token,
      coordinator_join_handle: Mutex::new(Some(coordinator_join_handle)),
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn num_workers(&self) -> usize {
    self.num_workers
  }

  /// A cloneable handle onto this pool's job queue.
  pub fn sender(&self) -> JobSender<T> {
    self.sender.clone()
  }

  /// Enqueues a job, waiting while the queue is full.
  ///
  /// # Errors
  /// Returns `PoolError::PoolShuttingDown` once `close()` has begun.
  pub async fn submit(&self, job: T) -> Result<(), PoolError> {
    let result = self.sender.submit(job).await;
    if result.is_err() {
      warn!(pool_name = %self.pool_name, "Submit: attempted to submit a job to a pool that is shutting down or closed.");
    }
    result
  }

  /// Enqueues a job without waiting.
  ///
  /// # Errors
  /// Returns `PoolError::QueueFull` when no slot is free and
  /// `PoolError::PoolShuttingDown` once `close()` has begun.
  pub fn try_submit(&self, job: T) -> Result<(), PoolError> {
    self.sender.try_submit(job)
  }

  /// Number of jobs waiting in the queue, not counting running ones.
  pub fn queued_job_count(&self) -> usize {
    self.sender.queued_len()
  }

  /// Per-worker job tallies. Always empty when counting is disabled.
  pub fn counts(&self) -> &WorkerCounts {
    &self.counts
  }

  pub fn is_counting(&self) -> bool {
    self.count_jobs
  }

  /// Returns `true` once `close()` has been called or the pool was dropped.
  pub fn is_closed(&self) -> bool {
    self.shutdown_token.is_cancelled()
  }

  /// Closes the pool and waits for it to wind down.
  ///
  /// Returns after the queue is closed, every already queued job has been
  /// processed, all workers have exited and the counter has tallied the
  /// last job. Jobs submitted concurrently with this call may be rejected
  /// with `PoolError::PoolShuttingDown`.
  ///
  /// # Errors
  /// Returns `PoolError::AlreadyClosed` on every call after the first,
  /// including calls made while the first is still waiting.
  /// Returns `PoolError::CoordinatorFailed` if the shutdown task could not be
  /// joined or the counter task failed.
  pub async fn close(&self) -> Result<(), PoolError> {
    let handle_to_await = self.coordinator_join_handle.lock().take();

    let Some(handle) = handle_to_await else {
      warn!(pool_name = %self.pool_name, "Close: pool was already closed.");
      return Err(PoolError::AlreadyClosed);
    };

    info!(pool_name = %self.pool_name, "Initiating pool close.");
    self.shutdown_token.cancel();

    match handle.await {
      Ok(Ok(())) => {
        info!(
          pool_name = %self.pool_name,
          total_processed = self.counts.total(),
          "Pool closed."
        );
        Ok(())
      }
      Ok(Err(coordinator_error)) => {
        error!(pool_name = %self.pool_name, "Shutdown sequence failed: {}", coordinator_error);
        Err(coordinator_error)
      }
      Err(join_error) => {
        error!(pool_name = %self.pool_name, "Error joining shutdown coordinator: {:?}", join_error);
        Err(PoolError::CoordinatorFailed(join_error.to_string()))
      }
    }
  }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
  fn drop(&mut self) {
    // Without an explicit close, signal shutdown so queued jobs drain and
    // every background task exits, but do not wait for it here.
    if self.coordinator_join_handle.get_mut().is_some() {
      info!(
        pool_name = %*self.pool_name,
        "WorkerPool dropped without close(). Signalling shutdown; workers drain in the background."
      );
      self.shutdown_token.cancel();
    } else {
      debug!(pool_name = %*self.pool_name, "Drop: pool already closed.");
    }
  }
}
