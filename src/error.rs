use thiserror::Error;

/// Errors that can occur within the `worker_orchestra` pool.
#[derive(Error, Debug, PartialEq)]
pub enum PoolError {
  #[error("Invalid worker count {0}: a pool needs at least one worker")]
  InvalidWorkerCount(usize),

  #[error("Job queue is at capacity")]
  QueueFull,

  #[error("Pool is shutting down or already shut down, cannot accept new jobs")]
  PoolShuttingDown,

  #[error("Pool was already closed")]
  AlreadyClosed,

  #[error("Shutdown coordinator failed to complete: {0}")]
  CoordinatorFailed(String),
}
