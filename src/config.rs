use crate::error::PoolError;

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

lazy_static::lazy_static! {
  static ref NEXT_POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Construction parameters for a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Number of workers started; also the cap on concurrently running jobs.
  pub num_workers: usize,
  /// Job queue capacity. Zero is accepted and treated as one.
  pub queue_capacity: usize,
  /// Whether completed jobs are tallied per worker.
  pub count_jobs: bool,
  /// Name used in log events. Generated when not set.
  pub name: Option<String>,
}

impl PoolConfig {
  pub fn new(num_workers: usize, queue_capacity: usize) -> Self {
    Self {
      num_workers,
      queue_capacity,
      count_jobs: false,
      name: None,
    }
  }

  pub fn with_counting(mut self, count_jobs: bool) -> Self {
    self.count_jobs = count_jobs;
    self
  }

  pub fn with_name(mut self, name: &str) -> Self {
    self.name = Some(name.to_string());
    self
  }

  /// Rejects configurations that would produce a pool which never drains.
  pub fn validate(&self) -> Result<(), PoolError> {
    if self.num_workers == 0 {
      return Err(PoolError::InvalidWorkerCount(self.num_workers));
    }
    Ok(())
  }

  /// The capacity actually handed to the channel.
  pub(crate) fn effective_capacity(&self) -> usize {
    self.queue_capacity.max(1)
  }

  pub(crate) fn resolve_name(&self) -> String {
    match &self.name {
      Some(name) => name.clone(),
      None => {
        let id = NEXT_POOL_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed);
        format!("worker_pool-{}", id)
      }
    }
  }
}
