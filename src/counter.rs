use crate::worker::WorkerId;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use fibre::mpsc::{self, AsyncReceiver, AsyncSender};
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, trace, Instrument};

/// How a single handler invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobOutcome {
  Completed,
  Panicked,
}

/// Sent by a worker to the aggregator after each job.
#[derive(Debug)]
pub(crate) struct CountSignal {
  pub(crate) worker: WorkerId,
  pub(crate) outcome: JobOutcome,
}

pub(crate) type CountSender = AsyncSender<CountSignal>;

/// Per-worker job tallies.
///
/// Only the pool's aggregator task writes to these maps; any number of
/// readers may inspect them while jobs are still running, seeing counts
/// that trail the workers slightly until the pool is closed. Counts never
/// decrease.
#[derive(Clone, Default)]
pub struct WorkerCounts {
  processed: Arc<DashMap<WorkerId, u64>>,
  panicked: Arc<DashMap<WorkerId, u64>>,
}

impl fmt::Debug for WorkerCounts {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WorkerCounts")
      .field("workers_seen", &self.processed.len())
      .field("total", &self.total())
      .field("total_panicked", &self.total_panicked())
      .finish()
  }
}

impl WorkerCounts {
  /// Jobs processed by `worker`, including ones whose handler panicked.
  pub fn get(&self, worker: WorkerId) -> u64 {
    self.processed.get(&worker).map_or(0, |count| *count)
  }

  /// Jobs whose handler panicked on `worker`.
  pub fn panicked(&self, worker: WorkerId) -> u64 {
    self.panicked.get(&worker).map_or(0, |count| *count)
  }

  pub fn total(&self) -> u64 {
    self.processed.iter().map(|entry| *entry.value()).sum()
  }

  pub fn total_panicked(&self) -> u64 {
    self.panicked.iter().map(|entry| *entry.value()).sum()
  }

  /// Returns `true` if no job has been tallied yet.
  pub fn is_empty(&self) -> bool {
    self.processed.is_empty()
  }

  /// A point-in-time copy of the processed counts, keyed by worker.
  pub fn snapshot(&self) -> HashMap<WorkerId, u64> {
    self
      .processed
      .iter()
      .map(|entry| (*entry.key(), *entry.value()))
      .collect()
  }

  fn record(&self, signal: &CountSignal) {
    *self.processed.entry(signal.worker).or_insert(0) += 1;
    if signal.outcome == JobOutcome::Panicked {
      *self.panicked.entry(signal.worker).or_insert(0) += 1;
    }
  }
}

/// Starts the aggregator task and returns the sender workers report to.
///
/// The task ends once every clone of the returned sender has been dropped
/// and all signals sent before that have been tallied.
pub(crate) fn spawn_aggregator(
  counts: WorkerCounts,
  tokio_handle: &TokioHandle,
  pool_name: Arc<String>,
) -> (CountSender, JoinHandle<()>) {
  let (signal_tx, signal_rx) = mpsc::unbounded_async();

  let join_handle = tokio_handle.spawn(
    run_counter_loop(signal_rx, counts).instrument(info_span!("job_counter", pool_name = %*pool_name)),
  );

  (signal_tx, join_handle)
}

async fn run_counter_loop(signal_rx: AsyncReceiver<CountSignal>, counts: WorkerCounts) {
  info!("Counter started.");

  while let Ok(signal) = signal_rx.recv().await {
    trace!(worker = signal.worker, outcome = ?signal.outcome, "Counter: tallying job.");
    counts.record(&signal);
  }

  debug!("Counter: all signal senders dropped and queue drained.");
  info!(total = counts.total(), panicked = counts.total_panicked(), "Counter stopped.");
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_record_increments_per_worker() {
    let counts = WorkerCounts::default();
    assert!(counts.is_empty());

    counts.record(&CountSignal { worker: 0, outcome: JobOutcome::Completed });
    counts.record(&CountSignal { worker: 0, outcome: JobOutcome::Completed });
    counts.record(&CountSignal { worker: 2, outcome: JobOutcome::Panicked });

    assert_eq!(counts.get(0), 2);
    assert_eq!(counts.get(1), 0);
    assert_eq!(counts.get(2), 1);
    assert_eq!(counts.panicked(2), 1);
    assert_eq!(counts.total(), 3);
    assert_eq!(counts.total_panicked(), 1);
    assert_eq!(counts.snapshot(), HashMap::from([(0, 2), (2, 1)]));
  }

  #[tokio::test]
  async fn test_aggregator_drains_before_stopping() {
    let counts = WorkerCounts::default();
    let (signal_tx, join_handle) =
      spawn_aggregator(counts.clone(), &TokioHandle::current(), Arc::new("counter_test".to_string()));

    let second_tx = signal_tx.clone();
    for i in 0..10 {
      signal_tx
        .send(CountSignal { worker: i % 2, outcome: JobOutcome::Completed })
        .await
        .unwrap();
    }
    second_tx
      .send(CountSignal { worker: 1, outcome: JobOutcome::Panicked })
      .await
      .unwrap();

    drop(signal_tx);
    drop(second_tx);
    join_handle.await.unwrap();

    assert_eq!(counts.get(0), 5);
    assert_eq!(counts.get(1), 6);
    assert_eq!(counts.total_panicked(), 1);
  }
}
