use crate::counter::{CountSender, CountSignal, JobOutcome};
use crate::queue::JobReceiver;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Barrier;
use tracing::{debug, error, info, trace, warn};

/// Index of a worker within its pool, in `0..num_workers`.
pub type WorkerId = usize;

/// The type-erased job handler shared by every worker of a pool.
pub(crate) type JobHandler<T> = Arc<dyn Fn(WorkerId, T) -> BoxFuture<'static, ()> + Send + Sync + 'static>;

/// One execution unit of a pool.
///
/// A worker is idle while waiting on the queue, running while its handler
/// future is polled, and terminated once the queue reports it is closed and
/// drained.
pub(crate) struct Worker<T: Send + 'static> {
  id: WorkerId,
  jobs: JobReceiver<T>,
  handler: JobHandler<T>,
  count_tx: Option<CountSender>,
  startup: Arc<Barrier>,
}

impl<T: Send + 'static> Worker<T> {
  pub(crate) fn new(
    id: WorkerId,
    jobs: JobReceiver<T>,
    handler: JobHandler<T>,
    count_tx: Option<CountSender>,
    startup: Arc<Barrier>,
  ) -> Self {
    Self {
      id,
      jobs,
      handler,
      count_tx,
      startup,
    }
  }

  pub(crate) async fn run(self) {
    self.startup.wait().await;
    debug!("Worker started.");

    let mut processed: u64 = 0;

    while let Some(job) = self.jobs.recv().await {
      trace!("Dequeued job. Running handler.");

      let handler = self.handler.clone();
      let id = self.id;
      let outcome = match AssertUnwindSafe(async move { handler(id, job).await })
        .catch_unwind()
        .await
      {
        Ok(()) => JobOutcome::Completed,
        Err(_panic_payload) => {
          error!("Job handler panicked. Worker continues with the next job.");
          JobOutcome::Panicked
        }
      };
      processed += 1;

      if let Some(count_tx) = &self.count_tx {
        let signal = CountSignal {
          worker: self.id,
          outcome,
        };
        if count_tx.send(signal).await.is_err() {
          warn!("Counter channel closed before the worker stopped. Job was not tallied.");
        }
      }
    }

    info!(processed, "Worker stopped: job queue closed and drained.");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::counter::{spawn_aggregator, WorkerCounts};
  use crate::queue::JobQueue;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::runtime::Handle as TokioHandle;
  use tokio_util::sync::CancellationToken;

  #[tokio::test]
  async fn test_worker_survives_panicking_job() {
    let token = CancellationToken::new();
    let (sender, receiver) = JobQueue::<u32>::new(4, token.clone()).split();
    let counts = WorkerCounts::default();
    let (count_tx, counter_join_handle) =
      spawn_aggregator(counts.clone(), &TokioHandle::current(), Arc::new("worker_test".to_string()));

    let ran = Arc::new(AtomicUsize::new(0));
    let handler: JobHandler<u32> = {
      let ran = ran.clone();
      Arc::new(move |_worker: WorkerId, job: u32| {
        let ran = ran.clone();
        async move {
          if job == 1 {
            panic!("job {} intentionally panicked", job);
          }
          ran.fetch_add(1, Ordering::SeqCst);
        }
        .boxed()
      })
    };

    let startup = Arc::new(Barrier::new(1));
    let worker = Worker::new(3, receiver.clone(), handler, Some(count_tx), startup);

    for job in 0..3 {
      sender.submit(job).await.unwrap();
    }
    receiver.close();

    worker.run().await;
    counter_join_handle.await.unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 2);
    assert_eq!(counts.get(3), 3);
    assert_eq!(counts.panicked(3), 1);
  }
}
