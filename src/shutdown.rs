use crate::counter::CountSender;
use crate::error::PoolError;
use crate::queue::JobReceiver;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Background task that tears a pool down in a fixed order once the close
/// signal fires:
///
/// 1. The job queue is closed. New jobs are refused while workers keep
///    draining what is already buffered.
/// 2. Every worker is awaited until it has terminated.
/// 3. Only then is the coordinator's counter sender dropped. Each worker
///    dropped its own clone on exit, so this closes the counter channel.
/// 4. The counter aggregator is awaited until it has tallied every signal.
///
/// The caller's `close()` awaits this task, so it returns only after all
/// four steps are done.
pub(crate) struct ShutdownCoordinator<T: Send + 'static> {
  shutdown_token: CancellationToken,
  jobs: JobReceiver<T>,
  workers: TaskTracker,
  count_tx: Option<CountSender>,
  counter_join_handle: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> ShutdownCoordinator<T> {
  pub(crate) fn new(
    shutdown_token: CancellationToken,
    jobs: JobReceiver<T>,
    workers: TaskTracker,
    count_tx: Option<CountSender>,
    counter_join_handle: Option<JoinHandle<()>>,
  ) -> Self {
    Self {
      shutdown_token,
      jobs,
      workers,
      count_tx,
      counter_join_handle,
    }
  }

  /// Runs the shutdown sequence once the close signal fires.
  ///
  /// # Errors
  /// Returns `PoolError::CoordinatorFailed` if the counter task panicked or
  /// was aborted, in which case the tallies may be incomplete.
  pub(crate) async fn run(self) -> Result<(), PoolError> {
    let Self {
      shutdown_token,
      jobs,
      workers,
      count_tx,
      counter_join_handle,
    } = self;

    shutdown_token.cancelled().await;
    jobs.close();
    drop(jobs);
    info!(
      workers = workers.len(),
      "Close signal received. Job queue closed, waiting for workers to drain."
    );

    workers.wait().await;
    info!("All workers stopped.");

    drop(count_tx);

    if let Some(handle) = counter_join_handle {
      debug!("Waiting for counter to drain remaining signals.");
      if let Err(join_error) = handle.await {
        error!("Error joining counter during shutdown: {:?}", join_error);
        return Err(PoolError::CoordinatorFailed(format!("counter task failed: {}", join_error)));
      }
      debug!("Counter successfully joined.");
    }

    info!("Pool shutdown sequence completed.");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::queue::JobQueue;
  use std::time::Duration;

  #[tokio::test]
  async fn test_failed_counter_is_reported() {
    let token = CancellationToken::new();
    let (_sender, receiver) = JobQueue::<u32>::new(1, token.clone()).split();
    let workers = TaskTracker::new();
    workers.close();

    let failing_counter: JoinHandle<()> = tokio::spawn(async {
      panic!("counter intentionally panicked");
    });

    let coordinator = ShutdownCoordinator::new(token.clone(), receiver, workers, None, Some(failing_counter));
    let run = tokio::spawn(coordinator.run());

    token.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), run)
      .await
      .expect("Coordinator did not finish.")
      .unwrap();
    assert!(matches!(result, Err(PoolError::CoordinatorFailed(_))));
  }

  #[tokio::test]
  async fn test_close_signal_closes_queue_after_buffered_jobs() {
    let token = CancellationToken::new();
    let (sender, receiver) = JobQueue::<u32>::new(2, token.clone()).split();
    let workers = TaskTracker::new();
    workers.close();

    sender.submit(1).await.unwrap();
    let coordinator = ShutdownCoordinator::new(token.clone(), receiver.clone(), workers, None, None);
    let run = tokio::spawn(coordinator.run());

    token.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(receiver.recv().await, Some(1));
    assert_eq!(receiver.recv().await, None);
  }
}
