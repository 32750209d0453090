use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

use super::failure::{Operation, OperationError, OperationFailure};

/// Outcome of a batch that did not fully succeed.
#[derive(Debug)]
pub(crate) struct BatchFailure {
    pub failures: Vec<OperationFailure>,
    /// Keys whose task finished before the batch was cancelled
    pub completed: Vec<String>,
}

/// Aborts the wrapped task when dropped, so cancelling the supervising task
/// also cancels the work.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run `task` over keyed `items` with at most `limit` tasks in flight.
///
/// The first failure aborts every task still queued or running; failures
/// from tasks that finished in the meantime are kept so the caller sees all
/// of them. A task that panics is reported as a failed `operation` on its key.
pub(crate) async fn run_bounded<I, T, F, Fut>(
    limit: usize,
    operation: Operation,
    items: Vec<(String, I)>,
    task: F,
) -> Result<Vec<(String, T)>, BatchFailure>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T, OperationFailure>> + Send + 'static,
{
    let permits = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();

    for (key, item) in items {
        let permits = Arc::clone(&permits);
        let work = task(item);
        tasks.spawn(async move {
            // The semaphore is never closed
            let _permit = permits.acquire_owned().await.ok();
            let mut work = AbortOnDrop(tokio::spawn(work));
            match (&mut work.0).await {
                Ok(Ok(value)) => Ok((key, value)),
                Ok(Err(failure)) => Err(failure),
                Err(join_error) => Err(OperationFailure::new(
                    operation,
                    key,
                    OperationError::Task(join_error.to_string()),
                )),
            }
        });
    }

    let mut results = Vec::new();
    let mut failures = Vec::new();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(done)) => results.push(done),
            Ok(Err(failure)) => {
                if failures.is_empty() {
                    debug!("Cancelling {} remaining transfer task(s)", tasks.len());
                    tasks.abort_all();
                }
                failures.push(failure);
            }
            // Supervisors only end early through abort_all
            Err(_) => {}
        }
    }

    if failures.is_empty() {
        Ok(results)
    } else {
        Err(BatchFailure {
            failures,
            completed: results.into_iter().map(|(key, _)| key).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::storage::StorageError;

    #[tokio::test]
    async fn test_respects_concurrency_limit() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let items = (0..12u32).map(|n| (format!("key-{}", n), n)).collect();
        let results = run_bounded(3, Operation::UploadBlob, items, |n| {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(n * 2)
            }
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let mut doubled: Vec<u32> = results.into_iter().map(|(_, v)| v).collect();
        doubled.sort();
        assert_eq!(doubled[11], 22);
    }

    #[tokio::test]
    async fn test_first_failure_cancels_the_rest() {
        let finished = Arc::new(AtomicUsize::new(0));

        let items = (0..5u32).map(|n| (format!("key-{}", n), n)).collect();
        let outcome = run_bounded(1, Operation::UploadBlob, items, |n| {
            let finished = Arc::clone(&finished);
            async move {
                if n == 0 {
                    return Err(OperationFailure::new(
                        Operation::UploadBlob,
                        "key-0",
                        OperationError::Storage(StorageError::Auth("denied".to_string())),
                    ));
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        let failure = outcome.unwrap_err();
        assert_eq!(failure.failures.len(), 1);
        assert_eq!(failure.failures[0].key, "key-0");
        assert!(failure.completed.len() < 4);
        assert!(finished.load(Ordering::SeqCst) < 4);
    }

    #[tokio::test]
    async fn test_panicking_task_names_its_key() {
        let items = vec![("blobs/sha256/aa".to_string(), 1u32), ("blobs/sha256/bb".to_string(), 2)];
        let outcome = run_bounded(2, Operation::UploadBlob, items, |n| async move {
            if n == 2 {
                panic!("worker crashed");
            }
            Ok(n)
        })
        .await;

        let failure = outcome.unwrap_err();
        let crashed = failure
            .failures
            .iter()
            .find(|f| matches!(f.cause, OperationError::Task(_)))
            .unwrap();
        assert_eq!(crashed.operation, Operation::UploadBlob);
        assert_eq!(crashed.key, "blobs/sha256/bb");
    }
}
