//! Parallel task execution.

use std::future::Future;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinError;
use tracing::{info_span, warn, Instrument};

use crate::error::{OrchestratorError, OrchestratorResult};

/// Runs batches of futures on the tokio runtime.
///
/// Each future is spawned, so it runs to completion even if the caller
/// stops waiting. Orchestrators rely on that: a creation task folds its own
/// outcome into membership whether or not anybody observes the result.
#[derive(Debug, Clone, Default)]
pub struct TaskRunner {
    timeout: Option<Duration>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop waiting for a batch after `timeout`. Unfinished tasks keep
    /// running and are reported as [`OrchestratorError::Task`].
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Spawn every task and wait for all of them.
    ///
    /// Results are returned in submission order. A failing task never
    /// cancels its siblings.
    pub async fn run_parallel<T, F>(&self, name: &str, tasks: Vec<F>) -> Vec<OrchestratorResult<T>>
    where
        F: Future<Output = OrchestratorResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let span = info_span!("parallel", task = name, count = tasks.len());
        let mut handles: Vec<_> = tasks
            .into_iter()
            .map(|task| tokio::spawn(task.instrument(span.clone())))
            .collect();

        let joined = match self.timeout {
            None => join_all(handles).await,
            Some(timeout) => {
                let deadline = tokio::time::Instant::now() + timeout;
                let mut joined = Vec::with_capacity(handles.len());
                for handle in handles.iter_mut() {
                    match tokio::time::timeout_at(deadline, handle).await {
                        Ok(result) => joined.push(result),
                        Err(_) => {
                            warn!(task = name, ?timeout, "Parallel task timed out");
                            joined.push(Ok(Err(OrchestratorError::Task(format!(
                                "task '{}' timed out after {:?}",
                                name, timeout
                            )))));
                        }
                    }
                }
                joined
            }
        };

        joined
            .into_iter()
            .map(|result| flatten(name, result))
            .collect()
    }
}

fn flatten<T>(name: &str, joined: Result<OrchestratorResult<T>, JoinError>) -> OrchestratorResult<T> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(OrchestratorError::Task(format!("task '{}' panicked", name))),
        Err(e) => Err(OrchestratorError::Task(format!("task '{}' failed: {}", name, e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn results_keep_submission_order() {
        let runner = TaskRunner::new();
        let tasks: Vec<_> = (0..5u64)
            .map(|i| async move {
                tokio::time::sleep(Duration::from_millis(25 - i * 5)).await;
                Ok(i)
            })
            .collect();

        let results = runner.run_parallel("order", tasks).await;
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn one_failure_does_not_cancel_others() {
        let runner = TaskRunner::new();
        let tasks: Vec<_> = (0..3)
            .map(|i| async move {
                if i == 1 {
                    Err(OrchestratorError::InvalidArgument("bad".into()))
                } else {
                    Ok(i)
                }
            })
            .collect();

        let results = runner.run_parallel("mixed", tasks).await;
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn panics_become_task_errors() {
        let runner = TaskRunner::new();
        let tasks = vec![async {
            if true {
                panic!("boom");
            }
            Ok(())
        }];

        let results = runner.run_parallel("panicky", tasks).await;
        assert!(matches!(results[0], Err(OrchestratorError::Task(_))));
    }

    #[tokio::test]
    async fn timeout_reports_unfinished_tasks() {
        let runner = TaskRunner::with_timeout(Duration::from_millis(20));
        let tasks: Vec<_> = [1u64, 500]
            .into_iter()
            .map(|ms| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(ms)
            })
            .collect();

        let results = runner.run_parallel("slow", tasks).await;
        assert_eq!(*results[0].as_ref().unwrap(), 1);
        assert!(matches!(results[1], Err(OrchestratorError::Task(_))));
    }
}
