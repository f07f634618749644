//! Bounded batch scheduler
//!
//! Splits assignments into batches of at most `max_concurrency`, runs each
//! batch concurrently and waits for every member to settle before starting
//! the next. Each execution is its own spawned task, so if the caller stops
//! waiting (task-level timeout) the in-flight calls still finish and their
//! circuit updates still land.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error};

use crate::error::DispatchError;
use crate::resilience::ResilientExecutor;
use crate::router::Assignment;
use crate::state::Outcome;

/// Runs assignments batch by batch.
#[derive(Clone)]
pub struct BatchScheduler {
    executor: Arc<ResilientExecutor>,
    max_concurrency: usize,
}

impl BatchScheduler {
    /// `max_concurrency` below 1 is treated as 1.
    pub fn new(executor: Arc<ResilientExecutor>, max_concurrency: usize) -> Self {
        Self {
            executor,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Execute every assignment and return outcomes in assignment order.
    pub async fn run(&self, task_id: &str, assignments: &[Assignment]) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(assignments.len());

        for (index, batch) in assignments.chunks(self.max_concurrency).enumerate() {
            debug!(task_id, batch = index, size = batch.len(), "Starting batch");

            let handles: Vec<_> = batch
                .iter()
                .map(|assignment| {
                    let executor = Arc::clone(&self.executor);
                    let worker = assignment.worker.clone();
                    let sub_task = assignment.sub_task.clone();
                    let task_id = task_id.to_string();
                    tokio::spawn(async move {
                        executor.execute(&worker, &sub_task, &task_id).await
                    })
                })
                .collect();

            for (assignment, joined) in batch.iter().zip(join_all(handles).await) {
                let outcome = match joined {
                    Ok(Ok(result)) => Outcome::Fulfilled(result),
                    Ok(Err(error)) => Outcome::Rejected {
                        worker: assignment.worker.clone(),
                        error,
                    },
                    Err(join_error) => {
                        error!(task_id, worker = %assignment.worker, error = %join_error, "Worker execution aborted");
                        Outcome::Rejected {
                            worker: assignment.worker.clone(),
                            error: DispatchError::WorkerInvocation {
                                worker: assignment.worker.clone(),
                                reason: format!("execution aborted: {join_error}"),
                            },
                        }
                    }
                };
                outcomes.push(outcome);
            }
        }

        outcomes
    }
}
