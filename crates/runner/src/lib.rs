//! Bounded-concurrency batch runner.
//!
//! A batch is a list of independent futures. Runners drive them concurrently
//! inside the calling task (no background workers survive the call) and hand
//! back one result per task at the task's own index, whatever the completion
//! order was.

#![forbid(unsafe_code)]

use std::fmt;
use std::future::Future;

use anyhow::anyhow;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::counter;
use tracing::debug;

/// A deferred unit of work.
pub type Task<'a, T> = BoxFuture<'a, anyhow::Result<T>>;

/// Outcome of one task: its data or its error.
pub type TaskResult<T> = anyhow::Result<T>;

pub const DEFAULT_CONCURRENCY: usize = 16;

/// Executes batches of independent tasks.
///
/// Components take a runner as a constructor parameter so tests can swap in
/// [`SequentialRunner`] or an instrumented wrapper.
pub trait GroupRunner: Send + Sync {
    /// Run every task and return one result per task, `results[i]` belonging
    /// to `tasks[i]`.
    fn run_with_result<'a, T>(&'a self, tasks: Vec<Task<'a, T>>) -> BoxFuture<'a, Vec<TaskResult<T>>>
    where
        T: Send + 'a;

    /// Invoke `f(shared, arg)` for every element of `args`. Every invocation
    /// runs to completion even when some fail; failures come back together.
    fn run_diff_args<'a, S, A, F, Fut>(&'a self, f: F, shared: &'a S, args: Vec<A>) -> BoxFuture<'a, Result<(), GroupError>>
    where
        S: Sync + ?Sized + 'a,
        A: Send + 'a,
        F: Fn(&'a S, A) -> Fut + Send + 'a,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'a,
    {
        let tasks: Vec<Task<'a, ()>> = args.into_iter().map(|arg| f(shared, arg).boxed()).collect();
        self.run_with_result(tasks).map(GroupError::check).boxed()
    }
}

/// Failure of one or more units of a batch.
#[derive(Debug)]
pub struct GroupError {
    pub total: usize,
    /// `(index, error)` for every failed unit, in index order.
    pub failures: Vec<(usize, anyhow::Error)>,
}

impl GroupError {
    /// `Ok` when every result is `Ok`, otherwise all failures aggregated.
    pub fn check(results: Vec<TaskResult<()>>) -> Result<(), GroupError> {
        let total = results.len();
        let failures: Vec<_> = results
            .into_iter()
            .enumerate()
            .filter_map(|(idx, r)| r.err().map(|e| (idx, e)))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(GroupError { total, failures })
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} tasks failed", self.failures.len(), self.total)?;
        for (idx, err) in &self.failures {
            write!(f, "; [{}] {:#}", idx, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for GroupError {}

/// Runs up to `max_concurrency` tasks of a batch at a time.
#[derive(Debug, Clone)]
pub struct BoundedRunner {
    max_concurrency: usize,
}

impl BoundedRunner {
    pub fn new(max_concurrency: usize) -> Self {
        Self { max_concurrency: max_concurrency.max(1) }
    }

    /// Ceiling from `MILVOP_GROUP_CONCURRENCY`, falling back to the default.
    pub fn from_env() -> Self {
        let n = std::env::var("MILVOP_GROUP_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_CONCURRENCY);
        Self::new(n)
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

impl Default for BoundedRunner {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY)
    }
}

impl GroupRunner for BoundedRunner {
    fn run_with_result<'a, T>(&'a self, tasks: Vec<Task<'a, T>>) -> BoxFuture<'a, Vec<TaskResult<T>>>
    where
        T: Send + 'a,
    {
        let limit = self.max_concurrency;
        async move {
            let total = tasks.len();
            counter!("group_tasks", total as u64);
            // Each slot is written exactly once, by the task owning that index.
            let mut slots: Vec<Option<TaskResult<T>>> = (0..total).map(|_| None).collect();
            let mut pending = tasks.into_iter().enumerate();
            let mut running = FuturesUnordered::new();
            loop {
                while running.len() < limit {
                    let Some((idx, task)) = pending.next() else { break };
                    running.push(async move { (idx, task.await) });
                }
                let Some((idx, res)) = running.next().await else { break };
                slots[idx] = Some(res);
            }
            debug!(total, limit, "batch finished");
            slots
                .into_iter()
                .enumerate()
                .map(|(idx, slot)| slot.unwrap_or_else(|| Err(anyhow!("task {} produced no result", idx))))
                .collect()
        }
        .boxed()
    }
}

/// Runs tasks one at a time in index order. Deterministic; meant for tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialRunner;

impl GroupRunner for SequentialRunner {
    fn run_with_result<'a, T>(&'a self, tasks: Vec<Task<'a, T>>) -> BoxFuture<'a, Vec<TaskResult<T>>>
    where
        T: Send + 'a,
    {
        async move {
            let mut out = Vec::with_capacity(tasks.len());
            for task in tasks {
                out.push(task.await);
            }
            out
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_collects_every_failure() {
        let results: Vec<TaskResult<()>> = vec![Ok(()), Err(anyhow!("a")), Ok(()), Err(anyhow!("b"))];
        let err = GroupError::check(results).unwrap_err();
        assert_eq!(err.total, 4);
        assert_eq!(err.failures.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![1, 3]);
        let msg = err.to_string();
        assert!(msg.starts_with("2 of 4 tasks failed"), "{msg}");
        assert!(msg.contains("[3] b"), "{msg}");
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        assert_eq!(BoundedRunner::new(0).max_concurrency(), 1);
    }
}
