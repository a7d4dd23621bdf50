//! Bounded execution of blocking audit work
//!
//! Directory and filesystem collaborators are blocking, so every unit of work
//! runs on a `spawn_blocking` thread. A semaphore bounds how many run at once
//! and each unit has a wall-clock timeout.

use crate::errors::{AuditError, AuditResult};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{info, warn};

/// Execution statistics for performance monitoring
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionStats {
    pub total_operations: u32,
    pub successful: u32,
    pub failed: u32,
    pub timed_out: u32,
    pub total_duration_ms: u64,
    pub avg_operation_ms: f64,
    pub parallel_efficiency: f64,
    pub last_execution: Option<String>,
}

/// Run a single blocking call off the async runtime with a timeout.
pub async fn run_blocking<T, F>(limit: Duration, label: &str, f: F) -> AuditResult<T>
where
    F: FnOnce() -> AuditResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(join_failure(label, join)),
        Err(_) => Err(AuditError::Timeout(format!(
            "{} did not complete within {} seconds",
            label,
            limit.as_secs()
        ))),
    }
}

fn join_failure(label: &str, err: tokio::task::JoinError) -> AuditError {
    AuditError::Io(std::io::Error::other(format!("{} worker failed: {}", label, err)))
}

pub struct BoundedExecutor {
    max_concurrency: usize,
    task_timeout: Duration,
    semaphore: Arc<Semaphore>,
    stats: RwLock<ExecutionStats>,
}

impl BoundedExecutor {
    pub fn new(max_concurrency: usize, task_timeout: Duration) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            max_concurrency,
            task_timeout,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            stats: RwLock::new(ExecutionStats::default()),
        }
    }

    /// Run `op` over every item; results come back in input order.
    ///
    /// The permit travels into the blocking closure, so a unit that overruns
    /// its timeout still occupies its slot until the thread finishes.
    pub async fn execute_blocking<I, T, F>(&self, items: Vec<I>, op: Arc<F>) -> Vec<AuditResult<T>>
    where
        I: Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> AuditResult<T> + Send + Sync + 'static,
    {
        let total = items.len() as u32;
        let start = Instant::now();
        let task_timeout = self.task_timeout;

        let futures: Vec<_> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| {
                let semaphore = self.semaphore.clone();
                let op = op.clone();

                async move {
                    let permit = semaphore.acquire_owned().await.map_err(|e| {
                        AuditError::Io(std::io::Error::other(format!("Semaphore closed: {}", e)))
                    })?;

                    let handle = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        op(item)
                    });

                    match tokio::time::timeout(task_timeout, handle).await {
                        Ok(Ok(result)) => result,
                        Ok(Err(join)) => Err(join_failure(&format!("task {}", index), join)),
                        Err(_) => {
                            warn!("Task {} exceeded {}s", index, task_timeout.as_secs());
                            Err(AuditError::Timeout(format!(
                                "Analysis did not complete within {} seconds",
                                task_timeout.as_secs()
                            )))
                        }
                    }
                }
            })
            .collect();

        let results: Vec<AuditResult<T>> = join_all(futures).await;

        let elapsed = start.elapsed();
        let successful = results.iter().filter(|r| r.is_ok()).count() as u32;
        let timed_out = results
            .iter()
            .filter(|r| matches!(r, Err(AuditError::Timeout(_))))
            .count() as u32;

        let mut stats = self.stats.write().await;
        stats.total_operations += total;
        stats.successful += successful;
        stats.failed += total - successful;
        stats.timed_out += timed_out;
        stats.total_duration_ms += elapsed.as_millis() as u64;
        if stats.total_operations > 0 {
            stats.avg_operation_ms = stats.total_duration_ms as f64 / stats.total_operations as f64;
        }
        stats.last_execution = Some(chrono::Utc::now().to_rfc3339());

        let elapsed_ms = elapsed.as_millis() as f64;
        if elapsed_ms > 0.0 && stats.avg_operation_ms > 0.0 {
            let sequential_estimate = stats.avg_operation_ms * total as f64;
            stats.parallel_efficiency = sequential_estimate / elapsed_ms;
        } else {
            stats.parallel_efficiency = 1.0;
        }

        info!(
            "Bounded execution complete: {}/{} successful in {:?} (concurrency {})",
            successful, total, elapsed, self.max_concurrency
        );

        results
    }

    pub async fn stats(&self) -> ExecutionStats {
        self.stats.read().await.clone()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}
