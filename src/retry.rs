use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{BoxTask, InvocationContext, PrepareScope, Result, TaskGroupError, TaskItem, TaskValue};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(30);
const MAX_INTERVAL_CAP: Duration = Duration::from_secs(150);

/// Exponential backoff settings. `max_attempts` of 0 or 1 means a single
/// attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_attempts: 0,
            multiplier: 2.0,
        }
    }
}

pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: Option<RetryPolicy>) -> Self {
        let mut policy = policy.unwrap_or_default();

        if policy.interval.is_zero() {
            policy.interval = DEFAULT_INTERVAL;
        }
        if policy.max_interval.is_zero() {
            policy.max_interval = DEFAULT_MAX_INTERVAL;
        }
        if policy.multiplier <= 0.0 {
            policy.multiplier = 2.0;
        }
        if policy.max_interval > MAX_INTERVAL_CAP {
            policy.max_interval = MAX_INTERVAL_CAP;
        }

        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds or the attempts run out. The
    /// attempt number starts at 1. Cancelling `token` stops further attempts.
    pub async fn execute_with_retry<F, Fut, V>(
        &self,
        token: &CancellationToken,
        task_name: &str,
        mut operation: F,
    ) -> Result<V>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        if max_attempts == 1 {
            return operation(1).await;
        }

        let mut last_error = None;
        for attempt in 1..=max_attempts {
            if token.is_cancelled() {
                return Err(TaskGroupError::TaskCancelled(task_name.to_string()));
            }

            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => last_error = Some(err),
            }

            if attempt == max_attempts {
                break;
            }

            let wait = self.calculate_backoff(attempt);
            if let Some(err) = &last_error {
                warn!(task = task_name, attempt, ?wait, error = %err, "attempt failed, retrying");
            }

            tokio::select! {
                _ = token.cancelled() => {
                    return Err(TaskGroupError::TaskCancelled(task_name.to_string()));
                }
                _ = sleep(wait) => {}
            }
        }

        Err(TaskGroupError::RetryFailed(format!(
            "task '{}' failed after {} attempts, last error: {}",
            task_name,
            max_attempts,
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let backoff = self.policy.interval.as_secs_f64() * self.policy.multiplier.powi(exponent);

        Duration::try_from_secs_f64(backoff)
            .unwrap_or(self.policy.max_interval)
            .min(self.policy.max_interval)
    }
}

/// Retries the wrapped task's `invoke` according to a [`RetryPolicy`].
pub struct RetryTask<T: TaskValue> {
    name: String,
    task: BoxTask<T>,
    executor: RetryExecutor,
}

impl<T: TaskValue> RetryTask<T> {
    pub fn new(name: impl Into<String>, task: BoxTask<T>, policy: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            task,
            executor: RetryExecutor::new(Some(policy)),
        }
    }
}

#[async_trait]
impl<T: TaskValue> TaskItem<T> for RetryTask<T> {
    fn result(&self) -> Option<T> {
        self.task.result()
    }

    fn prepare(&self, scope: &PrepareScope<'_, T>) -> Result<()> {
        self.task.prepare(scope)
    }

    fn is_hot(&self) -> bool {
        self.task.is_hot()
    }

    async fn invoke(&self, ctx: &InvocationContext) -> Result<T> {
        self.executor
            .execute_with_retry(ctx.cancellation_token(), &self.name, |_| self.task.invoke(ctx))
            .await
    }

    async fn invoke_after_post_run(&self, is_group_faulted: bool) -> Result<()> {
        self.task.invoke_after_post_run(is_group_faulted).await
    }
}
