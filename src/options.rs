use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

const DEFAULT_MAX_CONCURRENCY: usize = 1024;

/// How a task group reacts to a faulted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminateOnErrorStrategy {
    /// Tasks already running finish; tasks not started yet are cancelled.
    #[default]
    TerminateOnInProgressTasksCompletion,
    /// Independent branches keep running; the fault surfaces once it reaches
    /// the lowest common ancestor, normally the root.
    TerminateOnHittingLcaTask,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskGroupOptions {
    pub terminate_on_error: TerminateOnErrorStrategy,
    pub max_concurrency: usize,
}

impl Default for TaskGroupOptions {
    fn default() -> Self {
        Self {
            terminate_on_error: TerminateOnErrorStrategy::default(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

impl TaskGroupOptions {
    pub fn with_strategy(strategy: TerminateOnErrorStrategy) -> Self {
        Self {
            terminate_on_error: strategy,
            ..Self::default()
        }
    }

    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self.normalized()
    }

    pub(crate) fn normalized(mut self) -> Self {
        if self.max_concurrency == 0 {
            self.max_concurrency = DEFAULT_MAX_CONCURRENCY;
        }
        self.max_concurrency = self.max_concurrency.min(Semaphore::MAX_PERMITS);
        self
    }
}
