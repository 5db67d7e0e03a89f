pub mod context;
pub mod dag;
pub mod entry;
pub mod executor;
pub mod graph;
pub mod options;
mod proxy;
pub mod retry;
pub mod task;

pub use context::InvocationContext;
pub use dag::{DAGraph, DagNode, NodeStatus};
pub use entry::TaskGroupEntry;
pub use executor::{TaskGroup, TaskStream};
pub use graph::{DfsState, EdgeType, Graph, GraphId, GraphNode, Node, Visitor};
pub use options::{TaskGroupOptions, TerminateOnErrorStrategy};
pub use retry::{RetryExecutor, RetryPolicy, RetryTask};
pub use task::{FunctionalTask, PrepareScope, TaskItem, TaskOutput};

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub type TaskResult = HashMap<String, serde_json::Value>;
pub type BoxTask<T = TaskResult> = Arc<dyn TaskItem<T>>;
pub type Result<T, E = TaskGroupError> = std::result::Result<T, E>;

/// Values produced by tasks. They are cached on the graph and handed to
/// several consumers, hence `Clone + Send + Sync`.
pub trait TaskValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> TaskValue for T {}

#[derive(Error, Debug, Clone)]
pub enum TaskGroupError {
    #[error("Detected circular dependency: {0}")]
    CircularDependency(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Task not found: {0}")]
    TaskNotFound(String),
    #[error("Task execution failed: {0}")]
    TaskExecution(String),
    #[error("{0}")]
    Task(Arc<dyn std::error::Error + Send + Sync>),
    #[error("Task '{0}' was cancelled before it started")]
    TaskCancelled(String),
    #[error("Task '{0}' has one or more faulted dependencies")]
    DependencyFaulted(String),
    #[error("Retry failed: {0}")]
    RetryFailed(String),
    #[error("Invalid context value for '{key}': {message}")]
    ContextValue { key: String, message: String },
    #[error("{} tasks failed: {}", .0.len(), join_errors(.0))]
    Composite(Vec<TaskGroupError>),
}

impl TaskGroupError {
    /// Wraps an arbitrary error raised by a task body.
    pub fn task<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Task(Arc::new(err))
    }

    /// Whether this fault is reported to the caller. Cancellation and
    /// faulted-dependency signals only unblock the graph.
    pub fn is_surfaced(&self) -> bool {
        !matches!(self, Self::TaskCancelled(_) | Self::DependencyFaulted(_))
    }

    /// Folds the surfaced faults of one invocation into a single error.
    pub fn aggregate(mut errors: Vec<TaskGroupError>) -> Option<TaskGroupError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Composite(errors)),
        }
    }

    /// The individual errors, flattening a composite.
    pub fn errors(&self) -> Vec<&TaskGroupError> {
        match self {
            Self::Composite(inner) => inner.iter().flat_map(|e| e.errors()).collect(),
            other => vec![other],
        }
    }
}

fn join_errors(errors: &[TaskGroupError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
