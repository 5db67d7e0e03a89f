use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::{InvocationContext, Result, TaskGroup, TaskGroupError, TaskResult, TaskValue};

/// A unit of work scheduled by a [`TaskGroup`].
#[async_trait]
pub trait TaskItem<T: TaskValue = TaskResult>: Send + Sync {
    /// A result known before the group runs. When present the task is
    /// treated as already resolved and is not invoked (the root of the
    /// invoked group always runs).
    fn result(&self) -> Option<T> {
        None
    }

    /// Called once per invocation before any task runs. May wire further
    /// dependencies through `scope`; preparation repeats until no new
    /// tasks show up.
    fn prepare(&self, _scope: &PrepareScope<'_, T>) -> Result<()> {
        Ok(())
    }

    /// Whether calling [`TaskItem::invoke`] starts work right away rather
    /// than when the returned future is first polled.
    fn is_hot(&self) -> bool {
        false
    }

    async fn invoke(&self, ctx: &InvocationContext) -> Result<T>;

    /// Runs after the post-run dependents of this task's group settled.
    async fn invoke_after_post_run(&self, _is_group_faulted: bool) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutput<T> {
    pub key: String,
    pub value: T,
}

pub struct PrepareScope<'a, T: TaskValue> {
    key: &'a str,
    owner: Option<TaskGroup<T>>,
    preparer: &'a TaskGroup<T>,
}

impl<'a, T: TaskValue> PrepareScope<'a, T> {
    pub(crate) fn new(key: &'a str, owner: Option<TaskGroup<T>>, preparer: &'a TaskGroup<T>) -> Self {
        Self {
            key,
            owner,
            preparer,
        }
    }

    pub fn key(&self) -> &str {
        self.key
    }

    /// The group whose root is the task being prepared, if it is still alive.
    pub fn owner(&self) -> Option<&TaskGroup<T>> {
        self.owner.as_ref()
    }

    pub fn preparer(&self) -> &TaskGroup<T> {
        self.preparer
    }

    pub fn add_dependency(&self, dependency: &TaskGroup<T>) -> Result<()> {
        match &self.owner {
            Some(owner) => owner.add_dependency_task_group(dependency),
            None => self
                .preparer
                .graph()
                .merge_child_to_parent(self.key, &dependency.effective_graph()),
        }
    }

    pub fn add_dependent(&self, dependent: &TaskGroup<T>) -> Result<()> {
        self.require_owner()?.add_dependent_task_group(dependent)
    }

    /// Runs `dependent` after the task being prepared, within this invocation.
    pub fn add_post_run_dependent(&self, dependent: &TaskGroup<T>) -> Result<()> {
        self.require_owner()?.add_post_run_dependent_task_group(dependent)
    }

    fn require_owner(&self) -> Result<&TaskGroup<T>> {
        self.owner.as_ref().ok_or_else(|| {
            TaskGroupError::InvalidState(format!(
                "the task group owning '{}' is no longer available",
                self.key
            ))
        })
    }
}

pub struct FunctionalTask<T, F> {
    f: F,
    _output: PhantomData<fn() -> T>,
}

impl<T, F, Fut> FunctionalTask<T, F>
where
    T: TaskValue,
    F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _output: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> TaskItem<T> for FunctionalTask<T, F>
where
    T: TaskValue,
    F: Fn(InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    async fn invoke(&self, ctx: &InvocationContext) -> Result<T> {
        (self.f)(ctx.clone()).await
    }
}
