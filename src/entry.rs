use std::sync::{Arc, OnceLock, Weak};

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use parking_lot::Mutex;

use crate::executor::TaskGroupInner;
use crate::proxy::ProxyTaskItem;
use crate::{BoxTask, InvocationContext, PrepareScope, Result, TaskGroup, TaskGroupError, TaskValue};

pub(crate) enum EntryTask<T: TaskValue> {
    Task(BoxTask<T>),
    Proxy(ProxyTaskItem<T>),
}

/// Payload of every node in a task group's graph: the task plus what the
/// scheduler remembers about it.
pub struct TaskGroupEntry<T: TaskValue> {
    task: EntryTask<T>,
    result: Mutex<Option<T>>,
    group: Weak<TaskGroupInner<T>>,
    proxy_key: OnceLock<String>,
}

impl<T: TaskValue> TaskGroupEntry<T> {
    pub(crate) fn new(task: EntryTask<T>, group: Weak<TaskGroupInner<T>>) -> Self {
        Self {
            task,
            result: Mutex::new(None),
            group,
            proxy_key: OnceLock::new(),
        }
    }

    pub fn task_result(&self) -> Option<T> {
        match &self.task {
            EntryTask::Task(task) => self.result.lock().clone().or_else(|| task.result()),
            EntryTask::Proxy(proxy) => proxy.result(),
        }
    }

    pub fn has_cached_result(&self) -> bool {
        self.task_result().is_some()
    }

    pub(crate) fn store_result(&self, value: T) {
        *self.result.lock() = Some(value);
    }

    pub fn is_hot(&self) -> bool {
        match &self.task {
            EntryTask::Task(task) => task.is_hot(),
            EntryTask::Proxy(proxy) => proxy.is_hot(),
        }
    }

    pub fn is_proxy(&self) -> bool {
        matches!(self.task, EntryTask::Proxy(_))
    }

    pub(crate) fn task_item(&self) -> Option<&BoxTask<T>> {
        match &self.task {
            EntryTask::Task(task) => Some(task),
            EntryTask::Proxy(_) => None,
        }
    }

    pub(crate) fn proxy(&self) -> Option<&ProxyTaskItem<T>> {
        match &self.task {
            EntryTask::Proxy(proxy) => Some(proxy),
            EntryTask::Task(_) => None,
        }
    }

    /// Key of the proxy root shadowing this entry, if its group has post-run
    /// dependents.
    pub fn proxy_key(&self) -> Option<&str> {
        self.proxy_key.get().map(String::as_str)
    }

    pub(crate) fn set_proxy_key(&self, key: &str) -> Result<()> {
        self.proxy_key.set(key.to_string()).map_err(|_| {
            TaskGroupError::InvalidState(format!(
                "'{key}' cannot shadow a task already shadowed by '{}'",
                self.proxy_key().unwrap_or_default()
            ))
        })
    }

    pub(crate) fn owner(&self) -> Option<TaskGroup<T>> {
        self.group.upgrade().map(TaskGroup::from_inner)
    }

    pub(crate) fn prepare(&self, scope: &PrepareScope<'_, T>) -> Result<()> {
        match &self.task {
            EntryTask::Task(task) => task.prepare(scope),
            EntryTask::Proxy(_) => Ok(()),
        }
    }

    /// Invokes the task unless a dependency faulted or a cached result can be
    /// used instead. Hot tasks are only invoked once the returned future is
    /// first polled.
    pub(crate) fn invoke_task<'a>(
        &'a self,
        key: &str,
        has_faulted_dependencies: bool,
        ignore_cached_result: bool,
        ctx: &'a InvocationContext,
    ) -> BoxFuture<'a, Result<T>> {
        if has_faulted_dependencies {
            return future::ready(Err(TaskGroupError::DependencyFaulted(key.to_string()))).boxed();
        }
        if !ignore_cached_result {
            if let Some(cached) = self.task_result() {
                return future::ready(Ok(cached)).boxed();
            }
        }
        match &self.task {
            EntryTask::Task(task) if task.is_hot() => {
                let task = Arc::clone(task);
                async move { task.invoke(ctx).await }.boxed()
            }
            EntryTask::Task(task) => task.invoke(ctx),
            EntryTask::Proxy(proxy) => future::ready(proxy.invoke(key)).boxed(),
        }
    }
}
