use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::dag::DagNode;
use crate::entry::EntryTask;
use crate::{Result, TaskGroup, TaskGroupEntry, TaskGroupError, TaskValue};

/// Root task of a shadow group.
pub(crate) struct ProxyTaskItem<T: TaskValue> {
    actual_root: Arc<DagNode<TaskGroupEntry<T>>>,
}

impl<T: TaskValue> ProxyTaskItem<T> {
    fn new(actual_root: Arc<DagNode<TaskGroupEntry<T>>>) -> Self {
        Self { actual_root }
    }

    pub(crate) fn result(&self) -> Option<T> {
        self.actual_root.data().task_result()
    }

    pub(crate) fn is_hot(&self) -> bool {
        self.actual_root.data().is_hot()
    }

    pub(crate) fn invoke(&self, key: &str) -> Result<T> {
        self.result().ok_or_else(|| {
            TaskGroupError::InvalidState(format!(
                "'{key}' has no result to republish from '{}'",
                self.actual_root.key()
            ))
        })
    }

    pub(crate) async fn invoke_after_post_run(&self, is_group_faulted: bool) -> Result<()> {
        match self.actual_root.data().task_item() {
            Some(task) => task.invoke_after_post_run(is_group_faulted).await,
            None => Ok(()),
        }
    }
}

pub(crate) struct ProxyTaskGroupWrapper<T: TaskValue> {
    proxy: Mutex<Option<TaskGroup<T>>>,
}

impl<T: TaskValue> ProxyTaskGroupWrapper<T> {
    pub(crate) fn new() -> Self {
        Self {
            proxy: Mutex::new(None),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.proxy.lock().is_some()
    }

    pub(crate) fn task_group(&self) -> Option<TaskGroup<T>> {
        self.proxy.lock().clone()
    }

    pub(crate) fn add_post_run_task_group(
        &self,
        actual: &TaskGroup<T>,
        post_run: &TaskGroup<T>,
    ) -> Result<()> {
        let proxy = self.activate(actual)?;
        post_run.graph().add_dependency_graph(actual.graph())?;
        proxy
            .graph()
            .add_dependency_graph(&post_run.effective_graph())
    }

    pub(crate) fn add_dependent_task_group(&self, dependent: &TaskGroup<T>) -> Result<()> {
        let proxy = self.task_group().ok_or_else(|| {
            TaskGroupError::InvalidState(
                "a dependent cannot be attached to an inactive proxy task group".to_string(),
            )
        })?;
        dependent.graph().add_dependency_graph(proxy.graph())
    }

    fn activate(&self, actual: &TaskGroup<T>) -> Result<TaskGroup<T>> {
        let mut slot = self.proxy.lock();
        if let Some(proxy) = slot.as_ref() {
            return Ok(proxy.clone());
        }

        let item = ProxyTaskItem::new(Arc::clone(actual.graph().root()));
        let proxy = TaskGroup::from_entry_task(
            format!("proxy-{}", actual.key()),
            EntryTask::Proxy(item),
            actual.options().clone(),
        );

        actual.graph().root().data().set_proxy_key(proxy.key())?;
        // groups that depended on the actual group now depend on the proxy
        for parent in actual.graph().take_parents() {
            parent.root().remove_dependency(actual.key());
            parent.add_dependency_graph(proxy.graph())?;
        }
        proxy.graph().add_dependency_graph(actual.graph())?;

        debug!(group = %actual.key(), proxy = %proxy.key(), "activated proxy task group");
        *slot = Some(proxy.clone());
        Ok(proxy)
    }
}
