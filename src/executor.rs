use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, trace, warn};

use crate::dag::{DAGraph, DagNode};
use crate::entry::{EntryTask, TaskGroupEntry};
use crate::proxy::{ProxyTaskGroupWrapper, ProxyTaskItem};
use crate::{
    BoxTask, InvocationContext, PrepareScope, Result, TaskGroupError, TaskGroupOptions, TaskOutput,
    TaskResult, TaskValue, TerminateOnErrorStrategy,
};

type EntryGraph<T> = DAGraph<TaskGroupEntry<T>>;
type EntryNode<T> = Arc<DagNode<TaskGroupEntry<T>>>;

pub(crate) struct TaskGroupInner<T: TaskValue> {
    graph: Arc<EntryGraph<T>>,
    proxy: ProxyTaskGroupWrapper<T>,
    options: TaskGroupOptions,
    cancellation: Mutex<CancellationToken>,
    owned: Mutex<Vec<TaskGroup<T>>>,
}

pub struct TaskGroup<T: TaskValue = TaskResult> {
    inner: Arc<TaskGroupInner<T>>,
}

impl<T: TaskValue> Clone for TaskGroup<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: TaskValue> TaskGroup<T> {
    pub fn new(id: impl Into<String>, task: BoxTask<T>) -> Self {
        Self::with_options(id, task, TaskGroupOptions::default())
    }

    pub fn with_options(id: impl Into<String>, task: BoxTask<T>, options: TaskGroupOptions) -> Self {
        Self::from_entry_task(id.into(), EntryTask::Task(task), options)
    }

    pub(crate) fn from_entry_task(
        id: String,
        task: EntryTask<T>,
        options: TaskGroupOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|group| TaskGroupInner {
            graph: DAGraph::new(id, TaskGroupEntry::new(task, group.clone())),
            proxy: ProxyTaskGroupWrapper::new(),
            options: options.normalized(),
            cancellation: Mutex::new(CancellationToken::new()),
            owned: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<TaskGroupInner<T>>) -> Self {
        Self { inner }
    }

    pub fn key(&self) -> &str {
        self.inner.graph.root().key()
    }

    pub fn options(&self) -> &TaskGroupOptions {
        &self.inner.options
    }

    pub fn graph(&self) -> &Arc<EntryGraph<T>> {
        &self.inner.graph
    }

    /// The graph an invocation of this group actually drives: the proxy's
    /// once post-run dependents exist, otherwise this group's own.
    pub(crate) fn effective_graph(&self) -> Arc<EntryGraph<T>> {
        match self.inner.proxy.task_group() {
            Some(proxy) => Arc::clone(proxy.graph()),
            None => Arc::clone(&self.inner.graph),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.effective_graph().graph().contains(key)
    }

    pub fn is_cancelled(&self) -> bool {
        if let Some(proxy) = self.inner.proxy.task_group() {
            if proxy.is_cancelled() {
                return true;
            }
        }
        self.inner.cancellation.lock().is_cancelled()
    }

    pub fn task_result(&self, id: &str) -> Result<Option<T>> {
        if let Some(node) = self.graph().node(id) {
            return Ok(node.data().task_result());
        }
        match self.inner.proxy.task_group() {
            Some(proxy) => proxy
                .graph()
                .node(id)
                .map(|node| node.data().task_result())
                .ok_or_else(|| {
                    TaskGroupError::TaskNotFound(format!(
                        "dependency or post-run dependent task '{id}'"
                    ))
                }),
            None => Err(TaskGroupError::TaskNotFound(format!(
                "dependency task '{id}'"
            ))),
        }
    }

    pub fn dependency_tree(&self) -> String {
        self.effective_graph().render_tree()
    }

    pub fn add_dependency_task_group(&self, dependency: &TaskGroup<T>) -> Result<()> {
        if dependency.inner.proxy.is_active() {
            dependency.inner.proxy.add_dependent_task_group(self)
        } else {
            self.graph().add_dependency_graph(dependency.graph())
        }
    }

    /// Makes `dependent` wait for this group. Invoking this group does not
    /// run `dependent`.
    pub fn add_dependent_task_group(&self, dependent: &TaskGroup<T>) -> Result<()> {
        dependent.add_dependency_task_group(self)
    }

    /// Makes `dependent` wait for this group and run as part of every
    /// invocation of this group.
    pub fn add_post_run_dependent_task_group(&self, dependent: &TaskGroup<T>) -> Result<()> {
        self.inner.proxy.add_post_run_task_group(self, dependent)
    }

    pub fn add_dependency_task(&self, id: impl Into<String>, task: BoxTask<T>) -> Result<String> {
        let group = TaskGroup::with_options(id, task, self.options().clone());
        self.add_dependency_task_group(&group)?;
        Ok(self.keep(group))
    }

    pub fn add_post_run_dependent_task(
        &self,
        id: impl Into<String>,
        task: BoxTask<T>,
    ) -> Result<String> {
        let group = TaskGroup::with_options(id, task, self.options().clone());
        self.add_post_run_dependent_task_group(&group)?;
        Ok(self.keep(group))
    }

    fn keep(&self, group: TaskGroup<T>) -> String {
        let key = group.key().to_string();
        self.inner.owned.lock().push(group);
        key
    }

    /// Prepares and runs every task of this group (and its post-run
    /// dependents). The stream yields task results in completion order and
    /// ends with the aggregated error if any task faulted.
    pub fn invoke(&self, ctx: &InvocationContext) -> Result<TaskStream<T>> {
        if let Some(proxy) = self.inner.proxy.task_group() {
            return proxy.invoke_intern(ctx, true, HashSet::new());
        }
        self.ensure_preparer()?;
        let prepared = self.prepare_tasks(HashSet::new())?;
        if let Some(proxy) = self.inner.proxy.task_group() {
            // preparation registered post-run dependents
            return proxy.invoke_intern(ctx, true, prepared);
        }
        self.invoke_intern(ctx, false, HashSet::new())
    }

    /// Runs only the dependencies of this group; the root task re-emits its
    /// cached result, if any, instead of running.
    pub fn invoke_dependencies(&self, ctx: &InvocationContext) -> Result<TaskStream<T>> {
        self.ensure_no_proxy()?;
        self.ensure_preparer()?;
        ctx.add_skip_task(self.key());
        self.prepare_tasks(HashSet::new())?;
        self.ensure_no_proxy()?;
        self.invoke_intern(ctx, false, HashSet::new())
    }

    pub async fn execute(&self, ctx: &InvocationContext) -> Result<T> {
        let mut stream = self.invoke(ctx)?;
        let mut root_value = None;
        while let Some(item) = stream.next().await {
            let output = item?;
            if output.key == self.key() {
                root_value = Some(output.value);
            }
        }
        match root_value {
            Some(value) => Ok(value),
            None if self.is_cancelled() => Err(TaskGroupError::TaskCancelled(self.key().to_string())),
            None => Err(TaskGroupError::InvalidState(format!(
                "task group '{}' finished without a result",
                self.key()
            ))),
        }
    }

    fn ensure_preparer(&self) -> Result<()> {
        if self.graph().is_preparer() {
            Ok(())
        } else {
            Err(TaskGroupError::InvalidState(format!(
                "task group '{}' is a dependency of another group and cannot be invoked on its own",
                self.key()
            )))
        }
    }

    fn ensure_no_proxy(&self) -> Result<()> {
        if self.inner.proxy.is_active() {
            return Err(TaskGroupError::InvalidState(format!(
                "task group '{}' has post-run dependents; invoking only its dependencies is not supported",
                self.key()
            )));
        }
        Ok(())
    }

    fn invoke_intern(
        &self,
        ctx: &InvocationContext,
        run_prepare: bool,
        prepared: HashSet<String>,
    ) -> Result<TaskStream<T>> {
        self.ensure_preparer()?;
        if run_prepare {
            self.prepare_tasks(prepared)?;
        }
        self.graph().prepare()?;

        let cancellation = ctx.cancellation_token().child_token();
        *self.inner.cancellation.lock() = cancellation.clone();

        let invocation = Arc::new(Invocation {
            group: self.clone(),
            ctx: ctx.clone(),
            cancellation,
            permits: Semaphore::new(self.options().max_concurrency),
            skip: ctx.skip_tasks()?,
        });
        debug!(
            group = %self.key(),
            tasks = self.graph().graph().len(),
            strategy = ?self.options().terminate_on_error,
            "invoking task group"
        );
        trace!(tree = %self.graph().render_tree(), "dependency tree");

        let (tx, rx) = mpsc::unbounded_channel();
        let span = debug_span!("task_group", group = %self.key());
        tokio::spawn(invocation.drive(tx).instrument(span));
        Ok(TaskStream { rx })
    }

    // repeats until preparing stops adding tasks
    fn prepare_tasks(&self, mut prepared: HashSet<String>) -> Result<HashSet<String>> {
        let mut entries = self.entries()?;
        loop {
            for node in &entries {
                if !prepared.insert(node.key().to_string()) {
                    continue;
                }
                let entry = node.data();
                entry.prepare(&PrepareScope::new(node.key(), entry.owner(), self))?;
            }
            let known = entries.len();
            entries = self.entries()?;
            if entries.len() <= known {
                break;
            }
            trace!(group = %self.key(), tasks = entries.len(), "preparation added tasks");
        }
        self.graph().prepare()?;
        Ok(prepared)
    }

    fn entries(&self) -> Result<Vec<EntryNode<T>>> {
        let graph = self.graph();
        graph.prepare()?;
        let mut entries = Vec::with_capacity(graph.graph().len());
        while let Some(node) = graph.get_next() {
            graph.report_completion(&node)?;
            entries.push(node);
        }
        Ok(entries)
    }
}

impl<T: TaskValue> std::fmt::Debug for TaskGroup<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("key", &self.key())
            .field("tasks", &self.graph().graph().keys())
            .field("proxied", &self.inner.proxy.is_active())
            .finish()
    }
}

pub struct TaskStream<T> {
    rx: mpsc::UnboundedReceiver<Result<TaskOutput<T>>>,
}

impl<T> Stream for TaskStream<T> {
    type Item = Result<TaskOutput<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct Invocation<T: TaskValue> {
    group: TaskGroup<T>,
    ctx: InvocationContext,
    cancellation: CancellationToken,
    permits: Semaphore,
    skip: HashSet<String>,
}

struct Settled<T> {
    key: String,
    is_root: bool,
    // proxy roots republish a value that was already emitted
    publish: bool,
    outcome: Result<Option<T>>,
}

impl<T: TaskValue> Invocation<T> {
    fn graph(&self) -> &Arc<EntryGraph<T>> {
        self.group.graph()
    }

    async fn drive(self: Arc<Self>, out: mpsc::UnboundedSender<Result<TaskOutput<T>>>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut in_flight = self.dispatch_ready(&done_tx);
        let mut errors = Vec::new();

        while in_flight > 0 {
            let Some(settled) = done_rx.recv().await else {
                break;
            };
            in_flight -= 1;
            match settled.outcome {
                Ok(Some(value)) if settled.publish => {
                    let _ = out.send(Ok(TaskOutput {
                        key: settled.key,
                        value,
                    }));
                }
                Ok(_) => {}
                Err(err) if err.is_surfaced() => {
                    warn!(task = %settled.key, error = %err, "task faulted");
                    errors.push(err);
                }
                Err(err) => debug!(task = %settled.key, reason = %err, "task did not run"),
            }
            if !settled.is_root {
                in_flight += self.dispatch_ready(&done_tx);
            }
        }

        debug!(faults = errors.len(), "task group settled");
        if let Some(err) = TaskGroupError::aggregate(errors) {
            let _ = out.send(Err(err));
        }
    }

    fn dispatch_ready(self: &Arc<Self>, done: &mpsc::UnboundedSender<Settled<T>>) -> usize {
        let mut launched = 0;
        while let Some(node) = self.graph().get_next() {
            trace!(task = %node.key(), "dispatching");
            let invocation = Arc::clone(self);
            let done = done.clone();
            tokio::spawn(
                async move {
                    let outcome = invocation.run(&node).await;
                    let _ = done.send(Settled {
                        key: node.key().to_string(),
                        is_root: invocation.graph().is_root_node(&node),
                        publish: !node.data().is_proxy(),
                        outcome,
                    });
                }
                .in_current_span(),
            );
            launched += 1;
        }
        launched
    }

    async fn run(&self, node: &EntryNode<T>) -> Result<Option<T>> {
        let permit = self.permits.acquire().await;
        let outcome = match &permit {
            Ok(_) => AssertUnwindSafe(self.run_entry(node))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(TaskGroupError::TaskExecution(format!(
                        "task '{}' panicked: {}",
                        node.key(),
                        panic_message(&*panic)
                    )))
                }),
            Err(_) => Err(TaskGroupError::InvalidState(
                "the concurrency limiter was closed".to_string(),
            )),
        };
        // the permit outlives settle so a cancellation is seen by the next task
        let settled = self.settle(node, outcome);
        drop(permit);
        settled
    }

    async fn run_entry(&self, node: &EntryNode<T>) -> Result<Option<T>> {
        match node.data().proxy() {
            Some(proxy) => self.run_proxy(node, proxy).await,
            None => self.run_task(node).await,
        }
    }

    async fn run_task(&self, node: &EntryNode<T>) -> Result<Option<T>> {
        let key = node.key();
        let entry = node.data();
        if self.cancellation.is_cancelled() {
            return Err(TaskGroupError::TaskCancelled(key.to_string()));
        }
        if self.skip.contains(key) {
            debug!(task = %key, "skipping task");
            return Ok(entry.task_result());
        }

        let root_key = self.graph().root().key();
        let ignore_cached_result = key == root_key || entry.proxy_key() == Some(root_key);
        debug!(task = %key, hot = entry.is_hot(), "invoking task");
        let value = entry
            .invoke_task(
                key,
                node.has_faulted_dependencies(),
                ignore_cached_result,
                &self.ctx,
            )
            .await?;
        Ok(Some(value))
    }

    async fn run_proxy(&self, node: &EntryNode<T>, proxy: &ProxyTaskItem<T>) -> Result<Option<T>> {
        let key = node.key();
        let faulted_dependencies = node.has_faulted_dependencies();
        let cancelled = self.cancellation.is_cancelled();
        proxy
            .invoke_after_post_run(faulted_dependencies || cancelled)
            .await?;
        if faulted_dependencies {
            return Err(TaskGroupError::DependencyFaulted(key.to_string()));
        }
        if cancelled {
            return Err(TaskGroupError::TaskCancelled(key.to_string()));
        }
        proxy.invoke(key).map(Some)
    }

    fn settle(&self, node: &EntryNode<T>, outcome: Result<Option<T>>) -> Result<Option<T>> {
        match outcome {
            Ok(value) => {
                if let Some(value) = &value {
                    if !node.data().is_proxy() {
                        node.data().store_result(value.clone());
                    }
                }
                self.graph().report_completion(node)?;
                debug!(task = %node.key(), "task completed");
                Ok(value)
            }
            Err(err) => {
                if self.group.options().terminate_on_error
                    == TerminateOnErrorStrategy::TerminateOnInProgressTasksCompletion
                    && !self.cancellation.is_cancelled()
                {
                    debug!(task = %node.key(), "cancelling tasks that have not started");
                    self.cancellation.cancel();
                }
                self.graph().report_error(node, &err)?;
                Err(err)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
