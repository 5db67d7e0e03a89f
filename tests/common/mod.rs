#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use taskgroup::{
    InvocationContext, PrepareScope, Result, TaskGroup, TaskGroupError, TaskGroupOptions, TaskItem,
};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Ordered log of what the test tasks did.
#[derive(Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn record(&self, event: impl Into<String>) {
        self.events.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    /// Panics unless `first` was recorded before `second`.
    pub fn assert_before(&self, first: &str, second: &str) {
        let events = self.events();
        let a = events.iter().position(|e| e == first);
        let b = events.iter().position(|e| e == second);
        match (a, b) {
            (Some(a), Some(b)) => assert!(a < b, "{first} after {second}: {events:?}"),
            _ => panic!("missing {first} or {second}: {events:?}"),
        }
    }
}

/// Test task: records `start:<name>`, waits, then records `end:<name>` and
/// returns its name, or records `fail:<name>` and faults.
pub struct Step {
    pub name: String,
    pub journal: Journal,
    pub delay: Duration,
    pub fail: bool,
    pub extra_dependency: Option<TaskGroup<String>>,
    pub extra_post_run: Option<TaskGroup<String>>,
}

impl Step {
    pub fn new(journal: &Journal, name: &str) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            delay: Duration::ZERO,
            fail: false,
            extra_dependency: None,
            extra_post_run: None,
        }
    }

    pub fn delay_ms(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Adds `group` as a dependency while preparing.
    pub fn prepare_dependency(mut self, group: &TaskGroup<String>) -> Self {
        self.extra_dependency = Some(group.clone());
        self
    }

    /// Adds `group` as a post-run dependent while preparing.
    pub fn prepare_post_run(mut self, group: &TaskGroup<String>) -> Self {
        self.extra_post_run = Some(group.clone());
        self
    }

    pub fn group(self) -> TaskGroup<String> {
        self.group_with(TaskGroupOptions::default())
    }

    pub fn group_with(self, options: TaskGroupOptions) -> TaskGroup<String> {
        let name = self.name.clone();
        TaskGroup::with_options(name, Arc::new(self), options)
    }
}

#[async_trait]
impl TaskItem<String> for Step {
    fn prepare(&self, scope: &PrepareScope<'_, String>) -> Result<()> {
        self.journal.record(format!("prepare:{}", self.name));
        if let Some(group) = &self.extra_dependency {
            scope.add_dependency(group)?;
        }
        if let Some(group) = &self.extra_post_run {
            scope.add_post_run_dependent(group)?;
        }
        Ok(())
    }

    async fn invoke(&self, _ctx: &InvocationContext) -> Result<String> {
        self.journal.record(format!("start:{}", self.name));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            self.journal.record(format!("fail:{}", self.name));
            return Err(TaskGroupError::TaskExecution(format!("{} failed", self.name)));
        }
        self.journal.record(format!("end:{}", self.name));
        Ok(self.name.clone())
    }

    async fn invoke_after_post_run(&self, is_group_faulted: bool) -> Result<()> {
        self.journal
            .record(format!("after:{}:{}", self.name, is_group_faulted));
        Ok(())
    }
}

pub fn step(journal: &Journal, name: &str) -> TaskGroup<String> {
    Step::new(journal, name).group()
}

/// Drains a stream into the emitted keys and the final error, if any.
pub async fn collect(
    group: &TaskGroup<String>,
    ctx: &InvocationContext,
) -> (Vec<String>, Option<TaskGroupError>) {
    let mut stream = group.invoke(ctx).expect("invoke");
    let mut keys = Vec::new();
    let mut error = None;
    while let Some(item) = stream.next().await {
        match item {
            Ok(output) => keys.push(output.key),
            Err(err) => error = Some(err),
        }
    }
    (keys, error)
}
