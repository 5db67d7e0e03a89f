mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{Journal, Step, collect, init_tracing, step};
use futures::StreamExt;
use taskgroup::{
    FunctionalTask, InvocationContext, PrepareScope, Result, TaskGroup, TaskGroupError,
    TaskGroupOptions, TaskItem,
};

#[tokio::test(flavor = "multi_thread")]
async fn dependencies_finish_before_dependents_start() {
    init_tracing();
    let journal = Journal::default();
    let a = Step::new(&journal, "a").delay_ms(20).group();
    let b = Step::new(&journal, "b").delay_ms(5).group();
    let c = step(&journal, "c");
    let root = step(&journal, "root");

    c.add_dependency_task_group(&a).unwrap();
    c.add_dependency_task_group(&b).unwrap();
    root.add_dependency_task_group(&c).unwrap();
    root.add_dependency_task_group(&b).unwrap();

    let (keys, error) = collect(&root, &InvocationContext::new()).await;
    assert!(error.is_none(), "{error:?}");

    journal.assert_before("end:a", "start:c");
    journal.assert_before("end:b", "start:c");
    journal.assert_before("end:c", "start:root");
    for name in ["a", "b", "c", "root"] {
        assert_eq!(journal.count(&format!("start:{name}")), 1, "{name}");
    }

    // completion order, not declaration order
    assert_eq!(keys, vec!["b", "a", "c", "root"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn execute_returns_root_result() {
    let journal = Journal::default();
    let a = step(&journal, "a");
    let root = step(&journal, "root");
    root.add_dependency_task_group(&a).unwrap();

    let value = root.execute(&InvocationContext::new()).await.unwrap();
    assert_eq!(value, "root");
    assert_eq!(root.task_result("a").unwrap(), Some("a".to_string()));
    assert!(matches!(
        root.task_result("missing"),
        Err(TaskGroupError::TaskNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn cached_results_are_not_recomputed() {
    let journal = Journal::default();
    let a = step(&journal, "a");
    let root = step(&journal, "root");
    root.add_dependency_task_group(&a).unwrap();

    let ctx = InvocationContext::new();
    let (first, _) = collect(&root, &ctx).await;
    let (second, error) = collect(&root, &ctx).await;
    assert!(error.is_none());

    assert_eq!(first, vec!["a", "root"]);
    // the cached value of `a` is emitted again
    assert_eq!(second, vec!["a", "root"]);
    assert_eq!(journal.count("start:a"), 1);
    assert_eq!(journal.count("start:root"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn prepare_can_add_dependencies() {
    let journal = Journal::default();
    let late = step(&journal, "late");
    let later = step(&journal, "later");
    late.add_dependency_task_group(&later).unwrap();
    let root = Step::new(&journal, "root").prepare_dependency(&late).group();

    assert!(!root.contains("late"));
    let (keys, error) = collect(&root, &InvocationContext::new()).await;
    assert!(error.is_none(), "{error:?}");
    assert_eq!(keys, vec!["later", "late", "root"]);

    // tasks pulled in by one pass are prepared in the next
    journal.assert_before("prepare:root", "prepare:late");
    assert_eq!(journal.count("prepare:later"), 1);
    assert!(root.contains("later"));
}

#[tokio::test(flavor = "multi_thread")]
async fn cyclic_groups_are_rejected() {
    let journal = Journal::default();
    let a = step(&journal, "a");
    let b = step(&journal, "b");

    assert!(matches!(
        a.add_dependency_task_group(&a),
        Err(TaskGroupError::CircularDependency(_))
    ));

    a.add_dependency_task_group(&b).unwrap();
    match b.add_dependency_task_group(&a) {
        Err(TaskGroupError::CircularDependency(path)) => assert_eq!(path, "b -> a -> b"),
        other => panic!("expected a cycle, got {other:?}"),
    }

    // the rejected edge left both groups as they were
    assert!(b.graph().root().dependency_keys().is_empty());
    assert!(!a.graph().has_parents());
    assert_eq!(b.execute(&InvocationContext::new()).await.unwrap(), "b");
    assert_eq!(a.execute(&InvocationContext::new()).await.unwrap(), "a");
    journal.assert_before("end:b", "start:a");
}

/// Wires more groups while preparing, after its own group handle is gone.
struct Orphan {
    journal: Journal,
    dependency: TaskGroup<String>,
    dependent: TaskGroup<String>,
}

#[async_trait]
impl TaskItem<String> for Orphan {
    fn prepare(&self, scope: &PrepareScope<'_, String>) -> Result<()> {
        assert!(scope.owner().is_none());
        scope.add_dependency(&self.dependency)?;
        match scope.add_dependent(&self.dependent) {
            Err(TaskGroupError::InvalidState(_)) => self.journal.record("add_dependent:rejected"),
            other => self.journal.record(format!("add_dependent:{other:?}")),
        }
        Ok(())
    }

    async fn invoke(&self, _ctx: &InvocationContext) -> Result<String> {
        self.journal.record("start:orphan");
        Ok("orphan".to_string())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn tasks_of_dropped_groups_still_prepare_dependencies() {
    let journal = Journal::default();
    let late = Step::new(&journal, "late").delay_ms(10).group();
    let dependent = step(&journal, "dependent");
    let orphan: TaskGroup<String> = TaskGroup::new(
        "orphan",
        Arc::new(Orphan {
            journal: journal.clone(),
            dependency: late.clone(),
            dependent: dependent.clone(),
        }),
    );
    let root = step(&journal, "root");
    root.add_dependency_task_group(&orphan).unwrap();
    drop(orphan);

    let (keys, error) = collect(&root, &InvocationContext::new()).await;
    assert!(error.is_none(), "{error:?}");
    assert_eq!(keys, vec!["late", "orphan", "root"]);
    journal.assert_before("end:late", "start:orphan");
    assert_eq!(journal.count("add_dependent:rejected"), 1);
    assert!(!root.contains("dependent"));
}

#[tokio::test(flavor = "multi_thread")]
async fn merged_group_cannot_be_invoked_while_parent_runs() {
    let journal = Journal::default();
    let dependency = Step::new(&journal, "dependency").delay_ms(100).group();
    let root = step(&journal, "root");
    root.add_dependency_task_group(&dependency).unwrap();

    let stream = root.invoke(&InvocationContext::new()).unwrap();
    assert!(matches!(
        dependency.invoke(&InvocationContext::new()),
        Err(TaskGroupError::InvalidState(_))
    ));

    let results: Vec<_> = stream.collect().await;
    assert_eq!(results.len(), 2);

    // once settled the dependency may drive an invocation of its own again
    assert!(dependency.invoke(&InvocationContext::new()).is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn invoke_dependencies_skips_the_root() {
    let journal = Journal::default();
    let a = step(&journal, "a");
    let root = step(&journal, "root");
    root.add_dependency_task_group(&a).unwrap();

    let ctx = InvocationContext::new();
    let keys: Vec<String> = root
        .invoke_dependencies(&ctx)
        .unwrap()
        .map(|item| item.unwrap().key)
        .collect()
        .await;

    assert_eq!(keys, vec!["a"]);
    assert_eq!(journal.count("start:root"), 0);
    let skipped: Vec<String> = ctx
        .get_as(InvocationContext::KEY_SKIP_TASKS)
        .unwrap()
        .unwrap();
    assert_eq!(skipped, vec!["root"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn closure_tasks_join_as_dependencies() {
    let journal = Journal::default();
    let root = step(&journal, "root");
    let seen = journal.clone();
    let key = root
        .add_dependency_task(
            "closure",
            Arc::new(FunctionalTask::new(move |ctx: InvocationContext| {
                let seen = seen.clone();
                async move {
                    seen.record("start:closure");
                    ctx.put("from_closure", true);
                    Ok("closure".to_string())
                }
            })),
        )
        .unwrap();

    assert_eq!(key, "closure");
    assert!(root.contains("closure"));
    let ctx = InvocationContext::new();
    assert_eq!(root.execute(&ctx).await.unwrap(), "root");
    assert!(ctx.has_key("from_closure"));
    journal.assert_before("start:closure", "start:root");
}

struct Gauge {
    running: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl TaskItem<String> for Gauge {
    async fn invoke(&self, _ctx: &InvocationContext) -> Result<String> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        Ok("gauge".to_string())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn max_concurrency_bounds_running_tasks() {
    let gauge = Arc::new(Gauge {
        running: AtomicUsize::new(0),
        peak: AtomicUsize::new(0),
    });
    let options = TaskGroupOptions::default().max_concurrency(1);
    let journal = Journal::default();
    let root = Step::new(&journal, "root").group_with(options);
    for name in ["g1", "g2", "g3", "g4"] {
        root.add_dependency_task(name, gauge.clone()).unwrap();
    }

    root.execute(&InvocationContext::new()).await.unwrap();
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
}

struct Panics;

#[async_trait]
impl TaskItem<String> for Panics {
    async fn invoke(&self, _ctx: &InvocationContext) -> Result<String> {
        panic!("task body exploded");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn panicking_task_becomes_a_fault() {
    let journal = Journal::default();
    let root = step(&journal, "root");
    root.add_dependency_task("panics", Arc::new(Panics)).unwrap();

    let err = root.execute(&InvocationContext::new()).await.unwrap_err();
    match err {
        TaskGroupError::TaskExecution(message) => {
            assert!(message.contains("'panics' panicked: task body exploded"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(journal.count("start:root"), 0);
}

#[test]
fn dependency_tree_renders_each_branch() {
    let journal = Journal::default();
    let a = step(&journal, "a");
    let b = step(&journal, "b");
    let root = step(&journal, "root");
    b.add_dependency_task_group(&a).unwrap();
    root.add_dependency_task_group(&a).unwrap();
    root.add_dependency_task_group(&b).unwrap();

    assert_eq!(
        root.dependency_tree(),
        "root\n    └─> a\n    └─> b\n        └─> a\n"
    );
}
