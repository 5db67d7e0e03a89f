use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use taskgroup::*;
use tracing_subscriber::EnvFilter;

// A resource that takes a while to create and records what it depends on.
struct CreateResource {
    name: String,
    millis: u64,
}

#[async_trait]
impl TaskItem for CreateResource {
    async fn invoke(&self, ctx: &InvocationContext) -> Result<TaskResult> {
        println!("creating {}", self.name);
        tokio::time::sleep(Duration::from_millis(self.millis)).await;

        if let Some(group) = ctx.get("resource_group") {
            println!("  {} goes into {}", self.name, group);
        }

        let mut result = HashMap::new();
        result.insert("status".to_string(), serde_json::json!("created"));
        result.insert("name".to_string(), serde_json::json!(self.name));
        Ok(result)
    }
}

// Fails on its first call, so the retry decorator has something to do.
struct FlakyStorage {
    calls: AtomicU32,
}

#[async_trait]
impl TaskItem for FlakyStorage {
    async fn invoke(&self, _ctx: &InvocationContext) -> Result<TaskResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        println!("creating storage (call {call})");
        if call == 1 {
            return Err(TaskGroupError::TaskExecution(
                "storage endpoint not ready".to_string(),
            ));
        }
        let mut result = HashMap::new();
        result.insert("status".to_string(), serde_json::json!("created"));
        result.insert("name".to_string(), serde_json::json!("storage"));
        Ok(result)
    }
}

fn resource(name: &str, millis: u64) -> BoxTask {
    Arc::new(CreateResource {
        name: name.to_string(),
        millis,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let create_group: BoxTask = Arc::new(FunctionalTask::new(|ctx: InvocationContext| async move {
        println!("creating resource-group");
        ctx.put("resource_group", "rg-demo");
        let mut result = HashMap::new();
        result.insert("status".to_string(), serde_json::json!("created"));
        Ok(result)
    }));
    let resource_group = TaskGroup::new("resource-group", create_group);
    let network = TaskGroup::new("network", resource("network", 100));
    let flaky: BoxTask = Arc::new(FlakyStorage {
        calls: AtomicU32::new(0),
    });
    let policy = RetryPolicy {
        interval: Duration::from_millis(50),
        max_attempts: 3,
        ..Default::default()
    };
    let with_retry: BoxTask = Arc::new(RetryTask::new("storage", flaky, policy));
    let storage = TaskGroup::new("storage", with_retry);
    let vm = TaskGroup::new("virtual-machine", resource("virtual-machine", 150));

    network.add_dependency_task_group(&resource_group)?;
    storage.add_dependency_task_group(&resource_group)?;
    vm.add_dependency_task_group(&network)?;
    vm.add_dependency_task_group(&storage)?;
    vm.add_post_run_dependent_task("tags", resource("tags", 20))?;

    println!("=== dependency tree ===");
    print!("{}", vm.dependency_tree());

    println!("=== deploying ===");
    let start = std::time::Instant::now();
    let ctx = InvocationContext::new();
    let mut stream = vm.invoke(&ctx)?;
    while let Some(item) = stream.next().await {
        let output = item?;
        println!("done: {} -> {:?}", output.key, output.value.get("status"));
    }

    println!("=== finished in {:?} ===", start.elapsed());
    println!("virtual machine: {:?}", vm.task_result("virtual-machine")?);
    println!("tags: {:?}", vm.task_result("tags")?);

    Ok(())
}
