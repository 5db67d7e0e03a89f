use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::graph::{DfsState, EdgeType, Graph, GraphId, GraphNode, Node, Visitor};
use crate::{Result, TaskGroupError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Faulted,
}

#[derive(Debug)]
struct Resolution {
    to_be_resolved: usize,
    faults: HashMap<String, TaskGroupError>,
    status: NodeStatus,
}

pub struct DagNode<D> {
    node: Node<D>,
    dependent_keys: Mutex<Vec<String>>,
    resolution: Mutex<Resolution>,
    preparer: AtomicBool,
}

impl<D> DagNode<D> {
    pub fn new(key: impl Into<String>, data: D) -> Self {
        Self {
            node: Node::new(key, data),
            dependent_keys: Mutex::new(Vec::new()),
            resolution: Mutex::new(Resolution {
                to_be_resolved: 0,
                faults: HashMap::new(),
                status: NodeStatus::Pending,
            }),
            preparer: AtomicBool::new(false),
        }
    }

    pub fn dependency_keys(&self) -> Vec<String> {
        self.node.children()
    }

    pub fn add_dependency(&self, key: &str) -> bool {
        self.node.add_child(key)
    }

    pub fn remove_dependency(&self, key: &str) -> bool {
        self.node.remove_child(key)
    }

    pub fn has_dependencies(&self) -> bool {
        self.node.has_children()
    }

    pub fn dependent_keys(&self) -> Vec<String> {
        self.dependent_keys.lock().clone()
    }

    fn add_dependent(&self, key: &str) {
        let mut dependents = self.dependent_keys.lock();
        if !dependents.iter().any(|d| d == key) {
            dependents.push(key.to_string());
        }
    }

    pub fn is_preparer(&self) -> bool {
        self.preparer.load(Ordering::Acquire)
    }

    pub fn set_preparer(&self, preparer: bool) {
        self.preparer.store(preparer, Ordering::Release);
    }

    pub fn status(&self) -> NodeStatus {
        self.resolution.lock().status
    }

    pub fn has_all_resolved(&self) -> bool {
        self.resolution.lock().to_be_resolved == 0
    }

    pub fn has_faulted_dependencies(&self) -> bool {
        !self.resolution.lock().faults.is_empty()
    }

    pub fn faulted_dependencies(&self) -> Vec<(String, TaskGroupError)> {
        let mut faults: Vec<_> = self
            .resolution
            .lock()
            .faults
            .iter()
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect();
        faults.sort_by(|a, b| a.0.cmp(&b.0));
        faults
    }

    fn initialize(&self) {
        let dependencies = self.node.children().len();
        {
            let mut resolution = self.resolution.lock();
            resolution.to_be_resolved = dependencies;
            resolution.faults.clear();
            resolution.status = NodeStatus::Pending;
        }
        self.dependent_keys.lock().clear();
    }

    fn set_status(&self, status: NodeStatus) {
        self.resolution.lock().status = status;
    }
}

impl<D> Deref for DagNode<D> {
    type Target = Node<D>;

    fn deref(&self) -> &Node<D> {
        &self.node
    }
}

impl<D: Send + Sync> GraphNode for DagNode<D> {
    fn key(&self) -> &str {
        self.node.key()
    }

    fn children(&self) -> Vec<String> {
        self.node.children()
    }

    fn owner(&self) -> Option<GraphId> {
        self.node.owner()
    }

    fn set_owner(&self, owner: GraphId) -> Result<()> {
        self.node.set_owner(owner)
    }
}

pub struct DAGraph<D> {
    graph: Graph<DagNode<D>>,
    root: Arc<DagNode<D>>,
    parents: Mutex<Vec<Arc<DAGraph<D>>>>,
    queue: Mutex<VecDeque<String>>,
}

impl<D: Send + Sync + 'static> DAGraph<D> {
    pub fn new(root_key: impl Into<String>, data: D) -> Arc<Self> {
        let graph = Graph::new();
        let root = Arc::new(DagNode::new(root_key, data));
        root.set_preparer(true);
        graph.adopt(Arc::clone(&root));
        Arc::new(Self {
            graph,
            root,
            parents: Mutex::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    pub fn id(&self) -> GraphId {
        self.graph.id()
    }

    pub fn root(&self) -> &Arc<DagNode<D>> {
        &self.root
    }

    pub fn graph(&self) -> &Graph<DagNode<D>> {
        &self.graph
    }

    pub fn node(&self, key: &str) -> Option<Arc<DagNode<D>>> {
        self.graph.node(key)
    }

    pub fn add_node(&self, node: Arc<DagNode<D>>) -> Result<()> {
        self.graph.add_node(node)
    }

    pub fn is_root_node(&self, node: &DagNode<D>) -> bool {
        self.root.key() == node.key()
    }

    pub fn has_parents(&self) -> bool {
        !self.parents.lock().is_empty()
    }

    pub fn is_preparer(&self) -> bool {
        self.root.is_preparer()
    }

    pub(crate) fn take_parents(&self) -> Vec<Arc<DAGraph<D>>> {
        std::mem::take(&mut *self.parents.lock())
    }

    pub fn add_dependency_graph(self: &Arc<Self>, dependency: &Arc<DAGraph<D>>) -> Result<()> {
        self.ensure_no_cycle(self.root.key(), dependency)?;
        self.root.add_dependency(dependency.root.key());
        self.absorb(dependency);
        if self.has_parents() {
            self.bubble_up_node_table(&mut Vec::new())?;
        }
        Ok(())
    }

    pub fn add_dependent_graph(self: &Arc<Self>, dependent: &Arc<DAGraph<D>>) -> Result<()> {
        dependent.add_dependency_graph(self)
    }

    /// Like [`Self::add_dependency_graph`] for a node other than the root.
    pub fn merge_child_to_parent(
        self: &Arc<Self>,
        parent_key: &str,
        child: &Arc<DAGraph<D>>,
    ) -> Result<()> {
        if parent_key == self.root.key() {
            return self.add_dependency_graph(child);
        }
        let parent = self
            .node(parent_key)
            .ok_or_else(|| TaskGroupError::TaskNotFound(parent_key.to_string()))?;
        self.ensure_no_cycle(parent_key, child)?;
        parent.add_dependency(child.root.key());
        self.absorb(child);
        if self.has_parents() {
            self.bubble_up_node_table(&mut Vec::new())?;
        }
        Ok(())
    }

    // an edge from -> dependency closes a loop iff dependency already reaches from
    fn ensure_no_cycle(&self, from: &str, dependency: &DAGraph<D>) -> Result<()> {
        let lookup = |key: &str| dependency.node(key).or_else(|| self.node(key));
        let mut path = vec![from.to_string()];
        let mut seen = HashSet::new();
        if reaches(&lookup, dependency.root.key(), from, &mut path, &mut seen) {
            return Err(TaskGroupError::CircularDependency(path.join(" -> ")));
        }
        Ok(())
    }

    fn absorb(self: &Arc<Self>, dependency: &Arc<DAGraph<D>>) {
        let added = merge(&dependency.graph, &self.graph);
        let mut parents = dependency.parents.lock();
        if !parents.iter().any(|p| Arc::ptr_eq(p, self)) {
            parents.push(Arc::clone(self));
        }
        trace!(
            graph = %self.root.key(),
            dependency = %dependency.root.key(),
            added,
            "merged dependency graph"
        );
    }

    fn bubble_up_node_table(self: &Arc<Self>, path: &mut Vec<String>) -> Result<()> {
        let key = self.root.key().to_string();
        if path.contains(&key) {
            path.push(key);
            return Err(TaskGroupError::CircularDependency(path.join(" -> ")));
        }
        path.push(key);
        let parents = self.parents.lock().clone();
        for parent in parents {
            merge(&self.graph, &parent.graph);
            parent.bubble_up_node_table(path)?;
        }
        path.pop();
        Ok(())
    }

    /// Computes dependents and seeds the ready queue. A no-op unless this
    /// graph is the preparer.
    pub fn prepare(&self) -> Result<()> {
        if !self.is_preparer() {
            trace!(graph = %self.root.key(), "skipping prepare, not the preparer");
            return Ok(());
        }
        for node in self.graph.nodes() {
            node.initialize();
            if !self.is_root_node(&node) {
                node.set_preparer(false);
            }
        }
        self.initialize_dependent_keys()?;
        self.initialize_queue()
    }

    fn initialize_dependent_keys(&self) -> Result<()> {
        self.graph.visit(&mut DependentKeys { graph: &self.graph })
    }

    fn initialize_queue(&self) -> Result<()> {
        self.queue.lock().clear();
        let mut ready: Vec<Arc<DagNode<D>>> = self
            .graph
            .nodes()
            .into_iter()
            .filter(|n| !n.has_dependencies())
            .collect();
        if ready.is_empty() {
            return Err(TaskGroupError::CircularDependency(format!(
                "every task in the group of '{}' waits on another task",
                self.root.key()
            )));
        }
        ready.sort_by(|a, b| a.key().cmp(b.key()));
        for node in &ready {
            node.set_status(NodeStatus::Ready);
        }
        let mut queue = self.queue.lock();
        queue.extend(ready.iter().map(|node| node.key().to_string()));
        trace!(graph = %self.root.key(), ready = queue.len(), "ready queue seeded");
        Ok(())
    }

    /// Pops the next ready node. `None` means nothing is ready right now,
    /// which is not the same as nothing left to run.
    pub fn get_next(&self) -> Option<Arc<DagNode<D>>> {
        loop {
            let key = self.queue.lock().pop_front()?;
            if let Some(node) = self.graph.node(&key) {
                node.set_status(NodeStatus::Running);
                return Some(node);
            }
        }
    }

    pub fn ready_keys(&self) -> Vec<String> {
        self.queue.lock().iter().cloned().collect()
    }

    pub fn report_completion(&self, completed: &DagNode<D>) -> Result<()> {
        completed.set_preparer(true);
        completed.set_status(NodeStatus::Succeeded);
        self.release_dependents(completed, None)
    }

    pub fn report_error(&self, faulted: &DagNode<D>, cause: &TaskGroupError) -> Result<()> {
        faulted.set_preparer(true);
        faulted.set_status(NodeStatus::Faulted);
        self.release_dependents(faulted, Some(cause))
    }

    fn release_dependents(
        &self,
        dependency: &DagNode<D>,
        fault: Option<&TaskGroupError>,
    ) -> Result<()> {
        let dependency_key = dependency.key();
        for dependent_key in dependency.dependent_keys() {
            let dependent = self
                .graph
                .node(&dependent_key)
                .ok_or_else(|| TaskGroupError::TaskNotFound(dependent_key.clone()))?;

            // check-and-enqueue under the dependent's own lock
            let mut resolution = dependent.resolution.lock();
            if resolution.to_be_resolved == 0 {
                return Err(TaskGroupError::InvalidState(format!(
                    "{dependent_key}: the dependency '{dependency_key}' is already reported or there is no such dependency"
                )));
            }
            resolution.to_be_resolved -= 1;
            if let Some(cause) = fault {
                resolution
                    .faults
                    .insert(dependency_key.to_string(), cause.clone());
            }
            if resolution.to_be_resolved == 0 {
                resolution.status = NodeStatus::Ready;
                self.queue.lock().push_back(dependent_key);
            }
        }
        Ok(())
    }

    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        self.render_node(self.root.key(), "", &mut out, &mut Vec::new());
        out
    }

    fn render_node(&self, key: &str, prefix: &str, out: &mut String, path: &mut Vec<String>) {
        if prefix.is_empty() {
            out.push_str(key);
        } else {
            out.push_str(&format!("{prefix}└─> {key}"));
        }
        if path.iter().any(|p| p == key) {
            out.push_str(" (cycle)\n");
            return;
        }
        out.push('\n');
        let Some(node) = self.graph.node(key) else {
            return;
        };
        path.push(key.to_string());
        let mut dependencies = node.dependency_keys();
        dependencies.sort();
        let child_prefix = format!("{prefix}    ");
        for dependency in dependencies {
            self.render_node(&dependency, &child_prefix, out, path);
        }
        path.pop();
    }
}

fn reaches<D>(
    lookup: &impl Fn(&str) -> Option<Arc<DagNode<D>>>,
    current: &str,
    target: &str,
    path: &mut Vec<String>,
    seen: &mut HashSet<String>,
) -> bool {
    path.push(current.to_string());
    if current == target {
        return true;
    }
    if seen.insert(current.to_string()) {
        if let Some(node) = lookup(current) {
            for next in node.dependency_keys() {
                if reaches(lookup, &next, target, path, seen) {
                    return true;
                }
            }
        }
    }
    path.pop();
    false
}

fn merge<D: Send + Sync>(source: &Graph<DagNode<D>>, target: &Graph<DagNode<D>>) -> usize {
    source
        .nodes()
        .iter()
        .filter(|node| target.share(node))
        .count()
}

struct DependentKeys<'a, D> {
    graph: &'a Graph<DagNode<D>>,
}

impl<D: Send + Sync> Visitor<DagNode<D>> for DependentKeys<'_, D> {
    fn visit_node(&mut self, node: &Arc<DagNode<D>>) -> Result<()> {
        for dependency_key in node.dependency_keys() {
            let dependency = self.graph.node(&dependency_key).ok_or_else(|| {
                TaskGroupError::TaskNotFound(format!(
                    "'{dependency_key}' (dependency of '{}')",
                    node.key()
                ))
            })?;
            dependency.add_dependent(node.key());
        }
        Ok(())
    }

    fn visit_edge(&mut self, from: &str, to: &str, edge: EdgeType, dfs: &DfsState) -> Result<()> {
        if edge == EdgeType::Back {
            return Err(TaskGroupError::CircularDependency(format!(
                "{} -> {to}",
                dfs.find_path(to, from)
            )));
        }
        Ok(())
    }
}
