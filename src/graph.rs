use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use crate::{Result, TaskGroupError};

pub type GraphId = u64;

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

pub trait GraphNode: Send + Sync {
    fn key(&self) -> &str;

    fn children(&self) -> Vec<String>;

    /// Owner of the node. Assigned once, a second assignment is an error.
    fn owner(&self) -> Option<GraphId>;

    fn set_owner(&self, owner: GraphId) -> Result<()>;
}

pub struct Node<D> {
    key: String,
    data: D,
    children: RwLock<Vec<String>>,
    owner: OnceLock<GraphId>,
}

impl<D> Node<D> {
    pub fn new(key: impl Into<String>, data: D) -> Self {
        Self {
            key: key.into(),
            data,
            children: RwLock::new(Vec::new()),
            owner: OnceLock::new(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn data(&self) -> &D {
        &self.data
    }

    pub fn children(&self) -> Vec<String> {
        self.children.read().clone()
    }

    pub fn has_children(&self) -> bool {
        !self.children.read().is_empty()
    }

    pub fn add_child(&self, key: &str) -> bool {
        let mut children = self.children.write();
        if children.iter().any(|c| c == key) {
            return false;
        }
        children.push(key.to_string());
        true
    }

    pub fn remove_child(&self, key: &str) -> bool {
        let mut children = self.children.write();
        let before = children.len();
        children.retain(|c| c != key);
        children.len() != before
    }

    pub fn owner(&self) -> Option<GraphId> {
        self.owner.get().copied()
    }

    pub fn set_owner(&self, owner: GraphId) -> Result<()> {
        self.owner.set(owner).map_err(|_| {
            TaskGroupError::InvalidState(format!(
                "Changing owner graph is not allowed: node '{}' already belongs to graph {}",
                self.key,
                self.owner().unwrap_or_default()
            ))
        })
    }
}

impl<D: Send + Sync> GraphNode for Node<D> {
    fn key(&self) -> &str {
        Node::key(self)
    }

    fn children(&self) -> Vec<String> {
        Node::children(self)
    }

    fn owner(&self) -> Option<GraphId> {
        Node::owner(self)
    }

    fn set_owner(&self, owner: GraphId) -> Result<()> {
        Node::set_owner(self, owner)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeType {
    Tree,
    Back,
    Forward,
    Cross,
}

pub trait Visitor<N> {
    fn visit_node(&mut self, node: &Arc<N>) -> Result<()>;

    fn visit_edge(&mut self, from: &str, to: &str, edge: EdgeType, dfs: &DfsState) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct DfsState {
    time: usize,
    visited: HashSet<String>,
    processed: HashSet<String>,
    entry_time: HashMap<String, usize>,
    parent: HashMap<String, String>,
}

impl DfsState {
    fn edge_type(&self, from: &str, to: &str) -> Result<EdgeType> {
        if self.parent.get(to).is_some_and(|p| p == from) {
            return Ok(EdgeType::Tree);
        }
        if self.visited.contains(to) && !self.processed.contains(to) {
            return Ok(EdgeType::Back);
        }
        if self.processed.contains(to) {
            if let (Some(to_entry), Some(from_entry)) =
                (self.entry_time.get(to), self.entry_time.get(from))
            {
                if to_entry > from_entry {
                    return Ok(EdgeType::Forward);
                }
                if to_entry < from_entry {
                    return Ok(EdgeType::Cross);
                }
            }
        }
        Err(TaskGroupError::InvalidState(format!(
            "unable to classify edge {{{from}, {to}}}"
        )))
    }

    /// Path along the traversal tree from the ancestor `from` down to `to`,
    /// rendered as `from -> ... -> to`.
    pub fn find_path(&self, from: &str, to: &str) -> String {
        let mut path = vec![to];
        let mut current = to;
        while current != from {
            match self.parent.get(current) {
                Some(parent) => {
                    path.push(parent);
                    current = parent;
                }
                None => break,
            }
        }
        path.reverse();
        path.join(" -> ")
    }
}

pub struct Graph<N> {
    id: GraphId,
    nodes: RwLock<HashMap<String, Arc<N>>>,
}

impl<N: GraphNode> Graph<N> {
    pub fn new() -> Self {
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn add_node(&self, node: Arc<N>) -> Result<()> {
        if self.contains(node.key()) {
            return Err(TaskGroupError::InvalidState(format!(
                "a node with key '{}' already exists in graph {}",
                node.key(),
                self.id
            )));
        }
        node.set_owner(self.id)?;
        self.nodes.write().insert(node.key().to_string(), node);
        Ok(())
    }

    pub(crate) fn adopt(&self, node: Arc<N>) {
        let owned = node.set_owner(self.id);
        debug_assert!(owned.is_ok(), "adopted node already had an owner: {owned:?}");
        self.nodes.write().insert(node.key().to_string(), node);
    }

    /// Shares `node` with this graph without touching its owner. Keys that
    /// are already present are left alone.
    pub(crate) fn share(&self, node: &Arc<N>) -> bool {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(node.key()) {
            return false;
        }
        nodes.insert(node.key().to_string(), Arc::clone(node));
        true
    }

    pub fn node(&self, key: &str) -> Option<Arc<N>> {
        self.nodes.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.nodes.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn nodes(&self) -> Vec<Arc<N>> {
        self.nodes.read().values().cloned().collect()
    }

    /// Depth-first traversal over every node, starting points in key order.
    pub fn visit<V: Visitor<N>>(&self, visitor: &mut V) -> Result<()> {
        let nodes = self.nodes.read().clone();
        let mut keys: Vec<&String> = nodes.keys().collect();
        keys.sort();

        let mut state = DfsState::default();
        for key in keys {
            if !state.visited.contains(key.as_str()) {
                Self::dfs(&nodes, &nodes[key], visitor, &mut state)?;
            }
        }
        Ok(())
    }

    fn dfs<V: Visitor<N>>(
        nodes: &HashMap<String, Arc<N>>,
        node: &Arc<N>,
        visitor: &mut V,
        state: &mut DfsState,
    ) -> Result<()> {
        visitor.visit_node(node)?;
        let from = node.key().to_string();
        state.visited.insert(from.clone());
        state.time += 1;
        state.entry_time.insert(from.clone(), state.time);

        for to in node.children() {
            if state.visited.contains(&to) {
                let edge = state.edge_type(&from, &to)?;
                visitor.visit_edge(&from, &to, edge, state)?;
                continue;
            }
            let child = nodes.get(&to).ok_or_else(|| {
                TaskGroupError::TaskNotFound(format!("'{to}' (dependency of '{from}')"))
            })?;
            state.parent.insert(to.clone(), from.clone());
            let edge = state.edge_type(&from, &to)?;
            visitor.visit_edge(&from, &to, edge, state)?;
            Self::dfs(nodes, child, visitor, state)?;
        }

        state.time += 1;
        state.processed.insert(from);
        Ok(())
    }
}

impl<N: GraphNode> Default for Graph<N> {
    fn default() -> Self {
        Self::new()
    }
}
