//! # Node Store
//!
//! The registry of every table and view, plus the dependency edges between
//! them and each node's dirty flag. Purely in-memory; SQL storage is handled
//! by [`crate::schema`].
//!
//! ## Edges
//!
//! ```text
//!   sales ──► by_region        dependencies[by_region] = {sales}
//!     │                        dependents[sales]       = {by_region, top}
//!     └─────► top
//! ```
//!
//! Both directions live in one [`Edges`] value. Only `add_edge` and
//! `remove_edge` mutate it, and each updates the forward and reverse index
//! together, so `dependents` is always the transpose of `dependencies`.

use std::collections::{BTreeSet, HashMap, VecDeque};

use serde::Serialize;

use crate::error::{Error, Result};
use crate::types::{NodeId, NodeKind, ViewConfig};

// =============================================================================
// Descriptor
// =============================================================================

/// Snapshot of one node as seen by callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Empty for tables; exactly the source for views.
    pub dependencies: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub dirty: bool,
    /// Backing SQL table (the main table for base tables).
    pub physical_name: String,
    pub view_config: Option<ViewConfig>,
}

#[derive(Debug, Clone)]
struct NodeEntry {
    kind: NodeKind,
    dirty: bool,
    physical_name: String,
    view_config: Option<ViewConfig>,
}

// =============================================================================
// Edges
// =============================================================================

/// Forward and reverse adjacency, kept in lockstep.
#[derive(Debug, Default)]
struct Edges {
    /// node → what it reads from
    dependencies: HashMap<NodeId, BTreeSet<NodeId>>,
    /// node → what reads from it
    dependents: HashMap<NodeId, BTreeSet<NodeId>>,
}

impl Edges {
    fn add_edge(&mut self, dependency: &NodeId, dependent: &NodeId) {
        self.dependencies
            .entry(dependent.clone())
            .or_default()
            .insert(dependency.clone());
        self.dependents
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
    }

    fn remove_edge(&mut self, dependency: &NodeId, dependent: &NodeId) {
        if let Some(set) = self.dependencies.get_mut(dependent) {
            set.remove(dependency);
            if set.is_empty() {
                self.dependencies.remove(dependent);
            }
        }
        if let Some(set) = self.dependents.get_mut(dependency) {
            set.remove(dependent);
            if set.is_empty() {
                self.dependents.remove(dependency);
            }
        }
    }

    fn dependencies_of(&self, id: &str) -> impl Iterator<Item = &NodeId> {
        self.dependencies.get(id).into_iter().flatten()
    }

    fn dependents_of(&self, id: &str) -> impl Iterator<Item = &NodeId> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// True if `to` is reachable from `from` along dependent edges.
    fn reaches(&self, from: &str, to: &str) -> bool {
        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        while let Some(id) = queue.pop_front() {
            if id == to {
                return true;
            }
            if seen.insert(id) {
                queue.extend(self.dependents_of(id).map(NodeId::as_str));
            }
        }
        false
    }

    fn clear(&mut self) {
        self.dependencies.clear();
        self.dependents.clear();
    }
}

// =============================================================================
// Node Store
// =============================================================================

/// Registry of nodes and their edges.
#[derive(Debug, Default)]
pub struct NodeStore {
    nodes: HashMap<NodeId, NodeEntry>,
    /// Creation order, for deterministic listing and scheduling.
    order: Vec<NodeId>,
    edges: Edges,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn kind(&self, id: &str) -> Option<NodeKind> {
        self.nodes.get(id).map(|n| n.kind)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Fails with `AlreadyExists` if the id is taken.
    pub fn ensure_absent(&self, id: &NodeId) -> Result<()> {
        if self.contains(id.as_str()) {
            return Err(Error::AlreadyExists(id.to_string()));
        }
        Ok(())
    }

    /// Checks that `source` can back a new view `view`.
    ///
    /// The source must exist and must be a base table.
    pub fn check_view_source(&self, view: &NodeId, source: &NodeId) -> Result<()> {
        match self.kind(source.as_str()) {
            None => Err(Error::SourceNotFound {
                view: view.to_string(),
                source_id: source.to_string(),
            }),
            Some(NodeKind::View) => Err(Error::WrongKind {
                id: source.to_string(),
                reason: format!("view '{view}' cannot read from another view"),
            }),
            Some(NodeKind::Table) => Ok(()),
        }
    }

    /// Registers a base table. Tables start clean.
    pub fn insert_table(&mut self, id: NodeId, physical_name: String) -> Result<NodeDescriptor> {
        self.ensure_absent(&id)?;
        self.nodes.insert(
            id.clone(),
            NodeEntry {
                kind: NodeKind::Table,
                dirty: false,
                physical_name,
                view_config: None,
            },
        );
        self.order.push(id.clone());
        self.describe(id.as_str()).ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Registers a view and its edge from the source. Views start dirty so the
    /// first pass populates them.
    pub fn insert_view(
        &mut self,
        id: NodeId,
        physical_name: String,
        config: ViewConfig,
    ) -> Result<NodeDescriptor> {
        self.ensure_absent(&id)?;
        self.check_view_source(&id, &config.source)?;
        self.add_edge(&config.source, &id)?;
        let source = config.source.clone();
        self.nodes.insert(
            id.clone(),
            NodeEntry {
                kind: NodeKind::View,
                dirty: true,
                physical_name,
                view_config: Some(config),
            },
        );
        self.order.push(id.clone());
        tracing::debug!(view = %id, source = %source, "registered view");
        self.describe(id.as_str()).ok_or_else(|| Error::NotFound(id.to_string()))
    }

    /// Adds `dependency → dependent`, refusing edges that would close a cycle.
    pub fn add_edge(&mut self, dependency: &NodeId, dependent: &NodeId) -> Result<()> {
        if dependency == dependent || self.edges.reaches(dependent.as_str(), dependency.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "edge {dependency} -> {dependent} would create a cycle"
            )));
        }
        self.edges.add_edge(dependency, dependent);
        Ok(())
    }

    /// Adds an edge without the cycle check.
    #[cfg(test)]
    pub(crate) fn link_unchecked(&mut self, dependency: &NodeId, dependent: &NodeId) {
        self.edges.add_edge(dependency, dependent);
    }

    /// Returns a snapshot of the node.
    pub fn describe(&self, id: &str) -> Option<NodeDescriptor> {
        let (key, entry) = self.nodes.get_key_value(id)?;
        Some(NodeDescriptor {
            id: key.clone(),
            kind: entry.kind,
            dependencies: self.edges.dependencies_of(id).cloned().collect(),
            dependents: self.edges.dependents_of(id).cloned().collect(),
            dirty: entry.dirty,
            physical_name: entry.physical_name.clone(),
            view_config: entry.view_config.clone(),
        })
    }

    pub fn dependencies(&self, id: &str) -> Vec<NodeId> {
        self.edges.dependencies_of(id).cloned().collect()
    }

    pub fn dependents(&self, id: &str) -> Vec<NodeId> {
        self.edges.dependents_of(id).cloned().collect()
    }

    /// Removes a node that nothing depends on.
    pub fn remove(&mut self, id: &str) -> Result<NodeDescriptor> {
        let descriptor = self
            .describe(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        if !descriptor.dependents.is_empty() {
            return Err(Error::HasDependents {
                id: id.to_string(),
                dependents: descriptor.dependents.iter().map(NodeId::to_string).collect(),
            });
        }
        for dependency in &descriptor.dependencies {
            self.edges.remove_edge(dependency, &descriptor.id);
        }
        self.nodes.remove(id);
        self.order.retain(|n| n.as_str() != id);
        Ok(descriptor)
    }

    /// Ids of all nodes, in creation order.
    pub fn list(&self) -> Vec<NodeId> {
        self.order.clone()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.order.clear();
        self.edges.clear();
    }

    // =========================================================================
    // Dirty Tracking
    // =========================================================================

    pub fn is_dirty(&self, id: &str) -> bool {
        self.nodes.get(id).is_some_and(|n| n.dirty)
    }

    pub fn set_dirty(&mut self, id: &str, dirty: bool) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.dirty = dirty;
        }
    }

    /// Marks `id` and every transitive dependent dirty.
    ///
    /// Returns the nodes marked, starting with `id`.
    pub fn propagate_dirty(&mut self, id: &str) -> Vec<NodeId> {
        let mut marked = Vec::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        let mut seen: BTreeSet<NodeId> = BTreeSet::new();
        if let Some((key, _)) = self.nodes.get_key_value(id) {
            queue.push_back(key.clone());
        }
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            self.set_dirty(node.as_str(), true);
            queue.extend(self.edges.dependents_of(node.as_str()).cloned());
            marked.push(node);
        }
        marked
    }

    /// Dirty nodes, in creation order.
    pub fn dirty_nodes(&self) -> Vec<NodeId> {
        self.order
            .iter()
            .filter(|id| self.is_dirty(id.as_str()))
            .cloned()
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
