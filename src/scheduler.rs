//! # Dependency Graph Scheduler
//!
//! A refresh pass brings every dirty view up to date, in dependency order.
//!
//! ## One Pass
//!
//! ```text
//! 1. collect      dirty = { n | n.dirty }
//! 2. order        Kahn's algorithm over edges inside `dirty`
//!                 leftovers are cycles: warn, skip, stay dirty
//! 3. refresh      table  → mark clean (dependents were marked at flush)
//!                 view   → Dirty → Refreshing → materialize
//!                          → BEGIN; replace rows; COMMIT → Clean
//!                          (on error: log, back to Dirty)
//! 4. notify       view delta = diff(old aggregate cache, new rows)
//! ```
//!
//! ## View States
//!
//! ```text
//!          mark dirty           pass picks it up
//!  Clean ────────────► Dirty ─────────────────► Refreshing
//!    ▲                   ▲                          │
//!    │        success    │        failure           │
//!    └───────────────────┼──────────────────────────┤
//!                        └──────────────────────────┘
//! ```
//!
//! ## Liveness
//!
//! The actor holds an `AtomicBool` that `destroy()` clears from any thread.
//! Each refresh checks it right before committing, so a pass that is running
//! when the engine is destroyed never commits another view.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{Error, Result, SqlIntent};
use crate::graph::NodeStore;
use crate::ingest::TableState;
use crate::materialize::{group_key, materialize};
use crate::schema::Database;
use crate::storage;
use crate::subscription::NotificationBus;
use crate::types::{current_time_ms, ColumnDef, Delta, NodeId, NodeKind, Row, RowOp, ViewConfig};

// =============================================================================
// View State
// =============================================================================

/// Where a view is in its refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshState {
    Clean,
    Dirty,
    Refreshing,
}

/// Incremental state of one view.
#[derive(Debug)]
pub struct ViewState {
    pub config: ViewConfig,
    /// Typed output columns, pivots first.
    pub outputs: Vec<ColumnDef>,
    /// Backing SQL table.
    pub physical_name: String,
    /// Group key → output row, as of the last successful refresh.
    pub aggregate_cache: BTreeMap<String, Row>,
    pub last_version: u64,
    pub needs_refresh: bool,
    pub last_refresh_time: Option<u64>,
    pub state: RefreshState,
}

impl ViewState {
    /// A new view: empty cache, first refresh pending.
    pub fn new(config: ViewConfig, outputs: Vec<ColumnDef>, physical_name: String) -> Self {
        Self {
            config,
            outputs,
            physical_name,
            aggregate_cache: BTreeMap::new(),
            last_version: 0,
            needs_refresh: true,
            last_refresh_time: None,
            state: RefreshState::Dirty,
        }
    }

    pub fn mark_dirty(&mut self) {
        self.needs_refresh = true;
        if self.state == RefreshState::Clean {
            self.state = RefreshState::Dirty;
        }
    }
}

/// Public summary of a view's incremental state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewStatus {
    pub state: RefreshState,
    pub last_version: u64,
    pub needs_refresh: bool,
    pub last_refresh_time: Option<u64>,
    pub group_count: usize,
}

impl From<&ViewState> for ViewStatus {
    fn from(v: &ViewState) -> Self {
        Self {
            state: v.state,
            last_version: v.last_version,
            needs_refresh: v.needs_refresh,
            last_refresh_time: v.last_refresh_time,
            group_count: v.aggregate_cache.len(),
        }
    }
}

// =============================================================================
// Ordering
// =============================================================================

/// Result of ordering the dirty set.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Plan {
    /// Dirty nodes, dependencies before dependents.
    pub order: Vec<NodeId>,
    /// Dirty nodes on a cycle (or downstream of one).
    pub cyclic: Vec<NodeId>,
}

/// Kahn's algorithm restricted to the dirty nodes.
///
/// Ties are broken by creation order, so the result is deterministic.
pub fn plan_pass(graph: &NodeStore) -> Plan {
    let dirty = graph.dirty_nodes();
    let members: HashSet<&str> = dirty.iter().map(NodeId::as_str).collect();

    let mut in_degree: HashMap<&str, usize> = dirty
        .iter()
        .map(|id| {
            let deps = graph
                .dependencies(id.as_str())
                .iter()
                .filter(|d| members.contains(d.as_str()))
                .count();
            (id.as_str(), deps)
        })
        .collect();

    let mut queue: VecDeque<&NodeId> = dirty
        .iter()
        .filter(|id| in_degree[id.as_str()] == 0)
        .collect();

    let mut order = Vec::with_capacity(dirty.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        for dependent in graph.dependents(id.as_str()) {
            if let Some(deg) = in_degree.get_mut(dependent.as_str()) {
                *deg = deg.saturating_sub(1);
                if *deg == 0 {
                    if let Some(member) = dirty.iter().find(|d| **d == dependent) {
                        queue.push_back(member);
                    }
                }
            }
        }
    }

    let placed: HashSet<&NodeId> = order.iter().collect();
    let cyclic = dirty.iter().filter(|id| !placed.contains(id)).cloned().collect();
    Plan { order, cyclic }
}

// =============================================================================
// Refresh
// =============================================================================

/// Diffs the previous aggregate cache against fresh rows.
pub fn diff_groups(
    config: &ViewConfig,
    old: &BTreeMap<String, Row>,
    rows: &[Row],
) -> (BTreeMap<String, Row>, Vec<RowOp>) {
    let mut fresh = BTreeMap::new();
    let mut ops = Vec::new();
    for row in rows {
        let key = group_key(config, row);
        match old.get(&key) {
            None => ops.push(RowOp::insert(key.clone(), row.clone())),
            Some(prev) if prev != row => ops.push(RowOp::update(key.clone(), prev.clone(), row.clone())),
            Some(_) => {}
        }
        fresh.insert(key, row.clone());
    }
    for (key, prev) in old {
        if !fresh.contains_key(key) {
            ops.push(RowOp::delete(key.clone(), prev.clone()));
        }
    }
    (fresh, ops)
}

/// Re-materializes one view and replaces its backing rows.
///
/// Returns `Ok(None)` if the engine died before the commit; nothing is
/// written in that case.
pub fn refresh_view(
    db: &mut Database,
    id: &NodeId,
    view: &mut ViewState,
    source: &TableState,
    live: &AtomicBool,
) -> Result<Option<Delta>> {
    let rows = materialize(db.conn(), &view.config, &source.layout, &view.outputs)?;
    let (cache, operations) = diff_groups(&view.config, &view.aggregate_cache, &rows);

    let tx = db.conn_mut().transaction().intent("begin view refresh")?;
    storage::replace_rows(&tx, &view.physical_name, &view.outputs, &rows)?;
    if !live.load(Ordering::Acquire) {
        // dropping the transaction rolls it back
        return Ok(None);
    }
    tx.commit().intent("commit view refresh")?;

    view.aggregate_cache = cache;
    view.last_version += 1;
    view.last_refresh_time = Some(current_time_ms());
    debug!(view = %id, version = view.last_version, groups = rows.len(), changed = operations.len(), "refreshed");

    Ok(Some(Delta {
        node: id.clone(),
        version: view.last_version,
        timestamp_ms: current_time_ms(),
        operations,
    }))
}

/// What a pass did.
#[derive(Debug, Default)]
pub struct PassOutcome {
    pub refreshed: Vec<NodeId>,
    pub failed: Vec<NodeId>,
    pub cyclic: Vec<NodeId>,
    /// The engine was destroyed while the pass ran.
    pub aborted: bool,
}

/// Runs one refresh pass over every dirty node.
pub fn run_pass(
    db: &mut Database,
    graph: &mut NodeStore,
    tables: &HashMap<NodeId, TableState>,
    views: &mut HashMap<NodeId, ViewState>,
    bus: &NotificationBus,
    live: &AtomicBool,
) -> PassOutcome {
    let plan = plan_pass(graph);
    let mut outcome = PassOutcome {
        cyclic: plan.cyclic,
        ..PassOutcome::default()
    };
    if !outcome.cyclic.is_empty() {
        warn!(nodes = ?outcome.cyclic, "dependency cycle detected; skipping until resolved");
    }

    for id in plan.order {
        if !live.load(Ordering::Acquire) {
            outcome.aborted = true;
            break;
        }
        match graph.kind(id.as_str()) {
            Some(NodeKind::Table) => graph.set_dirty(id.as_str(), false),
            Some(NodeKind::View) => {
                let Some(view) = views.get_mut(&id) else {
                    continue;
                };
                let Some(source) = tables.get(&view.config.source) else {
                    error!(view = %id, source = %view.config.source, "view source vanished");
                    outcome.failed.push(id);
                    continue;
                };

                view.state = RefreshState::Refreshing;
                view.needs_refresh = false;
                match refresh_view(db, &id, view, source, live) {
                    Ok(Some(delta)) => {
                        view.state = RefreshState::Clean;
                        graph.set_dirty(id.as_str(), false);
                        bus.publish(&delta);
                        outcome.refreshed.push(id);
                    }
                    Ok(None) => {
                        view.state = RefreshState::Dirty;
                        view.needs_refresh = true;
                        outcome.aborted = true;
                        break;
                    }
                    Err(e) => {
                        error!(view = %id, error = %e, "refresh failed; will retry next pass");
                        view.state = RefreshState::Dirty;
                        view.needs_refresh = true;
                        outcome.failed.push(id);
                    }
                }
            }
            None => {}
        }
    }

    outcome
}

/// Error for a pass that could not refresh every dirty view.
pub fn pass_error(outcome: &PassOutcome) -> Option<Error> {
    if outcome.failed.is_empty() {
        return None;
    }
    Some(Error::EngineFailure {
        intent: "refresh views",
        message: format!("{} view(s) failed to refresh: {:?}", outcome.failed.len(), outcome.failed),
    })
}

// =============================================================================
// Tests
// =============================================================================
