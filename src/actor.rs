//! # Engine Actor
//!
//! One dedicated thread owns everything mutable: the SQLite connection, the
//! node store, the ingest buffers, the view states and every timer. Public
//! calls reach it as [`Request`] messages and get their answer back over a
//! oneshot channel.
//!
//! ## Architecture
//!
//! ```text
//!   Engine (Clone, any thread)
//!     │  mpsc::Sender<Request>
//!     ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  gnode-engine thread (current-thread tokio runtime)                  │
//! │                                                                      │
//! │   loop select! {                                                     │
//! │       shutdown.notified()        → discard buffers, close bus, exit  │
//! │       rx.recv()                  → handle request                    │
//! │       sleep_until(next deadline) → flush due tables, run due pass    │
//! │   }                                                                  │
//! │                                                                      │
//! │   Database · NodeStore · TableState · ViewState · NotificationBus    │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Timers as State
//!
//! There are no timer tasks. Pending work is two plain fields:
//!
//! - `flush_deadlines: HashMap<NodeId, Instant>`, at most one per table
//! - `pass_deadline: Option<Instant>`, at most one pass
//!
//! Arming a timer that is already armed leaves the earlier deadline, which is
//! what coalesces a burst of updates into one flush and a burst of flushes
//! into one pass. The loop sleeps until the earliest deadline.
//!
//! ## Shutdown
//!
//! `destroy()` flips the shared liveness flag and wakes the loop through a
//! `Notify`. The scheduler checks the flag before every view commit, so a
//! running pass stops committing as soon as the flag drops.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::graph::{NodeDescriptor, NodeStore};
use crate::ingest::{TableState, Waiter};
use crate::materialize::output_schema;
use crate::scheduler::{self, ViewState, ViewStatus};
use crate::schema::{Database, TableLayout};
use crate::storage;
use crate::subscription::NotificationBus;
use crate::types::{ColumnDef, NodeId, NodeKind, Row, TableSchema, ViewConfig};

/// Maximum number of requests queued for the actor.
const REQUEST_CHANNEL_SIZE: usize = 1024;

type Responder<T> = oneshot::Sender<Result<T>>;

// =============================================================================
// Requests
// =============================================================================

/// Messages handled by the engine actor.
pub enum Request {
    CreateTable {
        id: NodeId,
        schema: TableSchema,
        response: Responder<NodeDescriptor>,
    },
    CreateView {
        id: NodeId,
        config: ViewConfig,
        response: Responder<(NodeDescriptor, Vec<ColumnDef>)>,
    },
    /// `accepted` answers validation; `done` answers the flush.
    Update {
        table: NodeId,
        rows: Vec<Row>,
        accepted: Responder<()>,
        done: Waiter,
    },
    Flush {
        response: Responder<()>,
    },
    Settle {
        response: Responder<()>,
    },
    Compact {
        id: NodeId,
        response: Responder<usize>,
    },
    Query {
        id: NodeId,
        response: Responder<Vec<Row>>,
    },
    RowCount {
        id: NodeId,
        response: Responder<usize>,
    },
    Describe {
        id: NodeId,
        response: Responder<Option<NodeDescriptor>>,
    },
    ViewStatus {
        id: NodeId,
        response: Responder<ViewStatus>,
    },
    List {
        response: Responder<Vec<NodeId>>,
    },
    Remove {
        id: NodeId,
        response: Responder<()>,
    },
}

impl Request {
    /// Answers the request with `Destroyed` without handling it.
    fn reject(self) {
        match self {
            Request::CreateTable { response, .. } => {
                let _ = response.send(Err(Error::Destroyed));
            }
            Request::CreateView { response, .. } => {
                let _ = response.send(Err(Error::Destroyed));
            }
            Request::Update { accepted, done, .. } => {
                let _ = accepted.send(Err(Error::Destroyed));
                let _ = done.send(Err(Error::Destroyed));
            }
            Request::Flush { response }
            | Request::Settle { response }
            | Request::Remove { response, .. } => {
                let _ = response.send(Err(Error::Destroyed));
            }
            Request::Compact { response, .. } | Request::RowCount { response, .. } => {
                let _ = response.send(Err(Error::Destroyed));
            }
            Request::Query { response, .. } => {
                let _ = response.send(Err(Error::Destroyed));
            }
            Request::Describe { response, .. } => {
                let _ = response.send(Err(Error::Destroyed));
            }
            Request::ViewStatus { response, .. } => {
                let _ = response.send(Err(Error::Destroyed));
            }
            Request::List { response } => {
                let _ = response.send(Err(Error::Destroyed));
            }
        }
    }
}

// =============================================================================
// Actor State
// =============================================================================

struct EngineActor {
    db: Database,
    graph: NodeStore,
    tables: HashMap<NodeId, TableState>,
    views: HashMap<NodeId, ViewState>,
    bus: NotificationBus,
    live: Arc<AtomicBool>,
    config: EngineConfig,
    flush_deadlines: HashMap<NodeId, Instant>,
    pass_deadline: Option<Instant>,
}

impl EngineActor {
    fn handle(&mut self, request: Request) {
        match request {
            Request::CreateTable { id, schema, response } => {
                let _ = response.send(self.create_table(id, schema));
            }
            Request::CreateView { id, config, response } => {
                let _ = response.send(self.create_view(id, config));
            }
            Request::Update {
                table,
                rows,
                accepted,
                done,
            } => match self.accept_update(&table, &rows) {
                Ok(()) => {
                    let _ = accepted.send(Ok(()));
                    self.buffer_rows(table, rows, done);
                }
                Err(e) => {
                    let _ = accepted.send(Err(e));
                }
            },
            Request::Flush { response } => {
                let _ = response.send(self.flush_all());
            }
            Request::Settle { response } => {
                let _ = response.send(self.settle());
            }
            Request::Compact { id, response } => {
                let _ = response.send(self.compact(&id));
            }
            Request::Query { id, response } => {
                let _ = response.send(self.query(&id));
            }
            Request::RowCount { id, response } => {
                let _ = response.send(self.row_count(&id));
            }
            Request::Describe { id, response } => {
                let _ = response.send(Ok(self.graph.describe(id.as_str())));
            }
            Request::ViewStatus { id, response } => {
                let _ = response.send(self.view_status(&id));
            }
            Request::List { response } => {
                let _ = response.send(Ok(self.graph.list()));
            }
            Request::Remove { id, response } => {
                let _ = response.send(self.remove(&id));
            }
        }
    }

    // =========================================================================
    // Node Lifecycle
    // =========================================================================

    fn create_table(&mut self, id: NodeId, schema: TableSchema) -> Result<NodeDescriptor> {
        self.graph.ensure_absent(&id)?;
        schema.validate()?;
        let layout = TableLayout::new(&id, schema);
        self.db.create_table_storage(&layout)?;
        let descriptor = self.graph.insert_table(id.clone(), layout.main.clone())?;
        self.bus.register(&id);
        info!(table = %id, columns = layout.columns().len(), "created table");
        self.tables.insert(id, TableState::new(layout));
        Ok(descriptor)
    }

    fn create_view(
        &mut self,
        id: NodeId,
        config: ViewConfig,
    ) -> Result<(NodeDescriptor, Vec<ColumnDef>)> {
        self.graph.ensure_absent(&id)?;
        self.graph.check_view_source(&id, &config.source)?;
        let source_id = config.source.clone();
        let source = self
            .tables
            .get(&config.source)
            .ok_or_else(|| Error::SourceNotFound {
                view: id.to_string(),
                source_id: config.source.to_string(),
            })?;
        let outputs = output_schema(&id, &config, &source.layout.schema)?;

        let physical = self.db.create_view_storage(&id, &outputs)?;
        let descriptor = match self
            .graph
            .insert_view(id.clone(), physical.clone(), config.clone())
        {
            Ok(d) => d,
            Err(e) => {
                let _ = self.db.drop_tables([physical.as_str()]);
                return Err(e);
            }
        };
        self.bus.register(&id);
        self.views
            .insert(id.clone(), ViewState::new(config, outputs.clone(), physical));
        self.arm_pass();
        info!(view = %id, source = %source_id, "created view");
        Ok((descriptor, outputs))
    }

    fn remove(&mut self, id: &NodeId) -> Result<()> {
        let descriptor = self.graph.remove(id.as_str())?;
        self.bus.unregister(id);
        let dropped = match descriptor.kind {
            NodeKind::Table => {
                self.flush_deadlines.remove(id);
                match self.tables.remove(id) {
                    Some(mut state) => {
                        state.discard(|| Error::NotFound(id.to_string()));
                        self.db
                            .drop_tables([state.layout.main.as_str(), state.layout.delta.as_str()])
                    }
                    None => Ok(()),
                }
            }
            NodeKind::View => {
                self.views.remove(id);
                self.db.drop_tables([descriptor.physical_name.as_str()])
            }
        };
        info!(node = %id, kind = %descriptor.kind, "removed node");
        dropped
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    fn table_state(&self, id: &NodeId) -> Result<&TableState> {
        match self.graph.kind(id.as_str()) {
            None => Err(Error::NotFound(id.to_string())),
            Some(NodeKind::View) => Err(Error::WrongKind {
                id: id.to_string(),
                reason: "cannot update non-table".into(),
            }),
            Some(NodeKind::Table) => self
                .tables
                .get(id)
                .ok_or_else(|| Error::NotFound(id.to_string())),
        }
    }

    fn accept_update(&self, table: &NodeId, rows: &[Row]) -> Result<()> {
        self.table_state(table)?.validate(table, rows)
    }

    fn buffer_rows(&mut self, table: NodeId, rows: Vec<Row>, done: Waiter) {
        let Some(state) = self.tables.get_mut(&table) else {
            let _ = done.send(Err(Error::NotFound(table.to_string())));
            return;
        };
        state.push(rows, Some(done));
        if state.buffered() > 0 {
            let deadline = Instant::now() + self.config.debounce;
            self.flush_deadlines.entry(table).or_insert(deadline);
        }
    }

    /// Flushes one table; on success propagates dirty and arms a pass.
    ///
    /// A failed flush keeps its rows buffered and re-arms the table's timer,
    /// so the batch is retried one debounce interval later.
    fn flush_table(&mut self, id: &NodeId) -> Result<()> {
        self.flush_deadlines.remove(id);
        let Some(state) = self.tables.get_mut(id) else {
            return Ok(());
        };
        let delta = match state.flush(id, &mut self.db, self.config.merge_threshold) {
            Ok(Some(delta)) => delta,
            Ok(None) => return Ok(()),
            Err(e) => {
                let retry = Instant::now() + self.config.debounce;
                self.flush_deadlines.insert(id.clone(), retry);
                return Err(e);
            }
        };

        for node in self.graph.propagate_dirty(id.as_str()) {
            if let Some(view) = self.views.get_mut(&node) {
                view.mark_dirty();
            }
        }
        self.arm_pass();
        self.bus.publish(&delta);
        Ok(())
    }

    /// Flushes every table with buffered rows, in creation order.
    ///
    /// Every table is attempted; the first error is returned.
    fn flush_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for id in self.graph.list() {
            if self.tables.get(&id).is_some_and(|t| t.buffered() > 0) {
                if let Err(e) = self.flush_table(&id) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn compact(&mut self, id: &NodeId) -> Result<usize> {
        if self.graph.kind(id.as_str()) == Some(NodeKind::View) {
            return Err(Error::WrongKind {
                id: id.to_string(),
                reason: "only tables have a delta log".into(),
            });
        }
        let state = self
            .tables
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let moved = state.compact(&mut self.db)?;
        debug!(table = %id, moved, "compacted delta log");
        Ok(moved)
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn arm_pass(&mut self) {
        if self.pass_deadline.is_none() {
            self.pass_deadline = Some(Instant::now() + self.config.debounce);
        }
    }

    fn run_pass(&mut self) -> Result<()> {
        self.pass_deadline = None;
        let outcome = scheduler::run_pass(
            &mut self.db,
            &mut self.graph,
            &self.tables,
            &mut self.views,
            &self.bus,
            &self.live,
        );
        if !outcome.refreshed.is_empty() {
            debug!(refreshed = outcome.refreshed.len(), "refresh pass done");
        }
        if outcome.aborted {
            return Err(Error::Destroyed);
        }
        scheduler::pass_error(&outcome).map_or(Ok(()), Err)
    }

    /// Flushes everything and runs a pass right away.
    fn settle(&mut self) -> Result<()> {
        let flushed = self.flush_all();
        let passed = self.run_pass();
        flushed.and(passed)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.flush_deadlines
            .values()
            .copied()
            .chain(self.pass_deadline)
            .min()
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let due: Vec<NodeId> = self
            .graph
            .list()
            .into_iter()
            .filter(|id| self.flush_deadlines.get(id).is_some_and(|d| *d <= now))
            .collect();
        for id in due {
            // failures are logged by the buffer and re-arm the timer
            let _ = self.flush_table(&id);
        }
        // deadlines for nodes removed meanwhile
        self.flush_deadlines.retain(|id, _| self.tables.contains_key(id));

        if self.pass_deadline.is_some_and(|d| d <= now) {
            let _ = self.run_pass();
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn query(&self, id: &NodeId) -> Result<Vec<Row>> {
        match self.graph.kind(id.as_str()) {
            None => Err(Error::NotFound(id.to_string())),
            Some(NodeKind::Table) => {
                let state = self.table_state(id)?;
                storage::read_visible(self.db.conn(), &state.layout)
            }
            Some(NodeKind::View) => {
                let view = self
                    .views
                    .get(id)
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                storage::read_table(self.db.conn(), &view.physical_name, &view.outputs)
            }
        }
    }

    fn row_count(&self, id: &NodeId) -> Result<usize> {
        match self.graph.kind(id.as_str()) {
            None => Err(Error::NotFound(id.to_string())),
            Some(NodeKind::Table) => {
                let state = self.table_state(id)?;
                storage::count_visible(self.db.conn(), &state.layout)
            }
            Some(NodeKind::View) => {
                let view = self
                    .views
                    .get(id)
                    .ok_or_else(|| Error::NotFound(id.to_string()))?;
                storage::count_rows(self.db.conn(), &view.physical_name)
            }
        }
    }

    fn view_status(&self, id: &NodeId) -> Result<ViewStatus> {
        match self.graph.kind(id.as_str()) {
            None => Err(Error::NotFound(id.to_string())),
            Some(NodeKind::Table) => Err(Error::WrongKind {
                id: id.to_string(),
                reason: "tables have no refresh state".into(),
            }),
            Some(NodeKind::View) => self
                .views
                .get(id)
                .map(ViewStatus::from)
                .ok_or_else(|| Error::NotFound(id.to_string())),
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    fn shut_down(&mut self, rx: &mut mpsc::Receiver<Request>) {
        self.live.store(false, Ordering::Release);
        rx.close();
        while let Ok(request) = rx.try_recv() {
            request.reject();
        }

        let mut discarded = 0;
        for state in self.tables.values_mut() {
            discarded += state.discard(|| Error::Destroyed);
        }
        self.flush_deadlines.clear();
        self.pass_deadline = None;
        self.bus.close();
        self.views.clear();
        self.tables.clear();
        self.graph.clear();
        info!(discarded_rows = discarded, "engine destroyed");
    }
}

// =============================================================================
// Actor Loop
// =============================================================================

async fn run_engine(
    mut actor: EngineActor,
    mut rx: mpsc::Receiver<Request>,
    shutdown: Arc<Notify>,
) {
    loop {
        let next = actor.next_deadline();
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            request = rx.recv() => match request {
                Some(request) => {
                    if !actor.live.load(Ordering::Acquire) {
                        request.reject();
                        break;
                    }
                    actor.handle(request);
                }
                // every handle dropped
                None => break,
            },

            _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {
                actor.fire_due_timers();
            }
        }
    }
    actor.shut_down(&mut rx);
}

/// Channels and flags shared by every clone of the public handle.
pub struct EngineLink {
    pub tx: mpsc::Sender<Request>,
    pub bus: NotificationBus,
    pub live: Arc<AtomicBool>,
    pub shutdown: Arc<Notify>,
}

/// Opens the database and starts the engine thread.
pub fn spawn_engine(config: EngineConfig) -> Result<EngineLink> {
    config.validate()?;
    let db = match &config.db_path {
        Some(path) => Database::open(path)?,
        None => Database::open_in_memory()?,
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;

    let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
    let bus = NotificationBus::new(config.broadcast_capacity);
    let live = Arc::new(AtomicBool::new(true));
    let shutdown = Arc::new(Notify::new());

    let actor = EngineActor {
        db,
        graph: NodeStore::new(),
        tables: HashMap::new(),
        views: HashMap::new(),
        bus: bus.clone(),
        live: Arc::clone(&live),
        config,
        flush_deadlines: HashMap::new(),
        pass_deadline: None,
    };

    let stop = Arc::clone(&shutdown);
    std::thread::Builder::new()
        .name("gnode-engine".to_string())
        .spawn(move || runtime.block_on(run_engine(actor, rx, stop)))
        .map_err(|e| {
            error!(error = %e, "failed to spawn engine thread");
            Error::Io(e)
        })?;

    info!("engine started");
    Ok(EngineLink {
        tx,
        bus,
        live,
        shutdown,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AggregateFn, ColumnType};
    use std::time::Duration;

    fn actor() -> EngineActor {
        let config = EngineConfig::default().with_debounce(Duration::from_millis(50));
        EngineActor {
            db: Database::open_in_memory().unwrap(),
            graph: NodeStore::new(),
            tables: HashMap::new(),
            views: HashMap::new(),
            bus: NotificationBus::new(16),
            live: Arc::new(AtomicBool::new(true)),
            config,
            flush_deadlines: HashMap::new(),
            pass_deadline: None,
        }
    }

    fn sales() -> TableSchema {
        TableSchema::new()
            .column("region", ColumnType::Text)
            .column("revenue", ColumnType::Integer)
    }

    fn sale(region: &str, revenue: i64) -> Row {
        Row::new().with("region", region).with("revenue", revenue)
    }

    #[tokio::test]
    async fn test_flush_deadline_armed_once() {
        let mut a = actor();
        a.create_table("sales".into(), sales()).unwrap();
        let id = NodeId::new("sales");

        let (done1, _rx1) = oneshot::channel();
        a.buffer_rows(id.clone(), vec![sale("N", 1)], done1);
        let first = a.flush_deadlines[&id];

        tokio::time::sleep(Duration::from_millis(5)).await;
        let (done2, _rx2) = oneshot::channel();
        a.buffer_rows(id.clone(), vec![sale("S", 2)], done2);

        assert_eq!(a.flush_deadlines.len(), 1);
        assert_eq!(a.flush_deadlines[&id], first);
        assert_eq!(a.tables[&id].buffered(), 2);
    }

    #[tokio::test]
    async fn test_flush_arms_single_pass() {
        let mut a = actor();
        a.create_table("sales".into(), sales()).unwrap();
        a.create_view(
            "v".into(),
            ViewConfig::new("sales").pivot("region").aggregate("revenue", AggregateFn::Sum),
        )
        .unwrap();
        let armed = a.pass_deadline.expect("view creation arms a pass");

        let (done, rx) = oneshot::channel();
        a.buffer_rows("sales".into(), vec![sale("N", 1)], done);
        a.flush_table(&NodeId::new("sales")).unwrap();

        assert!(rx.await.unwrap().is_ok());
        assert_eq!(a.pass_deadline, Some(armed));
        assert!(a.graph.is_dirty("sales"));
        assert!(a.graph.is_dirty("v"));
        assert!(a.flush_deadlines.is_empty());
    }

    #[tokio::test]
    async fn test_settle_refreshes_now() {
        let mut a = actor();
        a.create_table("sales".into(), sales()).unwrap();
        a.create_view(
            "v".into(),
            ViewConfig::new("sales").aggregate("revenue", AggregateFn::Sum),
        )
        .unwrap();
        let (done, _rx) = oneshot::channel();
        a.buffer_rows("sales".into(), vec![sale("N", 3), sale("S", 4)], done);

        a.settle().unwrap();
        assert!(a.pass_deadline.is_none());
        let rows = a.query(&NodeId::new("v")).unwrap();
        assert_eq!(rows, vec![Row::new().with("revenue_sum", 7)]);
    }

    #[tokio::test]
    async fn test_failed_flush_rearms_deadline() {
        let mut a = actor();
        a.create_table("sales".into(), sales()).unwrap();
        let id = NodeId::new("sales");
        a.db.conn()
            .execute_batch("ALTER TABLE \"t_sales__delta\" RENAME TO \"parked\"")
            .unwrap();

        let (done, rx) = oneshot::channel();
        a.buffer_rows(id.clone(), vec![sale("N", 1)], done);
        assert!(a.flush_table(&id).is_err());
        assert!(matches!(rx.await.unwrap(), Err(Error::EngineFailure { .. })));
        assert!(a.flush_deadlines.contains_key(&id));
        assert_eq!(a.tables[&id].buffered(), 1);

        a.db.conn()
            .execute_batch("ALTER TABLE \"parked\" RENAME TO \"t_sales__delta\"")
            .unwrap();
        a.flush_deadlines
            .insert(id.clone(), Instant::now() - Duration::from_millis(1));
        a.fire_due_timers();
        assert!(a.flush_deadlines.is_empty());
        assert_eq!(a.row_count(&id).unwrap(), 1);
    }

    #[test]
    fn test_update_guards() {
        let mut a = actor();
        a.create_table("sales".into(), sales()).unwrap();
        a.create_view(
            "v".into(),
            ViewConfig::new("sales").aggregate("revenue", AggregateFn::Sum),
        )
        .unwrap();

        assert!(matches!(
            a.accept_update(&NodeId::new("nope"), &[]),
            Err(Error::NotFound(_))
        ));
        let err = a.accept_update(&NodeId::new("v"), &[]).unwrap_err();
        assert!(err.to_string().contains("cannot update non-table"));
        assert!(a.accept_update(&NodeId::new("sales"), &[sale("N", 1)]).is_ok());
    }

    #[test]
    fn test_remove_drops_storage_and_deadlines() {
        let mut a = actor();
        a.create_table("sales".into(), sales()).unwrap();
        let (done, _rx) = oneshot::channel();
        a.buffer_rows("sales".into(), vec![sale("N", 1)], done);

        a.remove(&NodeId::new("sales")).unwrap();
        assert!(a.flush_deadlines.is_empty());
        assert!(a.tables.is_empty());
        let left: i64 = a
            .db
            .conn()
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE name LIKE 't_sales%'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(left, 0);
    }

    #[test]
    fn test_next_deadline_is_earliest() {
        let mut a = actor();
        assert!(a.next_deadline().is_none());
        let now = Instant::now();
        a.pass_deadline = Some(now + Duration::from_millis(30));
        a.flush_deadlines
            .insert("t".into(), now + Duration::from_millis(10));
        assert_eq!(a.next_deadline(), Some(now + Duration::from_millis(10)));
    }
}
