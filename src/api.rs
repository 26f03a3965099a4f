//! # Async API for GNode
//!
//! This module provides the public async interface. [`Engine`] is a cheap,
//! cloneable handle; the work happens on one dedicated engine thread that owns
//! the SQLite connection.
//!
//! ## The SQLite Challenge
//!
//! SQLite's `Connection` type uses `RefCell` internally, making it `!Sync`.
//! Rather than guard it with a lock, one thread owns it together with every
//! piece of mutable engine state, and callers talk to that thread over
//! channels:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Caller's Tokio Runtime                   │
//! │                                                             │
//! │   task1 ─┐                                                  │
//! │   task2 ─┼─ mpsc<Request> ──────────┐                       │
//! │   task3 ─┘   (oneshot replies)      │                       │
//! │                                     │                       │
//! │   subscribe()/watch() ── NotificationBus (shared, no hop)   │
//! └─────────────────────────────────────┼───────────────────────┘
//!                                       ▼
//!                     ┌──────────────────────────────┐
//!                     │  gnode-engine OS thread      │
//!                     │  current-thread runtime      │
//!                     │                              │
//!                     │  Connection · NodeStore      │
//!                     │  buffers · views · timers    │
//!                     └──────────────────────────────┘
//! ```
//!
//! ## Update Lifecycle
//!
//! ```text
//! update(rows) ──► validate ──► buffer ──(debounce)──► flush ──► delta log
//!                    │                                   │
//!                    └─ InvalidRow / NotFound            ├─► table delta to subscribers
//!                                                        └─► dirty views ──(debounce)──► refresh pass
//! ```
//!
//! `update()` resolves when the flush holding its rows commits. Views catch up
//! one debounce window later; call [`Engine::settle`] to force both steps.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::info;

use crate::actor::{spawn_engine, EngineLink, Request};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::graph::NodeDescriptor;
use crate::scheduler::ViewStatus;
use crate::subscription::{ChangeStream, NotificationBus, Subscription};
use crate::types::{Delta, NodeId, Row, TableSchema, ViewConfig};
use crate::view::ViewHandle;

// =============================================================================
// Engine - The Main Async Handle
// =============================================================================

/// The main async handle for GNode operations.
///
/// # Thread Safety
///
/// `Engine` is `Clone`, `Send`, and `Sync`. All clones drive the same engine
/// thread; [`Engine::destroy`] on any clone stops it for all of them.
///
/// # Example
///
/// ```rust,ignore
/// let engine = Engine::open(EngineConfig::default()).await?;
/// engine.create_table("sales", TableSchema::new()
///     .column("region", ColumnType::Text)
///     .column("revenue", ColumnType::Integer)).await?;
/// let view = engine.create_view("by_region", ViewConfig::new("sales")
///     .pivot("region")
///     .aggregate("revenue", AggregateFn::Sum)).await?;
///
/// engine.update("sales", vec![Row::new().with("region", "N").with("revenue", 10)]).await?;
/// engine.settle().await?;
/// let rows = view.snapshot().await?;
/// ```
#[derive(Clone)]
pub struct Engine {
    tx: mpsc::Sender<Request>,
    bus: NotificationBus,
    live: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("live", &self.is_live())
            .field("bus", &self.bus)
            .finish()
    }
}

impl Engine {
    /// Opens the database and starts the engine thread.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidConfig` for a zero merge threshold or broadcast
    ///   capacity, or a database written by an incompatible layout
    /// - `Error::EngineFailure` if SQLite cannot open the file
    /// - `Error::Io` if the database directory or the thread cannot be created
    pub async fn open(config: EngineConfig) -> Result<Self> {
        let EngineLink {
            tx,
            bus,
            live,
            shutdown,
        } = spawn_engine(config)?;
        Ok(Self {
            tx,
            bus,
            live,
            shutdown,
        })
    }

    /// Opens an engine over an in-memory database with default settings.
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(EngineConfig::default()).await
    }

    /// False once [`Engine::destroy`] has been called on any clone.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Sends one request and waits for its reply.
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Request) -> Result<T> {
        if !self.is_live() {
            return Err(Error::Destroyed);
        }
        let (response, reply) = oneshot::channel();
        self.tx
            .send(make(response))
            .await
            .map_err(|_| Error::Destroyed)?;
        reply.await.map_err(|_| Error::Destroyed)?
    }

    // =========================================================================
    // Node Lifecycle
    // =========================================================================

    /// Registers a base table and creates its storage.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyExists` if the id is taken
    /// - `Error::InvalidConfig` for an empty schema, duplicate columns, or a
    ///   primary key / time column the schema does not declare
    pub async fn create_table(
        &self,
        id: impl Into<NodeId>,
        schema: TableSchema,
    ) -> Result<NodeDescriptor> {
        let id = id.into();
        self.call(|response| Request::CreateTable {
            id,
            schema,
            response,
        })
        .await
    }

    /// Registers an aggregate view over a table and schedules its first
    /// refresh.
    ///
    /// # Errors
    ///
    /// - `Error::AlreadyExists` if the id is taken
    /// - `Error::SourceNotFound` if the source table does not exist
    /// - `Error::WrongKind` if the source is itself a view
    /// - `Error::InvalidConfig` for a config the source cannot satisfy
    pub async fn create_view(&self, id: impl Into<NodeId>, config: ViewConfig) -> Result<ViewHandle> {
        let id = id.into();
        let handle_config = config.clone();
        let (descriptor, outputs) = self
            .call(|response| Request::CreateView {
                id,
                config,
                response,
            })
            .await?;
        Ok(ViewHandle::new(self.clone(), descriptor.id, handle_config, outputs))
    }

    /// Descriptor of a node, or `None` if no such node exists.
    pub async fn node(&self, id: impl Into<NodeId>) -> Result<Option<NodeDescriptor>> {
        let id = id.into();
        self.call(|response| Request::Describe { id, response }).await
    }

    /// Ids of every registered node, in creation order.
    pub async fn list(&self) -> Result<Vec<NodeId>> {
        self.call(|response| Request::List { response }).await
    }

    /// Removes a node, its storage, its buffered rows and its subscribers.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the node does not exist
    /// - `Error::HasDependents` if views still read from it
    pub async fn remove(&self, id: impl Into<NodeId>) -> Result<()> {
        let id = id.into();
        self.call(|response| Request::Remove { id, response }).await
    }

    // =========================================================================
    // Ingest
    // =========================================================================

    /// Buffers rows for a table and waits until the flush holding them
    /// commits.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` for an unknown table
    /// - `Error::WrongKind` if the id names a view
    /// - `Error::InvalidRow` if any row does not fit the schema (nothing is
    ///   buffered)
    /// - `Error::EngineFailure` if the flush failed; the rows stay buffered
    ///   for the next flush
    /// - `Error::Destroyed` if the engine was destroyed first
    pub async fn update(&self, table: impl Into<NodeId>, rows: Vec<Row>) -> Result<()> {
        self.update_deferred(table, rows).await?.await
    }

    /// Buffers rows for a table without waiting for the flush.
    ///
    /// Validation errors are returned here; the flush outcome is delivered
    /// through the returned [`PendingUpdate`]. Several deferred updates inside
    /// one debounce window land in one flush.
    pub async fn update_deferred(
        &self,
        table: impl Into<NodeId>,
        rows: Vec<Row>,
    ) -> Result<PendingUpdate> {
        let table = table.into();
        let (done, flushed) = oneshot::channel();
        self.call(|accepted| Request::Update {
            table,
            rows,
            accepted,
            done,
        })
        .await?;
        Ok(PendingUpdate { flushed })
    }

    /// Flushes every table buffer now. Idempotent.
    pub async fn flush(&self) -> Result<()> {
        self.call(|response| Request::Flush { response }).await
    }

    /// Flushes every buffer and runs a refresh pass now.
    ///
    /// Returns once every triggered refresh has committed, so reads that
    /// follow see the newest ingest.
    pub async fn settle(&self) -> Result<()> {
        self.call(|response| Request::Settle { response }).await
    }

    /// Merges a table's delta log into its main table. Returns the rows moved.
    pub async fn compact(&self, table: impl Into<NodeId>) -> Result<usize> {
        let id = table.into();
        self.call(|response| Request::Compact { id, response }).await
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current rows of a node.
    ///
    /// Tables return their visible rows (main table plus delta log, with
    /// primary-key shadowing). Views return the result of their last
    /// successful refresh, in sort order.
    pub async fn query(&self, id: impl Into<NodeId>) -> Result<Vec<Row>> {
        let id = id.into();
        self.call(|response| Request::Query { id, response }).await
    }

    /// Number of rows [`Engine::query`] would return.
    pub async fn row_count(&self, id: impl Into<NodeId>) -> Result<usize> {
        let id = id.into();
        self.call(|response| Request::RowCount { id, response }).await
    }

    /// Refresh bookkeeping of a view.
    pub async fn view_status(&self, id: impl Into<NodeId>) -> Result<ViewStatus> {
        let id = id.into();
        self.call(|response| Request::ViewStatus { id, response }).await
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Calls `callback` with every delta of `node`.
    ///
    /// Subscribing to an unknown node, or after destroy, returns an inactive
    /// subscription that never fires. Callbacks run on the engine thread and
    /// must not block; a panicking callback is logged and skipped.
    pub fn subscribe<F>(&self, node: impl Into<NodeId>, callback: F) -> Subscription
    where
        F: Fn(&Delta) + Send + Sync + 'static,
    {
        self.bus.subscribe(&node.into(), callback)
    }

    /// Opens an async stream of `node`'s deltas.
    pub fn watch(&self, node: impl Into<NodeId>) -> ChangeStream {
        self.bus.watch(&node.into())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Stops the engine.
    ///
    /// Pending timers are cancelled, buffered rows are discarded (their
    /// waiters get `Error::Destroyed`), subscriptions end and the connection
    /// is closed once the engine thread exits. Idempotent; every later call on
    /// any clone returns `Error::Destroyed`.
    pub fn destroy(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            self.bus.close();
            self.shutdown.notify_one();
            info!("engine destroy requested");
        }
    }
}

// =============================================================================
// Pending Update
// =============================================================================

/// Outcome of a deferred update, resolved when its flush commits or fails.
///
/// Awaiting is optional: dropping the handle does not cancel the update.
#[derive(Debug)]
#[must_use = "dropping a PendingUpdate ignores the flush outcome"]
pub struct PendingUpdate {
    flushed: oneshot::Receiver<Result<()>>,
}

impl PendingUpdate {
    /// Returns the outcome if the flush already happened.
    pub fn try_result(&mut self) -> Option<Result<()>> {
        match self.flushed.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Destroyed)),
        }
    }
}

impl Future for PendingUpdate {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.flushed)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(Error::Destroyed)))
    }
}

// =============================================================================
// Tests
// =============================================================================
