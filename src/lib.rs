//! # GNode - Incremental View Engine
//!
//! GNode keeps aggregate views over row tables up to date as rows stream in.
//! It provides:
//!
//! - **Tables**: typed row sets with an optional upsert key and sliding window
//! - **Views**: pivot + aggregate + filter + sort over one table, stored as
//!   their own SQL tables
//! - **Debounced ingest**: bursts of updates coalesce into one flush, bursts of
//!   flushes into one refresh pass
//! - **Change notifications**: per-node deltas to callbacks and async streams
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │        (Engine, ViewHandle, subscribe/watch, PendingUpdate)     │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │  mpsc + oneshot
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Engine Actor                             │
//! │            (single thread, owns the connection)                 │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐  │
//! │  │   Ingest    │  │  Scheduler  │  │  Node Store             │  │
//! │  │   Buffers   │─►│  (Kahn)     │◄─│  (edges, dirty flags)   │  │
//! │  └─────────────┘  └──────┬──────┘  └─────────────────────────┘  │
//! │                          │ materialize + diff                   │
//! │                          ▼                                      │
//! │                  Notification Bus ──► callbacks, ChangeStreams  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          SQLite                                 │
//! │       t_<id> (main) · t_<id>__delta (delta log) · v_<id>        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Acyclic graph**: views read only tables, and edges that would close a
//!    cycle are refused
//! 2. **Dependency order**: a pass refreshes a node only after everything it
//!    depends on
//! 3. **Atomic refresh**: a view's rows are replaced in one transaction, so a
//!    reader sees the old rows or the new ones
//! 4. **One timer each**: at most one pending flush per table and one pending
//!    pass per engine
//! 5. **No SQL in errors**: failures carry an intent and SQLite's message
//!
//! ## Module Organization
//!
//! - [`error`]: Error type and SQLite error mapping
//! - [`types`]: Node ids, values, rows, schemas, view configs, deltas
//! - [`sql`]: Identifier quoting and literal escaping
//! - [`schema`]: Database open and physical table DDL
//! - [`storage`]: Row reads and writes against main tables and delta logs
//! - [`graph`]: Node registry, dependency edges and dirty flags
//! - [`ingest`]: Per-table row buffers and flushes
//! - [`materialize`]: View query building and output schemas
//! - [`scheduler`]: Refresh passes and view deltas
//! - [`subscription`]: Notification bus, subscriptions and change streams
//! - [`config`]: Engine configuration
//! - [`api`]: Async API (main entry point)
//! - [`view`]: View handles

pub mod error;

pub mod types;

pub mod sql;

/// SQLite database initialization and physical table management.
pub mod schema;

/// Row-level reads and writes.
///
/// Every function here runs against a borrowed connection or transaction, so
/// callers decide transaction scope.
pub mod storage;

pub mod graph;

pub mod ingest;

pub mod materialize;

pub mod scheduler;

/// Change notifications.
///
/// Callbacks run synchronously on the engine thread after each flush or
/// refresh; change streams read the same deltas from a broadcast channel.
pub mod subscription;

pub mod config;

mod actor;

/// Async API for GNode.
///
/// The main entry point is [`Engine`](api::Engine).
pub mod api;

pub mod view;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{Engine, PendingUpdate};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use graph::NodeDescriptor;
pub use scheduler::{RefreshState, ViewStatus};
pub use subscription::{ChangeStream, Subscription};
pub use view::ViewHandle;

pub use types::{
    AggregateFn, ColumnDef, ColumnType, Delta, Filter, FilterOp, FilterValue, NodeId, NodeKind,
    OpType, Row, RowOp, SortDirection, SortKey, TableSchema, Value, ViewConfig,
};
