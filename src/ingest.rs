//! # Delta Ingest Buffer
//!
//! Rows handed to `update()` are validated, appended to a per-table buffer, and
//! written to the table's delta log in one statement when the buffer is
//! flushed.
//!
//! ## Flush Lifecycle
//!
//! ```text
//! update(rows) ──► validate ──► buffer.push(rows, waiter)
//!                                   │
//!                     debounce timer fires (or flush())
//!                                   │
//!                                   ▼
//!                 ┌───────────────────────────────────┐
//!                 │ BEGIN                             │
//!                 │   INSERT [OR REPLACE] INTO delta  │  one multi-row statement
//!                 │   merge + evict   (max_rows)      │
//!                 │   merge           (threshold)     │
//!                 │ COMMIT                            │
//!                 └───────────────────────────────────┘
//!                      │ ok                    │ err
//!                      ▼                       ▼
//!               waiters get Ok(())     rows go back to the front
//!               Delta returned         of the buffer, waiters get Err
//! ```
//!
//! The caller (the engine actor) marks the table and its dependents dirty
//! and schedules a refresh pass when a flush succeeds.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::error::{Error, Result, SqlIntent};
use crate::schema::{Database, TableLayout};
use crate::storage;
use crate::types::{current_time_ms, Delta, NodeId, Row, RowOp};

/// Resolved once the flush carrying a caller's rows commits or fails.
pub type Waiter = oneshot::Sender<Result<()>>;

/// Copies an error for every waiter of a failed flush.
fn error_for_waiter(err: &Error) -> Error {
    match err {
        Error::EngineFailure { intent, message } => Error::EngineFailure {
            intent,
            message: message.clone(),
        },
        Error::Destroyed => Error::Destroyed,
        other => Error::EngineFailure {
            intent: "flush buffered rows",
            message: other.to_string(),
        },
    }
}

// =============================================================================
// Per-Table State
// =============================================================================

/// Buffer, waiters and flush counter of one base table.
#[derive(Debug)]
pub struct TableState {
    pub layout: TableLayout,
    buffer: Vec<Row>,
    waiters: Vec<Waiter>,
    version: u64,
}

impl TableState {
    pub fn new(layout: TableLayout) -> Self {
        Self {
            layout,
            buffer: Vec::new(),
            waiters: Vec::new(),
            version: 0,
        }
    }

    /// Number of rows waiting for the next flush.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of successful, non-empty flushes so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Checks every row against the schema without buffering anything.
    pub fn validate(&self, id: &NodeId, rows: &[Row]) -> Result<()> {
        rows.iter()
            .try_for_each(|row| self.layout.schema.check_row(id, row))
    }

    /// Appends validated rows. An empty batch resolves its waiter at once.
    pub fn push(&mut self, rows: Vec<Row>, waiter: Option<Waiter>) {
        if rows.is_empty() {
            if let Some(w) = waiter {
                let _ = w.send(Ok(()));
            }
            return;
        }
        self.buffer.extend(rows);
        if let Some(w) = waiter {
            self.waiters.push(w);
        }
    }

    /// Writes the buffer to the delta log.
    ///
    /// Returns `Ok(None)` for an empty buffer (no write, no version bump), or
    /// the table's [`Delta`] on success.
    pub fn flush(
        &mut self,
        id: &NodeId,
        db: &mut Database,
        merge_threshold: usize,
    ) -> Result<Option<Delta>> {
        if self.buffer.is_empty() {
            for w in self.waiters.drain(..) {
                let _ = w.send(Ok(()));
            }
            return Ok(None);
        }

        let rows = std::mem::take(&mut self.buffer);
        let waiters = std::mem::take(&mut self.waiters);

        match self.write_batch(db, &rows, merge_threshold) {
            Ok(operations) => {
                self.version += 1;
                for w in waiters {
                    let _ = w.send(Ok(()));
                }
                debug!(table = %id, rows = rows.len(), version = self.version, "flushed");
                Ok(Some(Delta {
                    node: id.clone(),
                    version: self.version,
                    timestamp_ms: current_time_ms(),
                    operations,
                }))
            }
            Err(e) => {
                error!(table = %id, rows = rows.len(), error = %e, "flush failed");
                for w in waiters {
                    let _ = w.send(Err(error_for_waiter(&e)));
                }
                // rows pushed while the flush ran stay behind the failed batch
                let newer = std::mem::replace(&mut self.buffer, rows);
                self.buffer.extend(newer);
                Err(e)
            }
        }
    }

    /// Runs one flush inside a transaction and returns its row operations.
    fn write_batch(
        &self,
        db: &mut Database,
        rows: &[Row],
        merge_threshold: usize,
    ) -> Result<Vec<RowOp>> {
        let layout = &self.layout;
        let tx = db.conn_mut().transaction().intent("begin flush")?;

        let mut previous = match layout.primary_key() {
            Some(pk) => {
                let keys: Vec<_> = rows.iter().map(|r| r.get_or_null(pk)).collect();
                storage::lookup_by_keys(&tx, layout, &keys)?
            }
            None => HashMap::new(),
        };

        let row_ids = storage::append_to_delta(&tx, layout, rows)?;

        let mut operations: Vec<RowOp> = Vec::with_capacity(rows.len());
        for (row_id, row) in row_ids.into_iter().zip(rows) {
            let is_keyed = layout
                .primary_key()
                .is_some_and(|pk| !row.get_or_null(pk).is_null());
            let old = if is_keyed {
                previous.insert(row_id.clone(), row.clone())
            } else {
                None
            };
            operations.push(match old {
                Some(old) => RowOp::update(row_id, old, row.clone()),
                None => RowOp::insert(row_id, row.clone()),
            });
        }

        if let Some(max_rows) = layout.schema.max_rows {
            storage::merge_delta(&tx, layout)?;
            for (row_id, row) in storage::evict_oldest(&tx, layout, max_rows)? {
                operations.push(RowOp::delete(row_id, row));
            }
        } else if storage::delta_len(&tx, layout)? >= merge_threshold {
            let moved = storage::merge_delta(&tx, layout)?;
            debug!(table = %layout.main, moved, "merged delta log");
        }

        tx.commit().intent("commit flush")?;
        Ok(operations)
    }

    /// Moves the delta log into the main table.
    pub fn compact(&self, db: &mut Database) -> Result<usize> {
        let tx = db.conn_mut().transaction().intent("begin compaction")?;
        let moved = storage::merge_delta(&tx, &self.layout)?;
        tx.commit().intent("commit compaction")?;
        Ok(moved)
    }

    /// Drops buffered rows and fails their waiters with `reason`.
    pub fn discard(&mut self, reason: impl Fn() -> Error) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        for w in self.waiters.drain(..) {
            let _ = w.send(Err(reason()));
        }
        dropped
    }
}

// =============================================================================
// Tests
// =============================================================================
