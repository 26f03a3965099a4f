//! # Error Handling for GNode
//!
//! A single error enum ([`Error`]) covers every failure mode of the engine.
//! Callers match on the variant to decide whether a failure is structural
//! (their request was wrong) or transient (the SQL engine refused a statement).
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Structural | `AlreadyExists`, `NotFound`, `SourceNotFound`, `WrongKind`, `HasDependents` | Fix the call |
//! | Configuration | `InvalidConfig`, `InvalidRow` | Fix the schema, config or row |
//! | Engine | `EngineFailure`, `Io` | Log; the node stays dirty and is retried |
//! | Lifecycle | `Destroyed`, `SubscriptionLagged` | Stop using the handle / resubscribe |
//!
//! ## Why `EngineFailure` Carries an Intent
//!
//! Statements built by the ingest buffer embed user-provided literals. The error
//! therefore names what the engine was trying to do ("insert rows into delta
//! log") plus SQLite's message, never the statement text itself.

use thiserror::Error;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in GNode operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Structural Errors (returned synchronously at the call site)
    // =========================================================================

    /// A node with this id is already registered.
    ///
    /// The existing node and its data are left untouched.
    #[error("node '{0}' already exists")]
    AlreadyExists(String),

    /// No node with this id is registered.
    #[error("node '{0}' not found")]
    NotFound(String),

    /// A view was declared against a source that does not exist.
    #[error("view '{view}' references missing source '{source_id}'")]
    SourceNotFound {
        /// The view being created
        view: String,
        /// The source id that failed to resolve
        source_id: String,
    },

    /// A table-only operation was attempted on a view, or vice versa.
    ///
    /// # When This Happens
    ///
    /// - `update()` on a view id ("cannot update non-table")
    /// - `create_view()` whose source is itself a view (no view chaining)
    /// - `compact()` on a view id
    #[error("wrong node kind for '{id}': {reason}")]
    WrongKind {
        /// The node the operation targeted
        id: String,
        /// What was expected
        reason: String,
    },

    /// A node cannot be removed while views still read from it.
    #[error("node '{id}' still has dependents: {dependents:?}")]
    HasDependents {
        /// The node the caller tried to remove
        id: String,
        /// Views that must be removed first
        dependents: Vec<String>,
    },

    // =========================================================================
    // Configuration Errors
    // =========================================================================

    /// A table schema or view config is unusable.
    ///
    /// Covers empty aggregate maps, unsupported aggregate functions, unknown
    /// column types, and references to columns the source does not declare.
    /// Always reported when the node is created, never during refresh.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// A row handed to `update()` does not match the table schema.
    ///
    /// Rows are validated once, at the ingest boundary. Unknown columns and
    /// values of the wrong type are rejected instead of being inserted.
    #[error("invalid row for table '{table}': {reason}")]
    InvalidRow {
        /// The target table
        table: String,
        /// Which column was wrong and why
        reason: String,
    },

    // =========================================================================
    // Engine Errors (transient; affected nodes stay dirty)
    // =========================================================================

    /// The embedded SQL engine rejected a statement.
    #[error("engine failure while trying to {intent}: {message}")]
    EngineFailure {
        /// What the engine was doing, e.g. "insert rows into delta log"
        intent: &'static str,
        /// SQLite's error message
        message: String,
    },

    /// Opening or creating the database file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================

    /// The engine has been destroyed; the handle is no longer usable.
    #[error("engine has been destroyed")]
    Destroyed,

    /// A change stream fell behind and missed notifications.
    ///
    /// The number is how many deltas were dropped for this receiver.
    #[error("subscription lagged: missed {0} notifications")]
    SubscriptionLagged(u64),
}

impl Error {
    /// Builds an [`Error::EngineFailure`] from a SQLite error.
    pub fn engine(intent: &'static str, err: rusqlite::Error) -> Self {
        let message = match err {
            // keeps the statement text out of the message
            rusqlite::Error::SqlInputError { msg, .. } => msg,
            rusqlite::Error::SqliteFailure(code, Some(msg)) => format!("{msg} ({code})"),
            other => other.to_string(),
        };
        Error::EngineFailure { intent, message }
    }

    /// Returns true for errors caused by the caller's request rather than the engine.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::AlreadyExists(_)
                | Error::NotFound(_)
                | Error::SourceNotFound { .. }
                | Error::WrongKind { .. }
                | Error::HasDependents { .. }
                | Error::InvalidConfig(_)
                | Error::InvalidRow { .. }
        )
    }
}

/// Attaches an intent to a `rusqlite` result.
///
/// # Rust Pattern: Extension Trait
///
/// `rusqlite::Result` is a foreign type, so we cannot add inherent methods to
/// it. A small trait implemented for it gives call sites a `?`-friendly form:
///
/// ```rust,ignore
/// conn.execute_batch(&ddl).intent("create delta log")?;
/// ```
pub trait SqlIntent<T> {
    /// Converts the SQLite error (if any) into [`Error::EngineFailure`].
    fn intent(self, intent: &'static str) -> Result<T>;
}

impl<T> SqlIntent<T> for rusqlite::Result<T> {
    fn intent(self, intent: &'static str) -> Result<T> {
        self.map_err(|e| Error::engine(intent, e))
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
