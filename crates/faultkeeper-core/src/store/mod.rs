//! `SQLite`-backed control-store adapter.
//!
//! The control store is shared with the external test harness: the harness
//! writes the singleton `control` row (work counter, target size, desired
//! inject flag) and a store-side trigger appends a row to `events` whenever
//! the inject flag changes value. This adapter reads the control row,
//! drains the event queue in order, and acknowledges consumed events.
//!
//! The store is the single source of truth for desired state; this process
//! never writes the control row, only the event lifecycle columns.

// SQLite returns i64 for row IDs and counts, but they're always
// non-negative here.
#![allow(clippy::cast_sign_loss)]

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags, TransactionBehavior, params};
use thiserror::Error;
use tracing::debug;


/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Errors that can occur during control-store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panicking thread.
    #[error("control store connection lock poisoned")]
    LockPoisoned,

    /// An event row carried an unrecognized type tag.
    #[error("unknown change-event kind: {kind}")]
    UnknownEventKind {
        /// The unrecognized type tag.
        kind: String,
    },

    /// A blocking database task failed to complete.
    #[error("database task failed: {0}")]
    Task(String),
}

/// The kind of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The desired inject flag changed value.
    InjectChanged,
}

impl ChangeKind {
    /// The type tag stored in the `events.event_type` column.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InjectChanged => "inject_changed",
        }
    }

    fn parse(kind: &str) -> Result<Self, StoreError> {
        match kind {
            "inject_changed" => Ok(Self::InjectChanged),
            other => Err(StoreError::UnknownEventKind {
                kind: other.to_string(),
            }),
        }
    }
}

/// A durable record of one desired-state transition.
///
/// Created by the store-side trigger; consumed exactly once by the
/// reconciliation loop (applied, then acknowledged).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Unique, increasing row ID.
    pub id: i64,

    /// Event kind.
    pub kind: ChangeKind,

    /// Inject value before the transition.
    pub old_value: i64,

    /// Inject value after the transition.
    pub new_value: i64,

    /// ISO-8601 timestamp with millisecond precision, assigned by the
    /// trigger. Lexicographic order equals time order.
    pub timestamp: String,

    /// Whether the convergence action for this event already ran.
    ///
    /// A processed-but-undeleted row is a crash-recovery window: the
    /// action ran but acknowledgement didn't finish. The next drain sweeps
    /// such rows instead of redelivering them.
    pub processed: bool,
}

/// Desired-state snapshot from the singleton control row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    /// Units of work the harness has completed so far. Monotonic.
    pub count: i64,

    /// Completion threshold; the engine drains once `count` reaches it.
    pub target: i64,
}

/// Handle to the shared control database.
///
/// Cheap to clone; all clones share one connection behind a mutex. Blocking
/// `SQLite` calls have `_async` wrappers that run under `spawn_blocking` so
/// the control loop never stalls the tokio runtime.
#[derive(Clone)]
pub struct ControlStore {
    conn: Arc<Mutex<Connection>>,
}

impl ControlStore {
    /// Opens (or creates) the control database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open_with_flags(
            path.as_ref(),
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Applies the embedded schema: control table with seed row, event
    /// queue, change-capture trigger, WAL journal mode.
    ///
    /// Idempotent; called on every startup.
    ///
    /// # Errors
    ///
    /// Returns an error if any schema statement fails.
    pub fn initialize(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(SCHEMA_SQL)?;
        debug!("control-store schema initialized");
        Ok(())
    }

    /// Reads the singleton control row.
    ///
    /// # Errors
    ///
    /// Returns an error if the row is missing or the read fails.
    pub fn read_state(&self) -> Result<ControlState, StoreError> {
        let conn = self.lock()?;
        let state = conn.query_row(
            "SELECT count, data_size FROM control WHERE id = 1",
            [],
            |row| {
                Ok(ControlState {
                    count: row.get(0)?,
                    target: row.get(1)?,
                })
            },
        )?;
        Ok(state)
    }

    /// Drains all unprocessed change events, oldest first.
    ///
    /// Runs inside one deferred transaction so the result is a consistent
    /// snapshot even while the harness is writing. Processed-but-undeleted
    /// rows (an acknowledgement interrupted between its two steps) are
    /// swept first: their convergence action already ran, only the delete
    /// is owed. Events are ordered by `(timestamp, id)` ascending; the ID
    /// breaks ties when two transitions land in the same millisecond.
    /// Returns an empty vec when the queue is empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the query or transaction fails.
    pub fn drain_events(&self) -> Result<Vec<ChangeEvent>, StoreError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Deferred)?;

        let swept = tx.execute("DELETE FROM events WHERE processed = 1", [])?;
        if swept > 0 {
            debug!(swept, "swept processed event rows");
        }

        let events = {
            let mut stmt = tx.prepare(
                "SELECT id, event_type, old_value, new_value, timestamp, processed
                 FROM events
                 WHERE processed = 0
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?;

            let mut events = Vec::new();
            for row in rows {
                let (id, kind, old_value, new_value, timestamp, processed) = row?;
                events.push(ChangeEvent {
                    id,
                    kind: ChangeKind::parse(&kind)?,
                    old_value,
                    new_value,
                    timestamp,
                    processed: processed != 0,
                });
            }
            events
        };

        tx.commit()?;
        Ok(events)
    }

    /// Acknowledges a consumed event: mark `processed=1`, then delete.
    ///
    /// The two steps are deliberately separate statements, not one
    /// transaction. A crash between them leaves a processed-but-undeleted
    /// row, signalling that the convergence action already ran; the next
    /// drain sweeps it (never redelivering it) and a later acknowledgement
    /// of the same ID is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if either statement fails.
    pub fn acknowledge_event(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("UPDATE events SET processed = 1 WHERE id = ?1", params![id])?;
        conn.execute("DELETE FROM events WHERE id = ?1", params![id])?;
        debug!(event_id = id, "change event acknowledged");
        Ok(())
    }

    /// Async wrapper for [`Self::read_state`] via `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the blocking task panics.
    pub async fn read_state_async(&self) -> Result<ControlState, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.read_state())
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Async wrapper for [`Self::drain_events`] via `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Returns an error if the drain fails or the blocking task panics.
    pub async fn drain_events_async(&self) -> Result<Vec<ChangeEvent>, StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.drain_events())
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    /// Async wrapper for [`Self::acknowledge_event`] via `spawn_blocking`.
    ///
    /// # Errors
    ///
    /// Returns an error if the acknowledgement fails or the task panics.
    pub async fn acknowledge_event_async(&self, id: i64) -> Result<(), StoreError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.acknowledge_event(id))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

impl std::fmt::Debug for ControlStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlStore").finish_non_exhaustive()
    }
}
