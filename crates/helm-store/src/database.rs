use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use rusqlite::{Connection, OptionalExtension};
use tracing::{error, info};

use helm_core::event::{Bus, Event, NullBus};

use crate::error::StoreError;
use crate::schema;

/// Shared handle to the single SQLite connection, plus the ambient scope
/// machinery that defers bus publishes until a write is durable.
///
/// The connection sits behind a re-entrant mutex: a store operation running
/// inside a scope can call other store operations on the same thread without
/// deadlocking, and those nested calls join the outermost scope instead of
/// opening their own.
pub struct Database {
    inner: Arc<Inner>,
}

struct Inner {
    conn: ReentrantMutex<Connection>,
    scope: Mutex<ScopeState>,
    bus: Arc<dyn Bus>,
    path: PathBuf,
}

#[derive(Default)]
struct ScopeState {
    depth: usize,
    in_txn: bool,
    effects: Vec<Event>,
}

/// Ambient scope handed to `work`/`transaction` callbacks. Queries go
/// through `conn()`; `defer` queues a bus publish that fires only after the
/// outermost scope completes successfully.
pub struct TxScope<'a> {
    conn: &'a Connection,
    db: &'a Database,
}

impl<'a> TxScope<'a> {
    pub fn conn(&self) -> &Connection {
        self.conn
    }

    pub fn db(&self) -> &Database {
        self.db
    }

    /// Queue an event. It is published after the surrounding write commits;
    /// if the scope unwinds or rolls back, the event is discarded.
    pub fn defer(&self, event: Event) {
        self.db.inner.scope.lock().effects.push(event);
    }
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path, bus: Arc<dyn Bus>) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let conn =
            Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;
        Self::prepare(&conn)?;

        info!(path = %path.display(), "database opened");

        Ok(Self {
            inner: Arc::new(Inner {
                conn: ReentrantMutex::new(conn),
                scope: Mutex::new(ScopeState::default()),
                bus,
                path: path.to_owned(),
            }),
        })
    }

    /// In-memory database with a null bus (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::in_memory_with_bus(Arc::new(NullBus))
    }

    /// In-memory database publishing to the given bus (for testing).
    pub fn in_memory_with_bus(bus: Arc<dyn Bus>) -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Database(e.to_string()))?;
        Self::prepare(&conn)?;

        Ok(Self {
            inner: Arc::new(Inner {
                conn: ReentrantMutex::new(conn),
                scope: Mutex::new(ScopeState::default()),
                bus,
                path: PathBuf::from(":memory:"),
            }),
        })
    }

    fn prepare(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        apply_journal(conn)
    }

    /// Run `f` against the current connection. Effects queued via `defer`
    /// run after the outermost scope on this thread completes successfully.
    pub fn work<T>(
        &self,
        f: impl FnOnce(&TxScope<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let result;
        let effects;
        {
            let conn = self.inner.conn.lock();
            self.inner.scope.lock().depth += 1;
            result = f(&TxScope { conn: &*conn, db: self });
            effects = self.leave(result.is_ok());
        }
        for event in effects {
            self.inner.bus.publish(event);
        }
        result
    }

    /// Run `f` inside a transaction. If a transaction is already active on
    /// this thread, the callback joins it instead of opening a new one, so
    /// a high-level operation wrapping several store calls is atomic as a
    /// whole. COMMIT happens before any queued effect is published.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&TxScope<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut result;
        let effects;
        {
            let conn = self.inner.conn.lock();
            let began = {
                let mut scope = self.inner.scope.lock();
                scope.depth += 1;
                if scope.in_txn {
                    false
                } else {
                    scope.in_txn = true;
                    true
                }
            };

            if began {
                if let Err(e) = conn.execute_batch("BEGIN") {
                    let mut scope = self.inner.scope.lock();
                    scope.depth -= 1;
                    scope.in_txn = false;
                    return Err(e.into());
                }
            }

            result = f(&TxScope { conn: &*conn, db: self });

            if began {
                if result.is_ok() {
                    if let Err(e) = conn.execute_batch("COMMIT") {
                        result = Err(e.into());
                    }
                } else if let Err(e) = conn.execute_batch("ROLLBACK") {
                    error!(error = %e, "rollback failed");
                }
                self.inner.scope.lock().in_txn = false;
            }
            effects = self.leave(result.is_ok());
        }
        for event in effects {
            self.inner.bus.publish(event);
        }
        result
    }

    /// Pop one scope level; at the outermost level, hand back the queued
    /// effects on success or drop them on failure.
    fn leave(&self, ok: bool) -> Vec<Event> {
        let mut scope = self.inner.scope.lock();
        scope.depth -= 1;
        if scope.depth > 0 {
            return Vec::new();
        }
        if ok {
            std::mem::take(&mut scope.effects)
        } else {
            scope.effects.clear();
            Vec::new()
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

/// Apply every journal entry that has not run yet, oldest first. Each entry
/// runs in its own transaction and is recorded in the `migrations` table.
fn apply_journal(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (
            timestamp INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )
    .map_err(|e| StoreError::Database(format!("migrations table: {e}")))?;

    for migration in schema::JOURNAL {
        let applied: Option<i64> = conn
            .query_row(
                "SELECT timestamp FROM migrations WHERE timestamp = ?1",
                [migration.timestamp],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Database(format!("journal lookup: {e}")))?;
        if applied.is_some() {
            continue;
        }

        conn.execute_batch("BEGIN")
            .map_err(|e| StoreError::Database(format!("journal begin: {e}")))?;
        let outcome = conn.execute_batch(migration.sql).and_then(|_| {
            conn.execute(
                "INSERT INTO migrations (timestamp, applied_at) VALUES (?1, ?2)",
                rusqlite::params![migration.timestamp, Utc::now().timestamp_millis()],
            )
            .map(|_| ())
        });
        match outcome {
            Ok(()) => conn
                .execute_batch("COMMIT")
                .map_err(|e| StoreError::Database(format!("journal commit: {e}")))?,
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(StoreError::Database(format!(
                    "migration {} failed: {e}",
                    migration.timestamp
                )));
            }
        }
    }
    Ok(())
}
