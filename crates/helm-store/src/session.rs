use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::OptionalExtension;
use tracing::{debug, error, info, instrument, warn};

use helm_core::event::Event;
use helm_core::id::{self, Kind};
use helm_core::message::{Message, MessageWithParts};
use helm_core::session::{
    default_title, FileDiff, Revert, Session, SessionSummary, SessionTime, ShareInfo, ShareRef,
};
use helm_core::slug;

use crate::database::{Database, TxScope};
use crate::error::StoreError;
use crate::message::{self as message_log, MessageStream};
use crate::row_helpers;

/// Sharing policy from configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareMode {
    Disabled,
    Manual,
    Auto,
}

/// External collaborator that owns the remote half of sharing. Its failures
/// must never corrupt local state.
pub trait ShareClient: Send + Sync {
    fn create(&self, session_id: &str) -> Result<ShareInfo, StoreError>;
    fn remove(&self, session_id: &str) -> Result<(), StoreError>;
}

/// Placeholder client used until a real collaborator is wired up.
pub struct NoShare;

impl ShareClient for NoShare {
    fn create(&self, _session_id: &str) -> Result<ShareInfo, StoreError> {
        Err(StoreError::Share("no sharing collaborator configured".into()))
    }

    fn remove(&self, _session_id: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Inputs for `create`. Everything is optional; an ID is only supplied when
/// re-creating an imported session.
#[derive(Default)]
pub struct CreateSession {
    pub id: Option<String>,
    pub parent_id: Option<String>,
    pub title: Option<String>,
    pub directory: Option<String>,
    pub permission: Option<serde_json::Value>,
}

/// Remote share payload accepted by `import_share`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SharePayload {
    pub info: Session,
    pub messages: Vec<MessageWithParts>,
}

/// CRUD and lifecycle operations over sessions for one project.
pub struct SessionStore {
    db: Database,
    project_id: String,
    directory: String,
    share_mode: ShareMode,
    share_client: Arc<dyn ShareClient>,
}

impl SessionStore {
    pub fn new(db: Database, project_id: impl Into<String>, directory: impl Into<String>) -> Self {
        Self {
            db,
            project_id: project_id.into(),
            directory: directory.into(),
            share_mode: ShareMode::Manual,
            share_client: Arc::new(NoShare),
        }
    }

    pub fn with_sharing(mut self, mode: ShareMode, client: Arc<dyn ShareClient>) -> Self {
        self.share_mode = mode;
        self.share_client = client;
        self
    }

    fn new_session_info(&self, input: CreateSession) -> Session {
        let now = Utc::now().timestamp_millis();
        let is_child = input.parent_id.is_some();
        Session {
            id: input.id.unwrap_or_else(|| id::descending(Kind::Session)),
            slug: slug::create(),
            project_id: self.project_id.clone(),
            directory: input.directory.unwrap_or_else(|| self.directory.clone()),
            parent_id: input.parent_id,
            title: input.title.unwrap_or_else(|| default_title(is_child)),
            version: env!("CARGO_PKG_VERSION").to_string(),
            summary: None,
            share: None,
            revert: None,
            permission: input.permission,
            time: SessionTime { created: now, updated: now, compacting: None, archived: None },
        }
    }

    /// Create a session. Publishes Created then Updated. If auto-share is
    /// configured and this is a top-level session, sharing is attempted and
    /// its failure swallowed: creation never fails because sharing failed.
    #[instrument(skip(self, input))]
    pub fn create(&self, input: CreateSession) -> Result<Session, StoreError> {
        let info = self.new_session_info(input);
        info!(id = %info.id, parent = ?info.parent_id, "session created");
        self.db.work(|tx| {
            insert_session(tx, &info)?;
            tx.defer(Event::SessionCreated { info: info.clone() });
            tx.defer(Event::SessionUpdated { info: info.clone() });
            Ok(())
        })?;
        if info.parent_id.is_none() && self.share_mode == ShareMode::Auto {
            if let Err(error) = self.share(&info.id) {
                warn!(id = %info.id, %error, "auto-share failed");
            }
        }
        Ok(info)
    }

    /// Clone the history of `session_id` into a fresh session, keeping only
    /// messages with ID strictly smaller than `until_message_id` when given.
    /// Messages are replayed in ascending ID order so an assistant's parent
    /// is always cloned before the message that references it.
    #[instrument(skip(self))]
    pub fn fork(
        &self,
        session_id: &str,
        until_message_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        let info = self.new_session_info(CreateSession::default());
        self.db.transaction(|tx| {
            insert_session(tx, &info)?;
            tx.defer(Event::SessionCreated { info: info.clone() });
            tx.defer(Event::SessionUpdated { info: info.clone() });

            let mut id_map: HashMap<String, String> = HashMap::new();
            for record in self.messages(session_id, None)? {
                if let Some(cut) = until_message_id {
                    if record.info.id() >= cut {
                        break;
                    }
                }
                let new_id = id::ascending(Kind::Message);
                id_map.insert(record.info.id().to_string(), new_id.clone());

                let mut cloned = record.info.clone();
                cloned.set_id(new_id.clone());
                cloned.set_session_id(info.id.clone());
                if let Message::Assistant(assistant) = &mut cloned {
                    if let Some(mapped) = id_map.get(&assistant.parent_id) {
                        assistant.parent_id = mapped.clone();
                    }
                }
                message_log::upsert_message(tx, &cloned)?;

                for part in &record.parts {
                    let mut part = part.clone();
                    part.set_id(id::ascending(Kind::Part));
                    part.set_message_id(new_id.clone());
                    part.set_session_id(info.id.clone());
                    message_log::upsert_part(tx, &part, None)?;
                }
            }
            Ok(())
        })?;
        Ok(info)
    }

    #[instrument(skip(self))]
    pub fn get(&self, session_id: &str) -> Result<Session, StoreError> {
        self.db.work(|tx| get_session(tx, session_id))
    }

    /// Bump `time.updated` without touching anything else.
    #[instrument(skip(self))]
    pub fn touch(&self, session_id: &str) -> Result<Session, StoreError> {
        self.db.work(|tx| {
            let changed = tx.conn().execute(
                "UPDATE session SET time_updated = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().timestamp_millis(), session_id],
            )?;
            finish_update(tx, session_id, changed)
        })
    }

    #[instrument(skip(self, title))]
    pub fn set_title(&self, session_id: &str, title: &str) -> Result<Session, StoreError> {
        self.db.work(|tx| {
            let changed = tx.conn().execute(
                "UPDATE session SET title = ?1, time_updated = ?2 WHERE id = ?3",
                rusqlite::params![title, Utc::now().timestamp_millis(), session_id],
            )?;
            finish_update(tx, session_id, changed)
        })
    }

    #[instrument(skip(self, permission))]
    pub fn set_permission(
        &self,
        session_id: &str,
        permission: serde_json::Value,
    ) -> Result<Session, StoreError> {
        self.db.work(|tx| {
            let changed = tx.conn().execute(
                "UPDATE session SET permission = ?1, time_updated = ?2 WHERE id = ?3",
                rusqlite::params![
                    serde_json::to_string(&permission)?,
                    Utc::now().timestamp_millis(),
                    session_id
                ],
            )?;
            finish_update(tx, session_id, changed)
        })
    }

    #[instrument(skip(self, summary))]
    pub fn set_summary(
        &self,
        session_id: &str,
        summary: Option<&SessionSummary>,
    ) -> Result<Session, StoreError> {
        self.db.work(|tx| {
            let diffs = summary
                .and_then(|s| s.diffs.as_ref())
                .map(serde_json::to_string)
                .transpose()?;
            let changed = tx.conn().execute(
                "UPDATE session SET
                    summary_additions = ?1,
                    summary_deletions = ?2,
                    summary_files = ?3,
                    summary_diffs = ?4,
                    time_updated = ?5
                 WHERE id = ?6",
                rusqlite::params![
                    summary.map(|s| s.additions as i64),
                    summary.map(|s| s.deletions as i64),
                    summary.map(|s| s.files as i64),
                    diffs,
                    Utc::now().timestamp_millis(),
                    session_id
                ],
            )?;
            finish_update(tx, session_id, changed)
        })
    }

    #[instrument(skip(self, revert, summary))]
    pub fn set_revert(
        &self,
        session_id: &str,
        revert: Option<&Revert>,
        summary: Option<&SessionSummary>,
    ) -> Result<Session, StoreError> {
        self.db.work(|tx| {
            let changed = tx.conn().execute(
                "UPDATE session SET
                    revert_message_id = ?1,
                    revert_part_id = ?2,
                    revert_snapshot = ?3,
                    revert_diff = ?4,
                    summary_additions = ?5,
                    summary_deletions = ?6,
                    summary_files = ?7,
                    time_updated = ?8
                 WHERE id = ?9",
                rusqlite::params![
                    revert.map(|r| r.message_id.clone()),
                    revert.and_then(|r| r.part_id.clone()),
                    revert.and_then(|r| r.snapshot.clone()),
                    revert.and_then(|r| r.diff.clone()),
                    summary.map(|s| s.additions as i64),
                    summary.map(|s| s.deletions as i64),
                    summary.map(|s| s.files as i64),
                    Utc::now().timestamp_millis(),
                    session_id
                ],
            )?;
            finish_update(tx, session_id, changed)
        })
    }

    #[instrument(skip(self))]
    pub fn clear_revert(&self, session_id: &str) -> Result<Session, StoreError> {
        self.db.work(|tx| {
            let changed = tx.conn().execute(
                "UPDATE session SET
                    revert_message_id = NULL,
                    revert_part_id = NULL,
                    revert_snapshot = NULL,
                    revert_diff = NULL,
                    time_updated = ?1
                 WHERE id = ?2",
                rusqlite::params![Utc::now().timestamp_millis(), session_id],
            )?;
            finish_update(tx, session_id, changed)
        })
    }

    /// Set or clear the archived timestamp.
    #[instrument(skip(self))]
    pub fn set_archived(
        &self,
        session_id: &str,
        time: Option<i64>,
    ) -> Result<Session, StoreError> {
        self.db.work(|tx| {
            let changed = tx.conn().execute(
                "UPDATE session SET time_archived = ?1 WHERE id = ?2",
                rusqlite::params![time, session_id],
            )?;
            finish_update(tx, session_id, changed)
        })
    }

    /// Obtain a share URL from the collaborator and persist it.
    #[instrument(skip(self))]
    pub fn share(&self, session_id: &str) -> Result<ShareInfo, StoreError> {
        if self.share_mode == ShareMode::Disabled {
            return Err(StoreError::SharingDisabled);
        }
        let share = self.share_client.create(session_id)?;
        self.db.work(|tx| {
            let changed = tx.conn().execute(
                "UPDATE session SET share_url = ?1, time_updated = ?2 WHERE id = ?3",
                rusqlite::params![share.url, Utc::now().timestamp_millis(), session_id],
            )?;
            finish_update(tx, session_id, changed)?;
            Ok(())
        })?;
        Ok(share)
    }

    /// Remove the remote share and clear the stored URL.
    #[instrument(skip(self))]
    pub fn unshare(&self, session_id: &str) -> Result<Session, StoreError> {
        self.share_client.remove(session_id)?;
        self.db.work(|tx| {
            let changed = tx.conn().execute(
                "UPDATE session SET share_url = NULL, time_updated = ?1 WHERE id = ?2",
                rusqlite::params![Utc::now().timestamp_millis(), session_id],
            )?;
            finish_update(tx, session_id, changed)
        })
    }

    /// Stored remote share payload for a session, if any.
    #[instrument(skip(self))]
    pub fn get_share(&self, session_id: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.db.work(|tx| {
            let raw: Option<String> = tx
                .conn()
                .query_row(
                    "SELECT data FROM share WHERE session_id = ?1",
                    [session_id],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|raw| row_helpers::parse_json(&raw, "share", "data")).transpose()
        })
    }

    /// Remove a session and its whole subtree: children depth-first, then a
    /// best-effort unshare, then the row itself (cascade covers messages and
    /// parts). Individual failures are logged, never thrown, so a partial
    /// tree removal does not abort a bulk operation.
    #[instrument(skip(self))]
    pub fn remove(&self, session_id: &str) {
        if let Err(err) = self.try_remove(session_id) {
            error!(id = %session_id, error = %err, "failed to remove session");
        }
    }

    fn try_remove(&self, session_id: &str) -> Result<(), StoreError> {
        let info = self.get(session_id)?;
        for child in self.children(session_id)? {
            self.remove(&child.id);
        }
        if let Err(err) = self.unshare(session_id) {
            debug!(id = %session_id, error = %err, "unshare during removal failed");
        }
        self.db.work(|tx| {
            tx.conn().execute("DELETE FROM session WHERE id = ?1", [session_id])?;
            tx.defer(Event::SessionDeleted { info: info.clone() });
            Ok(())
        })
    }

    /// The most recent `limit` messages (or all of them), chronologically.
    pub fn messages(
        &self,
        session_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<MessageWithParts>, StoreError> {
        let mut result = Vec::new();
        for item in MessageStream::new(self.db.clone(), session_id) {
            if limit.is_some_and(|limit| result.len() >= limit) {
                break;
            }
            result.push(item?);
        }
        result.reverse();
        Ok(result)
    }

    /// All sessions of this project, in physical storage order.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<Session>, StoreError> {
        self.db.work(|tx| {
            let mut stmt = tx
                .conn()
                .prepare(&format!("SELECT {SESSION_COLUMNS} FROM session WHERE project_id = ?1"))?;
            let mut rows = stmt.query([&self.project_id])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
    }

    /// Direct children only.
    #[instrument(skip(self))]
    pub fn children(&self, parent_id: &str) -> Result<Vec<Session>, StoreError> {
        self.db.work(|tx| {
            let mut stmt = tx
                .conn()
                .prepare(&format!("SELECT {SESSION_COLUMNS} FROM session WHERE parent_id = ?1"))?;
            let mut rows = stmt.query([parent_id])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }
            Ok(sessions)
        })
    }

    /// Cached file-diff summary for a session, or empty.
    #[instrument(skip(self))]
    pub fn diff(&self, session_id: &str) -> Result<Vec<FileDiff>, StoreError> {
        self.db.work(|tx| {
            let raw: Option<String> = tx
                .conn()
                .query_row(
                    "SELECT data FROM session_diff WHERE session_id = ?1",
                    [session_id],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(raw) => row_helpers::parse_json(&raw, "session_diff", "data"),
                None => Ok(Vec::new()),
            }
        })
    }

    /// Persist the file-diff summary that `diff` serves and publish it.
    #[instrument(skip(self, diffs))]
    pub fn set_diff(&self, session_id: &str, diffs: Vec<FileDiff>) -> Result<(), StoreError> {
        self.db.work(|tx| {
            tx.conn().execute(
                "INSERT INTO session_diff (session_id, data) VALUES (?1, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET data = excluded.data",
                rusqlite::params![session_id, serde_json::to_string(&diffs)?],
            )?;
            tx.defer(Event::SessionDiff { session_id: session_id.to_string(), diff: diffs.clone() });
            Ok(())
        })
    }

    /// Re-insert a downloaded share payload through the same upsert paths as
    /// native writes. Idempotent by entity ID.
    #[instrument(skip(self, payload), fields(session_id = %payload.info.id))]
    pub fn import_share(&self, payload: &SharePayload) -> Result<Session, StoreError> {
        self.db.transaction(|tx| {
            let inserted = insert_session_ignoring_conflict(tx, &payload.info)?;
            if inserted {
                tx.defer(Event::SessionCreated { info: payload.info.clone() });
                tx.defer(Event::SessionUpdated { info: payload.info.clone() });
            }
            tx.conn().execute(
                "INSERT INTO share (session_id, data) VALUES (?1, ?2)
                 ON CONFLICT(session_id) DO UPDATE SET data = excluded.data",
                rusqlite::params![payload.info.id, serde_json::to_string(payload)?],
            )?;
            for record in &payload.messages {
                message_log::upsert_message(tx, &record.info)?;
                for part in &record.parts {
                    message_log::upsert_part(tx, part, None)?;
                }
            }
            Ok(payload.info.clone())
        })
    }
}

const SESSION_COLUMNS: &str = "id, project_id, parent_id, slug, directory, title, version, \
     share_url, summary_additions, summary_deletions, summary_files, summary_diffs, \
     revert_message_id, revert_part_id, revert_snapshot, revert_diff, permission, \
     time_created, time_updated, time_compacting, time_archived";

fn insert_session(tx: &TxScope<'_>, info: &Session) -> Result<(), StoreError> {
    insert_session_sql(tx, info, "INSERT")?;
    Ok(())
}

fn insert_session_ignoring_conflict(tx: &TxScope<'_>, info: &Session) -> Result<bool, StoreError> {
    insert_session_sql(tx, info, "INSERT OR IGNORE")
}

fn insert_session_sql(tx: &TxScope<'_>, info: &Session, verb: &str) -> Result<bool, StoreError> {
    let summary_diffs = info
        .summary
        .as_ref()
        .and_then(|s| s.diffs.as_ref())
        .map(serde_json::to_string)
        .transpose()?;
    let permission = info.permission.as_ref().map(serde_json::to_string).transpose()?;
    let changed = tx.conn().execute(
        &format!(
            "{verb} INTO session (
                id, project_id, parent_id, slug, directory, title, version,
                share_url, summary_additions, summary_deletions, summary_files, summary_diffs,
                revert_message_id, revert_part_id, revert_snapshot, revert_diff, permission,
                time_created, time_updated, time_compacting, time_archived
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)"
        ),
        rusqlite::params![
            info.id,
            info.project_id,
            info.parent_id,
            info.slug,
            info.directory,
            info.title,
            info.version,
            info.share.as_ref().map(|s| s.url.clone()),
            info.summary.as_ref().map(|s| s.additions as i64),
            info.summary.as_ref().map(|s| s.deletions as i64),
            info.summary.as_ref().map(|s| s.files as i64),
            summary_diffs,
            info.revert.as_ref().map(|r| r.message_id.clone()),
            info.revert.as_ref().and_then(|r| r.part_id.clone()),
            info.revert.as_ref().and_then(|r| r.snapshot.clone()),
            info.revert.as_ref().and_then(|r| r.diff.clone()),
            permission,
            info.time.created,
            info.time.updated,
            info.time.compacting,
            info.time.archived,
        ],
    )?;
    Ok(changed > 0)
}

fn get_session(tx: &TxScope<'_>, session_id: &str) -> Result<Session, StoreError> {
    let mut stmt = tx
        .conn()
        .prepare(&format!("SELECT {SESSION_COLUMNS} FROM session WHERE id = ?1"))?;
    let mut rows = stmt.query([session_id])?;
    match rows.next()? {
        Some(row) => row_to_session(row),
        None => Err(StoreError::NotFound(format!("session {session_id}"))),
    }
}

/// Shared tail of every single-row update: NotFound when nothing matched,
/// otherwise reload the fresh row and queue the Updated event.
fn finish_update(
    tx: &TxScope<'_>,
    session_id: &str,
    changed: usize,
) -> Result<Session, StoreError> {
    if changed == 0 {
        return Err(StoreError::NotFound(format!("session {session_id}")));
    }
    let info = get_session(tx, session_id)?;
    tx.defer(Event::SessionUpdated { info: info.clone() });
    Ok(info)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let summary_additions: Option<i64> = row_helpers::get_opt(row, 8, "session", "summary_additions")?;
    let summary_deletions: Option<i64> = row_helpers::get_opt(row, 9, "session", "summary_deletions")?;
    let summary_files: Option<i64> = row_helpers::get_opt(row, 10, "session", "summary_files")?;
    let summary_diffs: Option<String> = row_helpers::get_opt(row, 11, "session", "summary_diffs")?;
    let summary = if summary_additions.is_some() || summary_deletions.is_some() || summary_files.is_some()
    {
        Some(SessionSummary {
            additions: summary_additions.unwrap_or(0) as u64,
            deletions: summary_deletions.unwrap_or(0) as u64,
            files: summary_files.unwrap_or(0) as u64,
            diffs: summary_diffs
                .map(|raw| row_helpers::parse_json(&raw, "session", "summary_diffs"))
                .transpose()?,
        })
    } else {
        None
    };

    let revert = row_helpers::get_opt::<String>(row, 12, "session", "revert_message_id")?.map(
        |message_id| -> Result<Revert, StoreError> {
            Ok(Revert {
                message_id,
                part_id: row_helpers::get_opt(row, 13, "session", "revert_part_id")?,
                snapshot: row_helpers::get_opt(row, 14, "session", "revert_snapshot")?,
                diff: row_helpers::get_opt(row, 15, "session", "revert_diff")?,
            })
        },
    );

    Ok(Session {
        id: row_helpers::get(row, 0, "session", "id")?,
        project_id: row_helpers::get(row, 1, "session", "project_id")?,
        parent_id: row_helpers::get_opt(row, 2, "session", "parent_id")?,
        slug: row_helpers::get(row, 3, "session", "slug")?,
        directory: row_helpers::get(row, 4, "session", "directory")?,
        title: row_helpers::get(row, 5, "session", "title")?,
        version: row_helpers::get(row, 6, "session", "version")?,
        share: row_helpers::get_opt::<String>(row, 7, "session", "share_url")?
            .map(|url| ShareRef { url }),
        summary,
        revert: revert.transpose()?,
        permission: row_helpers::get_opt::<String>(row, 16, "session", "permission")?
            .map(|raw| row_helpers::parse_json(&raw, "session", "permission"))
            .transpose()?,
        time: SessionTime {
            created: row_helpers::get(row, 17, "session", "time_created")?,
            updated: row_helpers::get(row, 18, "session", "time_updated")?,
            compacting: row_helpers::get_opt(row, 19, "session", "time_compacting")?,
            archived: row_helpers::get_opt(row, 20, "session", "time_archived")?,
        },
    })
}
