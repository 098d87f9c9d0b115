use std::collections::{HashMap, HashSet, VecDeque};

use rusqlite::OptionalExtension;
use tracing::instrument;

use helm_core::event::Event;
use helm_core::message::{Message, MessageWithParts, Part};

use crate::database::{Database, TxScope};
use crate::error::StoreError;
use crate::row_helpers;

/// Page size for backward pagination. Reading the tail of a long session
/// touches only as many pages as the caller actually pulls.
const PAGE_SIZE: usize = 25;

/// Input to `update_part`: a full part, or a part plus the streaming delta
/// that was appended to it.
pub enum PartUpdate {
    Full(Part),
    Delta { part: Part, delta: String },
}

impl PartUpdate {
    pub fn full(part: Part) -> Self {
        Self::Full(part)
    }

    pub fn delta(part: Part, delta: impl Into<String>) -> Self {
        Self::Delta { part, delta: delta.into() }
    }
}

/// Append/update operations and streaming reads over messages and parts.
pub struct MessageLog {
    db: Database,
}

impl MessageLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Upsert a message by ID. An existing row keeps its key columns and
    /// gets its payload overwritten.
    #[instrument(skip(self, info), fields(message_id = %info.id()))]
    pub fn update_message(&self, info: Message) -> Result<Message, StoreError> {
        self.db.work(|tx| upsert_message(tx, &info))?;
        Ok(info)
    }

    #[instrument(skip(self))]
    pub fn remove_message(&self, session_id: &str, message_id: &str) -> Result<(), StoreError> {
        self.db.work(|tx| {
            tx.conn().execute("DELETE FROM message WHERE id = ?1", [message_id])?;
            tx.defer(Event::MessageRemoved {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
            });
            Ok(())
        })
    }

    /// Upsert a part by ID. Delta updates carry the appended text through
    /// the bus so subscribers can extend instead of re-rendering.
    #[instrument(skip(self, update))]
    pub fn update_part(&self, update: PartUpdate) -> Result<Part, StoreError> {
        let (part, delta) = match update {
            PartUpdate::Full(part) => (part, None),
            PartUpdate::Delta { part, delta } => {
                if !part.is_streaming() {
                    return Err(StoreError::Invalid(format!(
                        "delta update on non-streaming part kind {}",
                        part.type_name()
                    )));
                }
                (part, Some(delta))
            }
        };
        self.db.work(|tx| upsert_part(tx, &part, delta.as_deref()))?;
        Ok(part)
    }

    #[instrument(skip(self))]
    pub fn remove_part(
        &self,
        session_id: &str,
        message_id: &str,
        part_id: &str,
    ) -> Result<(), StoreError> {
        self.db.work(|tx| {
            tx.conn().execute("DELETE FROM part WHERE id = ?1", [part_id])?;
            tx.defer(Event::PartRemoved {
                session_id: session_id.to_string(),
                message_id: message_id.to_string(),
                part_id: part_id.to_string(),
            });
            Ok(())
        })
    }

    /// Lazy reverse-chronological stream of a session's messages. Each pull
    /// is served from an in-memory page; a fresh call starts a fresh cursor
    /// and a consumer may simply stop pulling at any point.
    pub fn stream(&self, session_id: &str) -> MessageStream {
        MessageStream::new(self.db.clone(), session_id)
    }

    /// Parts of one message, in ID (= creation) order.
    #[instrument(skip(self))]
    pub fn parts(&self, message_id: &str) -> Result<Vec<Part>, StoreError> {
        self.db.work(|tx| {
            let mut stmt = tx
                .conn()
                .prepare("SELECT data FROM part WHERE message_id = ?1 ORDER BY id")?;
            let rows = stmt.query_map([message_id], |row| row.get::<_, String>(0))?;
            let mut parts = Vec::new();
            for raw in rows {
                parts.push(row_helpers::parse_json::<Part>(&raw?, "part", "data")?);
            }
            Ok(parts)
        })
    }

    /// Point lookup of one message with its parts.
    #[instrument(skip(self))]
    pub fn get(&self, session_id: &str, message_id: &str) -> Result<MessageWithParts, StoreError> {
        self.db.work(|tx| {
            let raw: Option<String> = tx
                .conn()
                .query_row(
                    "SELECT data FROM message WHERE id = ?1 AND session_id = ?2",
                    [message_id, session_id],
                    |row| row.get(0),
                )
                .optional()?;
            let raw = raw.ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))?;
            let info = row_helpers::parse_json::<Message>(&raw, "message", "data")?;
            Ok(MessageWithParts { info, parts: self.parts(message_id)? })
        })
    }
}

pub(crate) fn upsert_message(tx: &TxScope<'_>, info: &Message) -> Result<(), StoreError> {
    let data = serde_json::to_string(info)?;
    tx.conn().execute(
        "INSERT INTO message (id, session_id, role, created_at, data)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET data = excluded.data",
        rusqlite::params![info.id(), info.session_id(), info.role_name(), info.created(), data],
    )?;
    tx.defer(Event::MessageUpdated { info: info.clone() });
    Ok(())
}

pub(crate) fn upsert_part(
    tx: &TxScope<'_>,
    part: &Part,
    delta: Option<&str>,
) -> Result<(), StoreError> {
    let data = serde_json::to_string(part)?;
    tx.conn().execute(
        "INSERT INTO part (id, message_id, session_id, type, data)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET data = excluded.data",
        rusqlite::params![part.id(), part.message_id(), part.session_id(), part.type_name(), data],
    )?;
    tx.defer(Event::PartUpdated {
        part: part.clone(),
        delta: delta.map(str::to_string),
    });
    Ok(())
}

/// Pull-based iterator over a session's messages, newest first. Paginates
/// backward by message ID with an exclusive upper-bound cursor and stops on
/// the first short page. No cursor or handle survives between pages.
pub struct MessageStream {
    db: Database,
    session_id: String,
    cursor: Option<String>,
    buffer: VecDeque<MessageWithParts>,
    done: bool,
}

impl MessageStream {
    pub(crate) fn new(db: Database, session_id: &str) -> Self {
        Self {
            db,
            session_id: session_id.to_string(),
            cursor: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    fn fetch_page(&mut self) -> Result<(), StoreError> {
        let session_id = self.session_id.clone();
        let cursor = self.cursor.clone();
        let page = self.db.work(|tx| {
            let mut stmt = tx.conn().prepare(
                "SELECT data FROM message
                 WHERE session_id = ?1 AND (?2 IS NULL OR id < ?2)
                 ORDER BY id DESC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![session_id, cursor, PAGE_SIZE as i64],
                |row| row.get::<_, String>(0),
            )?;
            let mut messages = Vec::new();
            for raw in rows {
                messages.push(row_helpers::parse_json::<Message>(&raw?, "message", "data")?);
            }

            let mut parts_by_message: HashMap<String, Vec<Part>> = HashMap::new();
            if !messages.is_empty() {
                let placeholders = vec!["?"; messages.len()].join(", ");
                let sql = format!(
                    "SELECT data FROM part WHERE message_id IN ({placeholders})
                     ORDER BY message_id, id"
                );
                let mut stmt = tx.conn().prepare(&sql)?;
                let ids: Vec<&str> = messages.iter().map(Message::id).collect();
                let rows = stmt.query_map(rusqlite::params_from_iter(ids), |row| {
                    row.get::<_, String>(0)
                })?;
                for raw in rows {
                    let part = row_helpers::parse_json::<Part>(&raw?, "part", "data")?;
                    parts_by_message
                        .entry(part.message_id().to_string())
                        .or_default()
                        .push(part);
                }
            }

            Ok(messages
                .into_iter()
                .map(|info| {
                    let parts = parts_by_message.remove(info.id()).unwrap_or_default();
                    MessageWithParts { info, parts }
                })
                .collect::<Vec<_>>())
        })?;

        if page.len() < PAGE_SIZE {
            self.done = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(last.info.id().to_string());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for MessageStream {
    type Item = Result<MessageWithParts, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(front) = self.buffer.pop_front() {
            return Some(Ok(front));
        }
        if self.done {
            return None;
        }
        if let Err(e) = self.fetch_page() {
            self.done = true;
            return Some(Err(e));
        }
        self.buffer.pop_front().map(Ok)
    }
}

/// Drain a newest-first stream and truncate everything before the most
/// recent completed compaction boundary: a user message carrying a
/// compaction part that a summarizing assistant message already answered.
/// Returns the survivors in chronological order.
pub fn filter_compacted(
    stream: impl IntoIterator<Item = Result<MessageWithParts, StoreError>>,
) -> Result<Vec<MessageWithParts>, StoreError> {
    let mut result = Vec::new();
    let mut completed: HashSet<String> = HashSet::new();
    for item in stream {
        let record = item?;
        let boundary = match &record.info {
            Message::User(user) => {
                completed.contains(&user.id)
                    && record.parts.iter().any(|p| matches!(p, Part::Compaction(_)))
            }
            Message::Assistant(assistant) => {
                if assistant.summary.unwrap_or(false) && assistant.finish.is_some() {
                    completed.insert(assistant.parent_id.clone());
                }
                false
            }
        };
        result.push(record);
        if boundary {
            break;
        }
    }
    result.reverse();
    Ok(result)
}
