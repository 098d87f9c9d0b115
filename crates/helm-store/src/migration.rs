//! One-shot import of the legacy one-file-per-record JSON layout into the
//! relational schema. Runs at startup before any store is used.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use glob::glob;
use serde_json::Value;
use tracing::{info, warn};

use crate::database::{Database, TxScope};
use crate::error::StoreError;

/// Completion marker: the import already ran (or there was nothing to run).
const DONE_MARKER: &str = "sqlite-migrated";
/// Evidence marker written by the legacy storage layer.
const LEGACY_MARKER: &str = "migration";

#[derive(Debug, Default)]
pub struct MigrationStats {
    pub projects: usize,
    pub sessions: usize,
    pub messages: usize,
    pub parts: usize,
    pub diffs: usize,
    pub todos: usize,
    pub permissions: usize,
    pub shares: usize,
    /// Per-record failures. These do not abort the import; the operator
    /// reconciles them from the logs.
    pub errors: Vec<String>,
}

/// Import the legacy layout under `storage_root`. Returns `None` when there
/// is nothing to do: the completion marker exists, or no legacy data was
/// ever written (the marker is created in that case too).
///
/// The whole import runs in one transaction: record-level problems are
/// collected and skipped, any unexpected failure rolls everything back.
/// Re-running with the marker removed is safe; inserts ignore conflicts.
pub fn migrate(db: &Database, storage_root: &Path) -> Result<Option<MigrationStats>, StoreError> {
    let done_marker = storage_root.join(DONE_MARKER);
    if done_marker.exists() {
        info!("legacy migration already completed");
        return Ok(None);
    }
    if !storage_root.join(LEGACY_MARKER).exists() {
        info!("no legacy storage found, skipping migration");
        std::fs::write(&done_marker, Utc::now().timestamp_millis().to_string())?;
        return Ok(None);
    }

    info!(root = %storage_root.display(), "starting legacy json migration");

    let stats = db.transaction(|tx| run_import(tx, storage_root))?;

    std::fs::write(&done_marker, Utc::now().timestamp_millis().to_string())?;

    info!(
        projects = stats.projects,
        sessions = stats.sessions,
        messages = stats.messages,
        parts = stats.parts,
        diffs = stats.diffs,
        todos = stats.todos,
        permissions = stats.permissions,
        shares = stats.shares,
        error_count = stats.errors.len(),
        "legacy migration complete"
    );
    if !stats.errors.is_empty() {
        warn!(errors = ?&stats.errors[..stats.errors.len().min(20)], "migration errors");
    }

    Ok(Some(stats))
}

fn run_import(tx: &TxScope<'_>, root: &Path) -> Result<MigrationStats, StoreError> {
    let mut stats = MigrationStats::default();
    let now = Utc::now().timestamp_millis();

    // Known IDs, so orphaned children are skipped instead of tripping FKs.
    let mut project_ids: HashSet<String> = HashSet::new();
    let mut session_ids: HashSet<String> = HashSet::new();
    let mut message_ids: HashSet<String> = HashSet::new();
    let mut message_session: HashMap<String, String> = HashMap::new();

    // Projects first, they have no dependencies.
    for file in scan(root, "project/*.json")? {
        let data = match read_record(&file) {
            Ok(data) => data,
            Err(err) => {
                stats.errors.push(format!("failed to migrate project {}: {err}", file.display()));
                continue;
            }
        };
        let Some(id) = str_field(&data, "id") else {
            stats.errors.push(format!("project missing id: {}", file.display()));
            continue;
        };
        project_ids.insert(id.to_string());
        tx.conn().execute(
            "INSERT OR IGNORE INTO project
                (id, worktree, vcs, name, time_created, time_updated, time_initialized)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                id,
                str_field(&data, "worktree").unwrap_or("/"),
                str_field(&data, "vcs"),
                str_field(&data, "name"),
                time_field(&data, "created").unwrap_or(now),
                time_field(&data, "updated").unwrap_or(now),
                time_field(&data, "initialized"),
            ],
        )?;
        stats.projects += 1;
    }
    info!(count = stats.projects, "migrated projects");

    // Sessions, skipping those whose project never made it.
    for file in scan(root, "session/*/*.json")? {
        let data = match read_record(&file) {
            Ok(data) => data,
            Err(err) => {
                stats.errors.push(format!("failed to migrate session {}: {err}", file.display()));
                continue;
            }
        };
        let (Some(id), Some(project_id)) = (str_field(&data, "id"), str_field(&data, "projectID"))
        else {
            stats.errors.push(format!("session missing id or projectID: {}", file.display()));
            continue;
        };
        if !project_ids.contains(project_id) {
            warn!(session_id = id, project_id, "skipping orphaned session");
            continue;
        }
        session_ids.insert(id.to_string());
        let summary = data.get("summary");
        let revert = data.get("revert");
        tx.conn().execute(
            "INSERT OR IGNORE INTO session (
                id, project_id, parent_id, slug, directory, title, version,
                share_url, summary_additions, summary_deletions, summary_files, summary_diffs,
                revert_message_id, revert_part_id, revert_snapshot, revert_diff, permission,
                time_created, time_updated, time_compacting, time_archived
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
            rusqlite::params![
                id,
                project_id,
                str_field(&data, "parentID"),
                str_field(&data, "slug").unwrap_or(""),
                str_field(&data, "directory").unwrap_or(""),
                str_field(&data, "title").unwrap_or(""),
                str_field(&data, "version").unwrap_or(""),
                data.pointer("/share/url").and_then(Value::as_str),
                summary.and_then(|s| s.get("additions")).and_then(Value::as_i64),
                summary.and_then(|s| s.get("deletions")).and_then(Value::as_i64),
                summary.and_then(|s| s.get("files")).and_then(Value::as_i64),
                summary
                    .and_then(|s| s.get("diffs"))
                    .filter(|v| !v.is_null())
                    .map(Value::to_string),
                revert.and_then(|r| r.get("messageID")).and_then(Value::as_str),
                revert.and_then(|r| r.get("partID")).and_then(Value::as_str),
                revert.and_then(|r| r.get("snapshot")).and_then(Value::as_str),
                revert.and_then(|r| r.get("diff")).and_then(Value::as_str),
                data.get("permission").filter(|v| !v.is_null()).map(Value::to_string),
                time_field(&data, "created").unwrap_or(now),
                time_field(&data, "updated").unwrap_or(now),
                time_field(&data, "compacting"),
                time_field(&data, "archived"),
            ],
        )?;
        stats.sessions += 1;
    }
    info!(count = stats.sessions, "migrated sessions");

    // Messages, skipping those whose session never made it.
    for file in scan(root, "message/*/*.json")? {
        let data = match read_record(&file) {
            Ok(data) => data,
            Err(err) => {
                stats.errors.push(format!("failed to migrate message {}: {err}", file.display()));
                continue;
            }
        };
        let (Some(id), Some(session_id)) = (str_field(&data, "id"), str_field(&data, "sessionID"))
        else {
            stats.errors.push(format!("message missing id or sessionID: {}", file.display()));
            continue;
        };
        if !session_ids.contains(session_id) {
            warn!(message_id = id, session_id, "skipping orphaned message");
            continue;
        }
        message_ids.insert(id.to_string());
        message_session.insert(id.to_string(), session_id.to_string());
        tx.conn().execute(
            "INSERT OR IGNORE INTO message (id, session_id, role, created_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id,
                session_id,
                str_field(&data, "role").unwrap_or("user"),
                time_field(&data, "created").unwrap_or(now),
                data.to_string(),
            ],
        )?;
        stats.messages += 1;
    }
    info!(count = stats.messages, "migrated messages");

    // Parts, skipping those whose message never made it.
    for file in scan(root, "part/*/*.json")? {
        let data = match read_record(&file) {
            Ok(data) => data,
            Err(err) => {
                stats.errors.push(format!("failed to migrate part {}: {err}", file.display()));
                continue;
            }
        };
        let (Some(id), Some(message_id)) = (str_field(&data, "id"), str_field(&data, "messageID"))
        else {
            stats.errors.push(format!("part missing id or messageID: {}", file.display()));
            continue;
        };
        if !message_ids.contains(message_id) {
            warn!(part_id = id, message_id, "skipping orphaned part");
            continue;
        }
        let session_id = &message_session[message_id];
        tx.conn().execute(
            "INSERT OR IGNORE INTO part (id, message_id, session_id, type, data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id,
                message_id,
                session_id,
                str_field(&data, "type").unwrap_or("text"),
                data.to_string(),
            ],
        )?;
        stats.parts += 1;
    }
    info!(count = stats.parts, "migrated parts");

    // Auxiliary tables, keyed by the owning entity's ID in the filename.
    stats.diffs = import_keyed(tx, root, "session_diff", &session_ids, &mut stats.errors)?;
    info!(count = stats.diffs, "migrated session diffs");

    stats.todos = import_keyed(tx, root, "todo", &session_ids, &mut stats.errors)?;
    info!(count = stats.todos, "migrated todos");

    stats.permissions = import_permissions(tx, root, &project_ids, &mut stats.errors)?;
    info!(count = stats.permissions, "migrated permissions");

    stats.shares = import_keyed(tx, root, "session_share", &session_ids, &mut stats.errors)?;
    info!(count = stats.shares, "migrated session shares");

    // Downloaded shares have no FK to check.
    for file in scan(root, "share/*.json")? {
        let Some(session_id) = stem(&file) else { continue };
        match read_record(&file) {
            Ok(data) => {
                tx.conn().execute(
                    "INSERT OR IGNORE INTO share (session_id, data) VALUES (?1, ?2)",
                    rusqlite::params![session_id, data.to_string()],
                )?;
            }
            Err(err) => {
                stats.errors.push(format!("failed to migrate share {}: {err}", file.display()));
            }
        }
    }

    Ok(stats)
}

/// Import one of the session-keyed auxiliary tables (`session_diff`, `todo`,
/// `session_share`): filename stem is the session ID, payload goes in as-is.
fn import_keyed(
    tx: &TxScope<'_>,
    root: &Path,
    table: &str,
    session_ids: &HashSet<String>,
    errors: &mut Vec<String>,
) -> Result<usize, StoreError> {
    let mut count = 0;
    for file in scan(root, &format!("{table}/*.json"))? {
        let Some(session_id) = stem(&file) else { continue };
        if !session_ids.contains(&session_id) {
            warn!(%session_id, table, "skipping orphaned record");
            continue;
        }
        match read_record(&file) {
            Ok(data) => {
                tx.conn().execute(
                    &format!("INSERT OR IGNORE INTO {table} (session_id, data) VALUES (?1, ?2)"),
                    rusqlite::params![session_id, data.to_string()],
                )?;
                count += 1;
            }
            Err(err) => {
                errors.push(format!("failed to migrate {table} {}: {err}", file.display()));
            }
        }
    }
    Ok(count)
}

fn import_permissions(
    tx: &TxScope<'_>,
    root: &Path,
    project_ids: &HashSet<String>,
    errors: &mut Vec<String>,
) -> Result<usize, StoreError> {
    let mut count = 0;
    for file in scan(root, "permission/*.json")? {
        let Some(project_id) = stem(&file) else { continue };
        if !project_ids.contains(&project_id) {
            warn!(%project_id, "skipping orphaned permission");
            continue;
        }
        match read_record(&file) {
            Ok(data) => {
                tx.conn().execute(
                    "INSERT OR IGNORE INTO permission (project_id, data) VALUES (?1, ?2)",
                    rusqlite::params![project_id, data.to_string()],
                )?;
                count += 1;
            }
            Err(err) => {
                errors.push(format!("failed to migrate permission {}: {err}", file.display()));
            }
        }
    }
    Ok(count)
}

/// Matching files under `root`, in alphabetical order.
fn scan(root: &Path, pattern: &str) -> Result<Vec<PathBuf>, StoreError> {
    let full = root.join(pattern);
    let pattern = full.to_string_lossy();
    let paths = glob(&pattern).map_err(|e| StoreError::Io(format!("bad glob {pattern}: {e}")))?;
    let mut files = Vec::new();
    for path in paths {
        files.push(path.map_err(|e| StoreError::Io(e.to_string()))?);
    }
    Ok(files)
}

fn read_record(file: &Path) -> Result<Value, StoreError> {
    let raw = std::fs::read_to_string(file)?;
    Ok(serde_json::from_str(&raw)?)
}

fn stem(file: &Path) -> Option<String> {
    file.file_stem().map(|s| s.to_string_lossy().into_owned())
}

fn str_field<'a>(data: &'a Value, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str)
}

fn time_field(data: &Value, key: &str) -> Option<i64> {
    data.pointer(&format!("/time/{key}")).and_then(Value::as_i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use helm_core::id::{self, Kind};
    use serde_json::json;

    struct Fixture {
        root: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let root = std::env::temp_dir()
                .join(format!("helm-migration-test-{}", id::ascending(Kind::Part)));
            for dir in [
                "project",
                "session/prj_fix",
                "message/ses_fix",
                "part/msg_fix",
                "session_diff",
                "todo",
                "permission",
                "session_share",
                "share",
            ] {
                std::fs::create_dir_all(root.join(dir)).unwrap();
            }
            std::fs::write(root.join(LEGACY_MARKER), "1").unwrap();
            Self { root }
        }

        fn write(&self, rel: &str, value: &Value) {
            std::fs::write(self.root.join(rel), serde_json::to_string(value).unwrap()).unwrap();
        }

        fn write_raw(&self, rel: &str, content: &str) {
            std::fs::write(self.root.join(rel), content).unwrap();
        }

        fn seed_basic(&self) {
            self.write(
                "project/prj_fix.json",
                &json!({
                    "id": "prj_fix",
                    "worktree": "/repo",
                    "vcs": "git",
                    "time": {"created": 1700000000000i64, "updated": 1700000001000i64}
                }),
            );
            self.write(
                "session/prj_fix/ses_fix.json",
                &json!({
                    "id": "ses_fix",
                    "projectID": "prj_fix",
                    "slug": "brisk-otter-1a2b",
                    "directory": "/repo",
                    "title": "Legacy session",
                    "version": "0.9.0",
                    "time": {"created": 1700000000000i64, "updated": 1700000001000i64}
                }),
            );
            self.write(
                "message/ses_fix/msg_fix.json",
                &json!({
                    "id": "msg_fix",
                    "sessionID": "ses_fix",
                    "role": "user",
                    "agent": "build",
                    "model": {"providerID": "anthropic", "modelID": "claude-sonnet-4-5"},
                    "time": {"created": 1700000000500i64}
                }),
            );
            self.write(
                "part/msg_fix/prt_fix.json",
                &json!({
                    "id": "prt_fix",
                    "messageID": "msg_fix",
                    "sessionID": "ses_fix",
                    "type": "text",
                    "text": "Hello, world!"
                }),
            );
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }

    fn count(db: &Database, table: &str) -> i64 {
        db.work(|tx| {
            Ok(tx
                .conn()
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
        })
        .unwrap()
    }

    #[test]
    fn migrates_all_entity_types() {
        let fixture = Fixture::new();
        fixture.seed_basic();
        fixture.write("session_diff/ses_fix.json", &json!([{"file": "a.rs", "additions": 1, "deletions": 0}]));
        fixture.write("todo/ses_fix.json", &json!([{"id": "1", "content": "do it", "status": "pending"}]));
        fixture.write("permission/prj_fix.json", &json!({"bash": "ask"}));
        fixture.write("session_share/ses_fix.json", &json!({"secret": "s", "url": "https://x"}));
        fixture.write("share/ses_other.json", &json!({"info": {"id": "ses_other"}}));

        let db = Database::in_memory().unwrap();
        let stats = migrate(&db, &fixture.root).unwrap().unwrap();

        assert_eq!(stats.projects, 1);
        assert_eq!(stats.sessions, 1);
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.parts, 1);
        assert_eq!(stats.diffs, 1);
        assert_eq!(stats.todos, 1);
        assert_eq!(stats.permissions, 1);
        assert_eq!(stats.shares, 1);
        assert!(stats.errors.is_empty());

        assert_eq!(count(&db, "session"), 1);
        assert_eq!(count(&db, "message"), 1);
        assert_eq!(count(&db, "part"), 1);
        assert_eq!(count(&db, "share"), 1);

        // The payload survives intact and the part got its session column.
        db.work(|tx| {
            let (session_id, data): (String, String) = tx.conn().query_row(
                "SELECT session_id, data FROM part WHERE id = 'prt_fix'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            assert_eq!(session_id, "ses_fix");
            let value: Value = serde_json::from_str(&data).unwrap();
            assert_eq!(value["text"], "Hello, world!");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn no_op_when_done_marker_exists() {
        let fixture = Fixture::new();
        fixture.seed_basic();
        std::fs::write(fixture.root.join(DONE_MARKER), "123").unwrap();
        let db = Database::in_memory().unwrap();
        assert!(migrate(&db, &fixture.root).unwrap().is_none());
        assert_eq!(count(&db, "session"), 0);
    }

    #[test]
    fn no_legacy_data_writes_marker_and_returns_none() {
        let root = std::env::temp_dir()
            .join(format!("helm-migration-empty-{}", id::ascending(Kind::Part)));
        std::fs::create_dir_all(&root).unwrap();
        let db = Database::in_memory().unwrap();
        assert!(migrate(&db, &root).unwrap().is_none());
        assert!(root.join(DONE_MARKER).exists());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn marker_written_even_with_record_errors() {
        let fixture = Fixture::new();
        fixture.seed_basic();
        fixture.write_raw("part/msg_fix/prt_broken.json", "not valid json");
        let db = Database::in_memory().unwrap();
        let stats = migrate(&db, &fixture.root).unwrap().unwrap();
        assert_eq!(stats.parts, 1);
        assert_eq!(stats.errors.len(), 1);
        assert!(fixture.root.join(DONE_MARKER).exists());
    }

    #[test]
    fn orphaned_session_is_skipped_not_fatal() {
        let fixture = Fixture::new();
        fixture.write(
            "session/prj_fix/ses_orphan.json",
            &json!({
                "id": "ses_orphan",
                "projectID": "prj_nowhere",
                "time": {"created": 1i64, "updated": 2i64}
            }),
        );
        let db = Database::in_memory().unwrap();
        let stats = migrate(&db, &fixture.root).unwrap().unwrap();
        assert_eq!(stats.sessions, 0);
        assert!(stats.errors.is_empty());
        assert_eq!(count(&db, "session"), 0);
    }

    #[test]
    fn orphaned_message_and_part_are_skipped() {
        let fixture = Fixture::new();
        fixture.seed_basic();
        fixture.write(
            "message/ses_fix/msg_orphan.json",
            &json!({"id": "msg_orphan", "sessionID": "ses_gone", "role": "user"}),
        );
        fixture.write(
            "part/msg_fix/prt_orphan.json",
            &json!({"id": "prt_orphan", "messageID": "msg_gone", "type": "text"}),
        );
        let db = Database::in_memory().unwrap();
        let stats = migrate(&db, &fixture.root).unwrap().unwrap();
        assert_eq!(stats.messages, 1);
        assert_eq!(stats.parts, 1);
        assert_eq!(count(&db, "message"), 1);
        assert_eq!(count(&db, "part"), 1);
    }

    #[test]
    fn missing_required_ids_collect_errors() {
        let fixture = Fixture::new();
        fixture.seed_basic();
        fixture.write("project/prj_broken.json", &json!({"name": "no id"}));
        fixture.write(
            "message/ses_fix/msg_noid.json",
            &json!({"sessionID": "ses_fix", "role": "user"}),
        );
        let db = Database::in_memory().unwrap();
        let stats = migrate(&db, &fixture.root).unwrap().unwrap();
        assert_eq!(stats.errors.len(), 2);
        assert_eq!(stats.projects, 1);
        assert_eq!(stats.messages, 1);
    }

    #[test]
    fn rerun_after_marker_removal_is_idempotent() {
        let fixture = Fixture::new();
        fixture.seed_basic();
        let db = Database::in_memory().unwrap();
        let first = migrate(&db, &fixture.root).unwrap().unwrap();

        std::fs::remove_file(fixture.root.join(DONE_MARKER)).unwrap();
        let second = migrate(&db, &fixture.root).unwrap().unwrap();

        assert_eq!(first.sessions, second.sessions);
        assert_eq!(first.messages, second.messages);
        assert_eq!(first.parts, second.parts);
        assert_eq!(count(&db, "project"), 1);
        assert_eq!(count(&db, "session"), 1);
        assert_eq!(count(&db, "message"), 1);
        assert_eq!(count(&db, "part"), 1);
    }

    #[test]
    fn migrated_rows_are_readable_through_the_stores() {
        let fixture = Fixture::new();
        fixture.seed_basic();
        let db = Database::in_memory().unwrap();
        migrate(&db, &fixture.root).unwrap().unwrap();

        let store = crate::session::SessionStore::new(db.clone(), "prj_fix", "/repo");
        let session = store.get("ses_fix").unwrap();
        assert_eq!(session.title, "Legacy session");
        let messages = store.messages("ses_fix", None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].parts.len(), 1);
    }
}
