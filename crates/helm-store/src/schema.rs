/// SQL DDL for the helm database, applied as an ordered migration journal.
/// WAL mode + foreign keys are set at connection time, before the journal.
pub struct Migration {
    pub sql: &'static str,
    pub timestamp: i64,
}

/// Ordered migration journal. Entries are applied exactly once, tracked by
/// timestamp in the `migrations` table. Append only; never edit an entry
/// that has shipped.
pub const JOURNAL: &[Migration] = &[Migration {
    timestamp: 1751328000000,
    sql: CREATE_TABLES,
}];

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA cache_size = -64000;
PRAGMA foreign_keys = ON;
"#;

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS project (
    id TEXT PRIMARY KEY,
    worktree TEXT NOT NULL,
    vcs TEXT,
    name TEXT,
    time_created INTEGER NOT NULL,
    time_updated INTEGER NOT NULL,
    time_initialized INTEGER
);

CREATE TABLE IF NOT EXISTS session (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    parent_id TEXT,
    slug TEXT NOT NULL,
    directory TEXT NOT NULL,
    title TEXT NOT NULL,
    version TEXT NOT NULL,
    share_url TEXT,
    summary_additions INTEGER,
    summary_deletions INTEGER,
    summary_files INTEGER,
    summary_diffs TEXT,
    revert_message_id TEXT,
    revert_part_id TEXT,
    revert_snapshot TEXT,
    revert_diff TEXT,
    permission TEXT,
    time_created INTEGER NOT NULL,
    time_updated INTEGER NOT NULL,
    time_compacting INTEGER,
    time_archived INTEGER
);

CREATE TABLE IF NOT EXISTS message (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL REFERENCES session(id) ON DELETE CASCADE,
    role TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS part (
    id TEXT PRIMARY KEY,
    message_id TEXT NOT NULL REFERENCES message(id) ON DELETE CASCADE,
    session_id TEXT NOT NULL REFERENCES session(id) ON DELETE CASCADE,
    type TEXT NOT NULL,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_diff (
    session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS todo (
    session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS permission (
    project_id TEXT PRIMARY KEY REFERENCES project(id),
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS session_share (
    session_id TEXT PRIMARY KEY REFERENCES session(id) ON DELETE CASCADE,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS share (
    session_id TEXT PRIMARY KEY,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_session_project ON session(project_id);
CREATE INDEX IF NOT EXISTS idx_session_parent ON session(parent_id);
CREATE INDEX IF NOT EXISTS idx_message_session ON message(session_id);
CREATE INDEX IF NOT EXISTS idx_part_message ON part(message_id);
CREATE INDEX IF NOT EXISTS idx_part_session ON part(session_id);
"#;
