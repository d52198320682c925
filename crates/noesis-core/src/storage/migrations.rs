//! Schema migrations for the embedded-file (SQLite) driver.
//!
//! Four tables, one per tier, matching §3/§6: `working_messages`,
//! `semantic_facts`, `episodic_events`, `procedural_patterns`. Indexes on
//! `(user_id)` and `(conversation_id, created_at DESC)` per §6; no
//! cross-table foreign keys except the nullable promotion back-reference.

/// A single forward-only schema migration.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "Four-tier memory schema: working, semantic, episodic, procedural",
        up: MIGRATION_V1_UP,
    },
    Migration {
        version: 2,
        description: "Track working-message access_count/last_accessed for Phase 1 promotion",
        up: MIGRATION_V2_UP,
    },
];

const MIGRATION_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS working_messages (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    role            TEXT NOT NULL,
    content         BLOB NOT NULL,
    created_at      TEXT NOT NULL,
    tags            TEXT NOT NULL DEFAULT '[]',
    importance_score REAL NOT NULL DEFAULT 0.0,
    extracted_entities TEXT,
    expires_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_working_user ON working_messages(user_id);
CREATE INDEX IF NOT EXISTS idx_working_conv_created
    ON working_messages(conversation_id, created_at DESC);

CREATE TABLE IF NOT EXISTS semantic_facts (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    key             TEXT NOT NULL,
    value           BLOB NOT NULL,
    entity_type     TEXT NOT NULL DEFAULT 'other',
    importance      REAL NOT NULL DEFAULT 0.0,
    access_count    INTEGER NOT NULL DEFAULT 0,
    last_accessed   TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    embedding       BLOB,
    embedding_scale REAL,
    embedding_offset REAL,
    deleted_at      TEXT,
    promoted_to     TEXT
);

CREATE INDEX IF NOT EXISTS idx_semantic_user ON semantic_facts(user_id);
CREATE INDEX IF NOT EXISTS idx_semantic_conv_created
    ON semantic_facts(conversation_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_semantic_user_key ON semantic_facts(user_id, key);

CREATE TABLE IF NOT EXISTS episodic_events (
    id              TEXT PRIMARY KEY,
    user_id         TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    content         BLOB NOT NULL,
    occurred_at     TEXT NOT NULL,
    decay_factor    REAL NOT NULL DEFAULT 1.0,
    embedding       BLOB,
    metadata        TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_episodic_user ON episodic_events(user_id);
CREATE INDEX IF NOT EXISTS idx_episodic_conv_occurred
    ON episodic_events(conversation_id, occurred_at DESC);
CREATE INDEX IF NOT EXISTS idx_episodic_user_type ON episodic_events(user_id, event_type);

CREATE VIRTUAL TABLE IF NOT EXISTS episodic_events_fts USING fts5(
    id UNINDEXED,
    content,
    content='',
    tokenize='porter unicode61'
);

CREATE TABLE IF NOT EXISTS procedural_patterns (
    id                    TEXT PRIMARY KEY,
    user_id               TEXT NOT NULL,
    name                  TEXT NOT NULL,
    description           TEXT NOT NULL,
    triggers              TEXT NOT NULL DEFAULT '[]',
    instruction_template  TEXT NOT NULL,
    confidence_threshold  REAL NOT NULL DEFAULT 0.5,
    usage_count           INTEGER NOT NULL DEFAULT 0,
    last_used             TEXT,
    success_count         INTEGER NOT NULL DEFAULT 0,
    failure_count         INTEGER NOT NULL DEFAULT 0,
    created_at            TEXT NOT NULL,
    embedding             BLOB
);

CREATE INDEX IF NOT EXISTS idx_procedural_user ON procedural_patterns(user_id);
CREATE INDEX IF NOT EXISTS idx_procedural_triggers ON procedural_patterns(triggers);
"#;

const MIGRATION_V2_UP: &str = r#"
ALTER TABLE working_messages ADD COLUMN access_count INTEGER NOT NULL DEFAULT 0;
ALTER TABLE working_messages ADD COLUMN last_accessed TEXT;
"#;

pub fn apply_migrations(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }
        conn.execute_batch(migration.up)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                chrono::Utc::now().to_rfc3339(),
            ],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn migrations_apply_cleanly_and_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, 1);
    }

    #[test]
    fn all_four_tier_tables_exist() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        for table in [
            "working_messages",
            "semantic_facts",
            "episodic_events",
            "procedural_patterns",
        ] {
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1)",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert!(exists, "missing table {table}");
        }
    }
}
