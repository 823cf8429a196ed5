/// Schema for the offline database.
pub const SCHEMA: &str = r#"
-- Cached responses, one row per (partition, request)
CREATE TABLE IF NOT EXISTS cache_entries (
    partition_name TEXT NOT NULL,
    key_hash TEXT NOT NULL,
    request_url TEXT NOT NULL,
    status INTEGER NOT NULL,
    content_type TEXT,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL,
    PRIMARY KEY (partition_name, key_hash)
);

-- Partitions exist independently of their entries (an opened partition may be empty)
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
);

-- Mutations waiting for the remote API to accept them
CREATE TABLE IF NOT EXISTS pending_mutations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_mutations_kind
    ON pending_mutations(kind, seq);
"#;
