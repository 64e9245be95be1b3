//! SQL schema for the case diff state store.
//!
//! Executed once at connection startup. Future migrations will be gated on
//! `PRAGMA user_version`.

/// Every table the store owns. Cloning refuses stores with other tables.
pub const TABLES: &[&str] = &[
  "entity_operations",
  "diff_queue",
  "diffed_ids",
  "key_value",
  "diffs",
  "changes",
  "counts",
  "missing_docs",
];

/// Full schema DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;

-- Operation counts per case. total can only grow.
CREATE TABLE IF NOT EXISTS entity_operations (
    id         TEXT PRIMARY KEY,
    total      INTEGER NOT NULL,
    processed  INTEGER NOT NULL DEFAULT 0
);

-- Cases waiting to be diffed; survives restarts.
CREATE TABLE IF NOT EXISTS diff_queue (
    id  TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS diffed_ids (
    id  TEXT PRIMARY KEY
);

-- Flags and resume state; value is JSON text.
CREATE TABLE IF NOT EXISTS key_value (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);

-- One row per document with diffs; payload is a JSON array.
-- A document without diffs has no row.
CREATE TABLE IF NOT EXISTS diffs (
    kind         TEXT NOT NULL,
    doc_id       TEXT NOT NULL,
    payload      TEXT NOT NULL,
    recorded_at  TEXT NOT NULL,
    PRIMARY KEY (kind, doc_id)
);

CREATE TABLE IF NOT EXISTS changes (
    kind         TEXT NOT NULL,
    doc_id       TEXT NOT NULL,
    payload      TEXT NOT NULL,
    recorded_at  TEXT NOT NULL,
    PRIMARY KEY (kind, doc_id)
);

-- Number of documents diffed per kind.
CREATE TABLE IF NOT EXISTS counts (
    kind   TEXT PRIMARY KEY,
    value  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS missing_docs (
    kind    TEXT NOT NULL,
    doc_id  TEXT NOT NULL,
    PRIMARY KEY (kind, doc_id)
);

CREATE INDEX IF NOT EXISTS entity_operations_unprocessed_idx
    ON entity_operations(id) WHERE processed < total;

PRAGMA user_version = 1;
";
