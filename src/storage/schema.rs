//! Document store schema

// One JSON body per (collection, key)
pub const CREATE_DOCUMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    doc_key TEXT NOT NULL,
    body TEXT NOT NULL,              -- JSON snapshot
    updated_at BIGINT NOT NULL,      -- Unix millis of the last write
    PRIMARY KEY (collection, doc_key)
)
"#;

pub const UPSERT_DOCUMENT: &str = r#"
INSERT INTO documents (collection, doc_key, body, updated_at)
VALUES (?, ?, ?, ?)
ON CONFLICT (collection, doc_key) DO UPDATE SET
    body = excluded.body,
    updated_at = excluded.updated_at
"#;

pub const SELECT_DOCUMENT: &str =
    "SELECT body FROM documents WHERE collection = ? AND doc_key = ?";
