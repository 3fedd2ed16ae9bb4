#![allow(dead_code)]

use std::sync::LazyLock;

use sqlite_access::prelude::*;
use tempfile::TempDir;

pub const V1: &str = "
CREATE TABLE categories (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    rank INTEGER NOT NULL DEFAULT 0,
    featured INTEGER NOT NULL DEFAULT 0
);
CREATE VIRTUAL TABLE categories_fts USING fts5(name);
!!CREATE_FTS_SYNC_TRIGGERS(categories, categories_fts);
";

pub const V2: &str = "
CREATE TABLE tags (
    id TEXT PRIMARY KEY,
    label TEXT NOT NULL
);
CREATE TABLE category_tags (
    category_id TEXT NOT NULL REFERENCES categories (id) ON DELETE CASCADE,
    tag_id TEXT NOT NULL REFERENCES tags (id) ON DELETE CASCADE,
    PRIMARY KEY (category_id, tag_id)
);
ALTER TABLE categories ADD COLUMN created_at TEXT;
!!CREATE_ISO_TIMESTAMP_TRIGGERS('categories', 'created_at');
";

pub fn scripts() -> Vec<MigrationScript> {
    vec![MigrationScript::new(1, V1), MigrationScript::new(2, V2)]
}

/// Temporary database file; keep the `TempDir` alive for the duration of the test.
pub fn temp_db(prefix: &str) -> (TempDir, String) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(format!("{prefix}.sqlite"));
    (dir, path.to_string_lossy().into_owned())
}

pub fn options(path: &str) -> SqliteOptionsBuilder {
    SqliteOptions::builder(path)
        .worker_count(4)
        .migration_scripts(scripts())
}

pub async fn open_db(prefix: &str) -> (TempDir, Database) {
    let (dir, path) = temp_db(prefix);
    let db = Database::open(options(&path).finish())
        .await
        .expect("open database");
    (dir, db)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub rank: i64,
    pub featured: bool,
}

fn text(row: &CustomDbRow, column: &str) -> String {
    row.get(column)
        .and_then(RowValues::as_text)
        .unwrap_or_default()
        .to_owned()
}

pub static CATEGORY: LazyLock<SqlEntity<Category>> = LazyLock::new(|| {
    SqlEntity::new(
        "categories",
        ["id", "name", "rank", "featured", "created_at"],
        |row| {
            Ok(Category {
                id: text(row, "id"),
                name: text(row, "name"),
                rank: row.get("rank").and_then(RowValues::as_int).copied().unwrap_or(0),
                featured: row.get("featured").and_then(RowValues::as_bool).unwrap_or(false),
            })
        },
    )
});

#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub id: String,
    pub label: String,
}

pub static TAG: LazyLock<SqlEntity<Tag>> = LazyLock::new(|| {
    SqlEntity::new("tags", ["id", "label"], |row| {
        Ok(Tag {
            id: text(row, "id"),
            label: text(row, "label"),
        })
    })
});

pub fn record(pairs: &[(&str, RowValues)]) -> Record {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}
