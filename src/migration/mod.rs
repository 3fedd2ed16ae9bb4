//! Versioned schema migrations.
//!
//! Scripts are named `v<N>.sql` and applied in ascending order. Each pending script runs in its
//! own `BEGIN IMMEDIATE` transaction together with the SQL generated by its macro lines, and the
//! transaction also stores the new version in `PRAGMA user_version`. A failing script rolls back
//! and aborts the run.

pub mod macros;
pub mod triggers;

use std::path::{Path, PathBuf};

use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, info};

pub use macros::{MacroCall, MacroKind, split_macros};
pub use triggers::FtsKind;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("cannot read migrations from {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("migration file name {0:?} does not match v<N>.sql")]
    BadFileName(String),

    #[error("migration version {0} is defined more than once")]
    DuplicateVersion(u32),

    #[error("migration v{version}: unknown macro {name}")]
    UnknownMacro { version: u32, name: String },

    #[error("migration v{version}: macro {name} expects {expected} arguments, got {got}")]
    MacroArity {
        version: u32,
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("migration v{version}: macro {name} has invalid argument {argument:?}")]
    BadMacroArgument {
        version: u32,
        name: String,
        argument: String,
    },

    #[error("FTS table {0} does not exist or has no columns")]
    MissingFtsTable(String),

    #[error("migration v{version} failed: {source}")]
    Script {
        version: u32,
        #[source]
        source: Box<MigrationError>,
    },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// A versioned migration script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    pub version: u32,
    pub sql: String,
}

impl MigrationScript {
    #[must_use]
    pub fn new(version: u32, sql: impl Into<String>) -> Self {
        Self {
            version,
            sql: sql.into(),
        }
    }

    /// Version encoded in a `v<N>.sql` file name.
    #[must_use]
    pub fn version_from_file_name(name: &str) -> Option<u32> {
        name.strip_prefix('v')?.strip_suffix(".sql")?.parse().ok()
    }
}

/// Where a pool finds its migrations.
#[derive(Debug, Clone, Default)]
pub enum MigrationSource {
    #[default]
    None,
    Directory(PathBuf),
    Scripts(Vec<MigrationScript>),
}

impl MigrationSource {
    /// Load and validate the scripts.
    ///
    /// # Errors
    /// See [`Migrator::from_dir`] and [`Migrator::from_scripts`].
    pub fn load(&self) -> Result<Migrator, MigrationError> {
        match self {
            MigrationSource::None => Migrator::from_scripts(Vec::new()),
            MigrationSource::Directory(path) => Migrator::from_dir(path),
            MigrationSource::Scripts(scripts) => Migrator::from_scripts(scripts.clone()),
        }
    }
}

#[derive(Debug, Clone)]
struct PreparedMigration {
    version: u32,
    body: String,
    macros: Vec<MacroCall>,
}

/// Outcome of [`Migrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    pub from: u32,
    pub to: u32,
    pub applied: Vec<u32>,
}

/// Parsed, ordered migration set.
#[derive(Debug, Clone, Default)]
pub struct Migrator {
    migrations: Vec<PreparedMigration>,
}

impl Migrator {
    /// Load every `*.sql` file of `dir`. Other files are ignored.
    ///
    /// # Errors
    /// Returns [`MigrationError::ReadDir`] if the directory or a file cannot be read,
    /// [`MigrationError::BadFileName`] for `.sql` files not named `v<N>.sql`, plus the errors of
    /// [`Migrator::from_scripts`].
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let dir = dir.as_ref();
        let read_err = |source| MigrationError::ReadDir {
            path: dir.to_path_buf(),
            source,
        };
        let mut scripts = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(read_err)? {
            let path = entry.map_err(read_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                continue;
            }
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_owned();
            let version = MigrationScript::version_from_file_name(&name)
                .ok_or_else(|| MigrationError::BadFileName(name.clone()))?;
            let sql = std::fs::read_to_string(&path).map_err(read_err)?;
            scripts.push(MigrationScript { version, sql });
        }
        Self::from_scripts(scripts)
    }

    /// Validate and order in-memory scripts.
    ///
    /// # Errors
    /// Returns [`MigrationError::DuplicateVersion`] or any macro parsing error.
    pub fn from_scripts(mut scripts: Vec<MigrationScript>) -> Result<Self, MigrationError> {
        scripts.sort_by_key(|s| s.version);
        let mut migrations: Vec<PreparedMigration> = Vec::with_capacity(scripts.len());
        for script in scripts {
            if migrations.last().is_some_and(|m| m.version == script.version) {
                return Err(MigrationError::DuplicateVersion(script.version));
            }
            let (body, macros) = split_macros(script.version, &script.sql)?;
            migrations.push(PreparedMigration {
                version: script.version,
                body,
                macros,
            });
        }
        Ok(Self { migrations })
    }

    #[must_use]
    pub fn latest_version(&self) -> u32 {
        self.migrations.last().map_or(0, |m| m.version)
    }

    /// Versions greater than `current`, ascending.
    #[must_use]
    pub fn pending(&self, current: u32) -> Vec<u32> {
        self.migrations
            .iter()
            .map(|m| m.version)
            .filter(|v| *v > current)
            .collect()
    }

    /// Apply every pending migration.
    ///
    /// The stored version is re-read inside each transaction, so concurrent runners against the
    /// same file apply each version once.
    ///
    /// # Errors
    /// Returns [`MigrationError::Script`] for the first failing version; that version's
    /// transaction is rolled back and later versions are not attempted.
    pub fn run(&self, conn: &mut Connection) -> Result<MigrationReport, MigrationError> {
        let from = current_version(conn)?;
        let mut applied = Vec::new();

        for migration in self.migrations.iter().filter(|m| m.version > from) {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let version = current_version(&tx)?;
            if migration.version <= version {
                debug!(version = migration.version, "migration already applied");
                continue;
            }

            info!(
                from = version,
                to = migration.version,
                "updating database from v{version} to v{}",
                migration.version
            );
            apply(&tx, migration).map_err(|source| MigrationError::Script {
                version: migration.version,
                source: Box::new(source),
            })?;
            tx.commit()?;
            applied.push(migration.version);
        }

        let to = current_version(conn)?;
        Ok(MigrationReport { from, to, applied })
    }
}

fn apply(conn: &Connection, migration: &PreparedMigration) -> Result<(), MigrationError> {
    conn.execute_batch(&migration.body)?;
    for call in &migration.macros {
        let script = call.expand(conn)?;
        conn.execute_batch(&script)?;
    }
    conn.execute_batch(&format!("PRAGMA user_version = {}", migration.version))?;
    Ok(())
}

/// Schema version stored in `PRAGMA user_version`.
///
/// # Errors
/// Returns the driver error if the pragma cannot be read.
pub fn current_version(conn: &Connection) -> Result<u32, MigrationError> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(u32::try_from(version).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scripts() -> Vec<MigrationScript> {
        vec![
            MigrationScript::new(2, "ALTER TABLE t ADD COLUMN b TEXT;"),
            MigrationScript::new(1, "CREATE TABLE t (id INTEGER PRIMARY KEY, a TEXT);"),
        ]
    }

    #[test]
    fn file_names() {
        assert_eq!(MigrationScript::version_from_file_name("v12.sql"), Some(12));
        assert_eq!(MigrationScript::version_from_file_name("12.sql"), None);
        assert_eq!(MigrationScript::version_from_file_name("v1.txt"), None);
    }

    #[test]
    fn orders_numerically_and_rejects_duplicates() {
        let mut all = scripts();
        all.push(MigrationScript::new(10, "SELECT 1;"));
        let migrator = Migrator::from_scripts(all).expect("valid");
        assert_eq!(migrator.pending(0), vec![1, 2, 10]);
        assert_eq!(migrator.pending(2), vec![10]);
        assert_eq!(migrator.latest_version(), 10);

        let mut dup = scripts();
        dup.push(MigrationScript::new(2, "SELECT 1;"));
        assert!(matches!(
            Migrator::from_scripts(dup),
            Err(MigrationError::DuplicateVersion(2))
        ));
    }

    #[test]
    fn applies_pending_and_skips_applied() {
        let mut conn = Connection::open_in_memory().expect("open");
        let migrator = Migrator::from_scripts(scripts()).expect("valid");
        let report = migrator.run(&mut conn).expect("migrate");
        assert_eq!(report, MigrationReport { from: 0, to: 2, applied: vec![1, 2] });

        let again = migrator.run(&mut conn).expect("migrate again");
        assert!(again.applied.is_empty());
        assert_eq!(again.to, 2);
    }

    #[test]
    fn failing_script_rolls_back_its_version() {
        let mut conn = Connection::open_in_memory().expect("open");
        let mut all = scripts();
        all.push(MigrationScript::new(
            3,
            "CREATE TABLE u (id INTEGER);\nINSERT INTO missing VALUES (1);",
        ));
        let migrator = Migrator::from_scripts(all).expect("valid");
        let err = migrator.run(&mut conn).expect_err("v3 fails");
        assert!(matches!(err, MigrationError::Script { version: 3, .. }));
        assert_eq!(current_version(&conn).expect("version"), 2);
        let exists: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'u'",
                [],
                |row| row.get(0),
            )
            .expect("query");
        assert_eq!(exists, 0);
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).expect("count")
    }

    fn text(conn: &Connection, sql: &str) -> String {
        conn.query_row(sql, [], |row| row.get(0)).expect("text")
    }

    fn fts_with_timestamps(fts: &str, kind: &str) -> Migrator {
        Migrator::from_scripts(vec![
            MigrationScript::new(
                1,
                format!(
                    "CREATE TABLE notes (id TEXT PRIMARY KEY, body TEXT NOT NULL, created_at TEXT);\n\
                     CREATE VIRTUAL TABLE notes_fts USING fts5({fts});\n\
                     !!CREATE_FTS_SYNC_TRIGGERS(notes, notes_fts{kind});\n"
                ),
            ),
            MigrationScript::new(2, "!!CREATE_ISO_TIMESTAMP_TRIGGERS('notes', 'created_at');\n"),
        ])
        .expect("valid")
    }

    fn exercise_notes(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO notes (id, body, created_at) VALUES ('a', 'alpha bravo', '2024-01-02 03:04:05');
             INSERT INTO notes (id, body) VALUES ('b', 'charlie');",
        )
        .expect("insert with timestamp triggers");
        assert_eq!(count(conn, "SELECT count(*) FROM notes"), 2);
        assert_eq!(
            text(conn, "SELECT created_at FROM notes WHERE id = 'a'"),
            "2024-01-02T03:04:05.000Z"
        );
        assert_eq!(count(conn, "SELECT count(*) FROM notes_fts WHERE notes_fts MATCH 'bravo'"), 1);

        conn.execute_batch(
            "UPDATE notes SET created_at = '2025-06-07 08:09:10' WHERE id = 'a';
             UPDATE notes SET body = 'delta' WHERE id = 'b';",
        )
        .expect("update");
        assert_eq!(
            text(conn, "SELECT created_at FROM notes WHERE id = 'a'"),
            "2025-06-07T08:09:10.000Z"
        );
        assert_eq!(
            count(conn, "SELECT count(*) FROM notes_fts WHERE notes_fts MATCH 'charlie'"),
            0
        );
        assert_eq!(count(conn, "SELECT count(*) FROM notes_fts WHERE notes_fts MATCH 'delta'"), 1);
        assert_eq!(count(conn, "SELECT count(*) FROM notes_fts WHERE notes_fts MATCH 'alpha'"), 1);

        conn.execute_batch("DELETE FROM notes WHERE id = 'a';").expect("delete");
        assert_eq!(count(conn, "SELECT count(*) FROM notes_fts WHERE notes_fts MATCH 'alpha'"), 0);
    }

    #[test]
    fn fts_and_timestamp_triggers_share_a_table() {
        let mut conn = Connection::open_in_memory().expect("open");
        fts_with_timestamps("body", "").run(&mut conn).expect("migrate");
        exercise_notes(&conn);
        assert_eq!(count(&conn, "SELECT count(*) FROM notes_fts"), 1);
    }

    #[test]
    fn contentless_fts_and_timestamp_triggers_share_a_table() {
        let mut conn = Connection::open_in_memory().expect("open");
        fts_with_timestamps("body, content=''", ", contentless")
            .run(&mut conn)
            .expect("migrate");
        exercise_notes(&conn);
    }

    #[test]
    fn n2m_links_reindex_the_source_row() {
        let mut conn = Connection::open_in_memory().expect("open");
        let migrator = Migrator::from_scripts(vec![MigrationScript::new(
            1,
            "CREATE TABLE questions (id TEXT PRIMARY KEY, q TEXT NOT NULL);
             CREATE TABLE topics (id TEXT PRIMARY KEY);
             CREATE TABLE question_topics (question_id TEXT NOT NULL, topic_id TEXT NOT NULL);
             CREATE VIRTUAL TABLE questions_fts USING fts5(q);
             !!CREATE_FTS_SYNC_TRIGGERS(questions, questions_fts);
             !!CREATE_FTS_SYNC_TRIGGERS_N2M(questions, questions_fts, question_topics, id, question_id);
             ",
        )])
        .expect("valid");
        migrator.run(&mut conn).expect("migrate");

        conn.execute_batch(
            "INSERT INTO questions (id, q) VALUES ('q1', 'capital of france');
             INSERT INTO topics (id) VALUES ('geo');
             DELETE FROM questions_fts;",
        )
        .expect("seed");
        assert_eq!(count(&conn, "SELECT count(*) FROM questions_fts"), 0);

        conn.execute_batch("INSERT INTO question_topics VALUES ('q1', 'geo');")
            .expect("link");
        assert_eq!(count(&conn, "SELECT count(*) FROM questions_fts"), 1);
        assert_eq!(
            count(&conn, "SELECT count(*) FROM questions_fts WHERE questions_fts MATCH 'france'"),
            1
        );

        conn.execute_batch("DELETE FROM question_topics WHERE question_id = 'q1';")
            .expect("unlink");
        assert_eq!(count(&conn, "SELECT count(*) FROM questions_fts"), 1);
        assert_eq!(
            count(&conn, "SELECT rowid FROM questions_fts WHERE questions_fts MATCH 'capital'"),
            count(&conn, "SELECT rowid FROM questions WHERE id = 'q1'")
        );
    }
}
