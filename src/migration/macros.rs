use std::sync::LazyLock;

use regex::Regex;
use rusqlite::Connection;
use tracing::debug;

use super::MigrationError;
use super::triggers::{
    FtsKind, create_fts_sync_triggers_n2m_script, create_fts_sync_triggers_script,
    create_iso_timestamp_triggers_script, drop_fts_sync_triggers_n2m_script,
    drop_fts_sync_triggers_script, drop_iso_timestamp_triggers_script,
};

static MACRO_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*!!(\w+)\(([^)]*)\);[ \t]*\r?$").expect("valid macro regex")
});

/// Macros available to migration scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroKind {
    CreateFtsSyncTriggers,
    CreateFtsSyncTriggersN2m,
    CreateIsoTimestampTriggers,
    DropFtsSyncTriggers,
    DropFtsSyncTriggersN2m,
    DropIsoTimestampTriggers,
}

impl MacroKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "CREATE_FTS_SYNC_TRIGGERS" => MacroKind::CreateFtsSyncTriggers,
            "CREATE_FTS_SYNC_TRIGGERS_N2M" => MacroKind::CreateFtsSyncTriggersN2m,
            "CREATE_ISO_TIMESTAMP_TRIGGERS" => MacroKind::CreateIsoTimestampTriggers,
            "DROP_FTS_SYNC_TRIGGERS" => MacroKind::DropFtsSyncTriggers,
            "DROP_FTS_SYNC_TRIGGERS_N2M" => MacroKind::DropFtsSyncTriggersN2m,
            "DROP_ISO_TIMESTAMP_TRIGGERS" => MacroKind::DropIsoTimestampTriggers,
            _ => return None,
        })
    }

    /// Required and maximum argument counts.
    fn arity(self) -> (usize, usize) {
        match self {
            MacroKind::CreateFtsSyncTriggers => (2, 3),
            MacroKind::CreateFtsSyncTriggersN2m => (5, 6),
            MacroKind::CreateIsoTimestampTriggers
            | MacroKind::DropFtsSyncTriggers
            | MacroKind::DropFtsSyncTriggersN2m
            | MacroKind::DropIsoTimestampTriggers => (2, 2),
        }
    }
}

/// One `!!NAME(args);` line of a migration script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroCall {
    kind: MacroKind,
    name: String,
    args: Vec<String>,
}

/// Split a migration script into its plain SQL and its macro calls.
///
/// Macro lines are removed from the SQL and returned in order of appearance.
///
/// # Errors
/// Returns [`MigrationError::UnknownMacro`], [`MigrationError::MacroArity`] or
/// [`MigrationError::BadMacroArgument`] for invalid calls.
pub fn split_macros(
    version: u32,
    script: &str,
) -> Result<(String, Vec<MacroCall>), MigrationError> {
    let mut calls = Vec::new();
    for caps in MACRO_LINE.captures_iter(script) {
        let name = caps[1].to_owned();
        let kind = MacroKind::from_name(&name).ok_or_else(|| MigrationError::UnknownMacro {
            version,
            name: name.clone(),
        })?;
        let args = parse_args(&caps[2]);
        let (min, max) = kind.arity();
        if args.len() < min || args.len() > max {
            return Err(MigrationError::MacroArity {
                version,
                name,
                expected: min,
                got: args.len(),
            });
        }
        if let (MacroKind::CreateFtsSyncTriggers, Some(kind_arg))
        | (MacroKind::CreateFtsSyncTriggersN2m, Some(kind_arg)) = (kind, args.get(min))
            && FtsKind::from_arg(kind_arg).is_none()
        {
            return Err(MigrationError::BadMacroArgument {
                version,
                name,
                argument: kind_arg.clone(),
            });
        }
        calls.push(MacroCall { kind, name, args });
    }
    let sql = MACRO_LINE.replace_all(script, "").into_owned();
    Ok((sql, calls))
}

fn parse_args(raw: &str) -> Vec<String> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    raw.split(',')
        .map(|arg| {
            arg.trim()
                .chars()
                .filter(|c| !matches!(c, '\'' | '"' | '`'))
                .collect::<String>()
        })
        .collect()
}

impl MacroCall {
    #[must_use]
    pub fn kind(&self) -> MacroKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    fn kind_arg(&self, index: usize) -> FtsKind {
        self.args
            .get(index)
            .and_then(|arg| FtsKind::from_arg(arg))
            .unwrap_or_default()
    }

    /// Generate the SQL for this call, introspecting `conn` where needed.
    ///
    /// # Errors
    /// Returns [`MigrationError::MissingFtsTable`] when the FTS table has no columns, or the
    /// driver error raised by introspection.
    pub fn expand(&self, conn: &Connection) -> Result<String, MigrationError> {
        let a = &self.args;
        let script = match self.kind {
            MacroKind::CreateFtsSyncTriggers => {
                let columns = fts_columns(conn, &a[1])?;
                create_fts_sync_triggers_script(&a[0], &a[1], &columns, self.kind_arg(2))
            }
            MacroKind::CreateFtsSyncTriggersN2m => {
                let columns = fts_columns(conn, &a[1])?;
                create_fts_sync_triggers_n2m_script(
                    &a[0],
                    &a[1],
                    &a[2],
                    &a[3],
                    &a[4],
                    &columns,
                    self.kind_arg(5),
                )
            }
            MacroKind::CreateIsoTimestampTriggers => {
                create_iso_timestamp_triggers_script(&a[0], &a[1])
            }
            MacroKind::DropFtsSyncTriggers => drop_fts_sync_triggers_script(&a[0], &a[1]),
            MacroKind::DropFtsSyncTriggersN2m => drop_fts_sync_triggers_n2m_script(&a[0], &a[1]),
            MacroKind::DropIsoTimestampTriggers => drop_iso_timestamp_triggers_script(&a[0], &a[1]),
        };
        debug!(name = %self.name, args = ?self.args, "expanded migration macro");
        Ok(script)
    }
}

/// Column names of `table`, in declaration order.
fn fts_columns(conn: &Connection, table: &str) -> Result<Vec<String>, MigrationError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map([table], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    if columns.is_empty() {
        return Err(MigrationError::MissingFtsTable(table.to_owned()));
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_macro_lines_from_sql() {
        let script = "CREATE TABLE t (id TEXT);\n!!CREATE_ISO_TIMESTAMP_TRIGGERS('t', \"created\");\nSELECT 1;\n";
        let (sql, calls) = split_macros(3, script).expect("valid");
        assert_eq!(sql, "CREATE TABLE t (id TEXT);\n\nSELECT 1;\n");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].kind, MacroKind::CreateIsoTimestampTriggers);
        assert_eq!(calls[0].args, ["t", "created"]);
    }

    #[test]
    fn macros_must_stand_on_their_own_line() {
        let (sql, calls) = split_macros(1, "SELECT '!!X(a);';").expect("valid");
        assert!(calls.is_empty());
        assert_eq!(sql, "SELECT '!!X(a);';");
    }

    #[test]
    fn rejects_unknown_macros_and_bad_arity() {
        assert!(matches!(
            split_macros(2, "!!NOPE(a);"),
            Err(MigrationError::UnknownMacro { version: 2, .. })
        ));
        assert!(matches!(
            split_macros(2, "!!CREATE_FTS_SYNC_TRIGGERS(a);"),
            Err(MigrationError::MacroArity { expected: 2, got: 1, .. })
        ));
        assert!(matches!(
            split_macros(2, "!!CREATE_FTS_SYNC_TRIGGERS(a, b, sideways);"),
            Err(MigrationError::BadMacroArgument { .. })
        ));
    }

    #[test]
    fn expands_against_introspected_columns() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(
            "CREATE TABLE src (id INTEGER PRIMARY KEY, title TEXT);
             CREATE VIRTUAL TABLE src_fts USING fts5(title);",
        )
        .expect("schema");
        let (_, calls) =
            split_macros(1, "!!CREATE_FTS_SYNC_TRIGGERS(src, src_fts);").expect("valid");
        let script = calls[0].expand(&conn).expect("expand");
        assert!(script.contains("NEW.rowid, NEW.\"title\""));

        let (_, calls) =
            split_macros(1, "!!CREATE_FTS_SYNC_TRIGGERS(src, nope_fts);").expect("valid");
        assert!(matches!(
            calls[0].expand(&conn),
            Err(MigrationError::MissingFtsTable(name)) if name == "nope_fts"
        ));
    }
}
