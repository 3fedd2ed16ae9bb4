//! Trigger script generators used by the migration macros.
//!
//! FTS columns whose name starts with `SELECT` are computed: the name is a sub-query in which
//! `$SRC` stands for the source row (`NEW`, `OLD` or the source table alias).

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

use crate::expr::quote_identifier;

static SRC_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\$SRC\.(?:"([^"]+)"|(\w+))"#).expect("valid source reference regex")
});

/// How rows are removed from an FTS index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FtsKind {
    /// The index stores its own content; rows are deleted by rowid.
    #[default]
    Stateful,
    /// External-content or contentless index; rows are removed with the `'delete'` command.
    External,
}

impl FtsKind {
    /// Parse a macro argument. Unknown values are `None`.
    #[must_use]
    pub fn from_arg(arg: &str) -> Option<Self> {
        match arg.trim().to_ascii_lowercase().as_str() {
            "" | "stateful" | "default" => Some(FtsKind::Stateful),
            "external" | "external-content" | "contentless" => Some(FtsKind::External),
            _ => None,
        }
    }
}

fn value_of(column: &str, row: &str) -> String {
    if column.starts_with("SELECT") {
        format!("({})", column.replace("$SRC", row))
    } else {
        format!("{row}.{}", quote_identifier(column))
    }
}

fn column_list(columns: &[String]) -> String {
    let mut out = String::from("rowid");
    for column in columns {
        let _ = write!(out, ", {}", quote_identifier(column));
    }
    out
}

fn value_list(columns: &[String], row: &str) -> String {
    let mut out = format!("{row}.rowid");
    for column in columns {
        let _ = write!(out, ", {}", value_of(column, row));
    }
    out
}

/// Source columns feeding the index: plain columns plus the `$SRC` references of computed ones.
fn source_columns(columns: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut push = |name: &str| {
        if !name.eq_ignore_ascii_case("rowid") && !out.iter().any(|c| c == name) {
            out.push(name.to_owned());
        }
    };
    for column in columns {
        if column.starts_with("SELECT") {
            for caps in SRC_REFERENCE.captures_iter(column) {
                if let Some(name) = caps.get(1).or_else(|| caps.get(2)) {
                    push(name.as_str());
                }
            }
        } else {
            push(column);
        }
    }
    out
}

/// `OF "a", "b"` restricting an update trigger to the columns that change the index.
fn update_of(columns: &[String]) -> String {
    let sources = source_columns(columns);
    if sources.is_empty() {
        return String::new();
    }
    let list: Vec<String> = sources.iter().map(|c| quote_identifier(c)).collect();
    format!(" OF {}", list.join(", "))
}

fn trigger_name(table: &str, event: &str, fts: &str) -> String {
    quote_identifier(&format!("trg_{table}_{event}_sync_{fts}"))
}

/// Statement removing the FTS row of `row` (`OLD` inside triggers).
fn remove_row(fts: &str, columns: &[String], kind: FtsKind, row: &str) -> String {
    let fts_q = quote_identifier(fts);
    match kind {
        FtsKind::Stateful => format!("DELETE FROM {fts_q}\n  WHERE rowid = {row}.rowid;"),
        FtsKind::External => format!(
            "INSERT INTO {fts_q} (\n    {fts_q}, {}\n  ) VALUES (\n    'delete', {}\n  );",
            column_list(columns),
            value_list(columns, row)
        ),
    }
}

fn insert_row(fts: &str, columns: &[String], row: &str) -> String {
    format!(
        "INSERT INTO {} (\n    {}\n  ) VALUES (\n    {}\n  );",
        quote_identifier(fts),
        column_list(columns),
        value_list(columns, row)
    )
}

/// Fill `fts` from `src` and install INSERT/UPDATE/DELETE sync triggers on `src`.
#[must_use]
pub fn create_fts_sync_triggers_script(
    src: &str,
    fts: &str,
    columns: &[String],
    kind: FtsKind,
) -> String {
    let src_q = quote_identifier(src);
    let fts_q = quote_identifier(fts);
    let clear = match kind {
        FtsKind::Stateful => format!("DELETE FROM {fts_q};"),
        FtsKind::External => format!("INSERT INTO {fts_q} ({fts_q}) VALUES ('delete-all');"),
    };
    // a stateful index can drop a stale row first; the 'delete' command cannot
    let insert_fresh = match kind {
        FtsKind::Stateful => format!(
            "DELETE FROM {fts_q}\n  WHERE rowid = NEW.rowid;\n\n  {}",
            insert_row(fts, columns, "NEW")
        ),
        FtsKind::External => insert_row(fts, columns, "NEW"),
    };

    format!(
        "
{clear}

INSERT INTO {fts_q} (
  {raw}
)
SELECT
  {from_src}
FROM {src_q} SRC;

CREATE TRIGGER {insert_trigger}
AFTER INSERT ON {src_q} FOR EACH ROW
BEGIN
  {insert_fresh}
END;

CREATE TRIGGER {update_trigger}
AFTER UPDATE{update_of} ON {src_q} FOR EACH ROW
BEGIN
  {remove_old}

  {insert_new}
END;

CREATE TRIGGER {delete_trigger}
AFTER DELETE ON {src_q} FOR EACH ROW
BEGIN
  {remove_old}
END;
",
        raw = column_list(columns),
        from_src = value_list(columns, "SRC"),
        insert_trigger = trigger_name(src, "after_insert", fts),
        update_trigger = trigger_name(src, "after_update", fts),
        delete_trigger = trigger_name(src, "after_delete", fts),
        update_of = update_of(columns),
        insert_new = insert_row(fts, columns, "NEW"),
        remove_old = remove_row(fts, columns, kind, "OLD"),
    )
}

#[must_use]
pub fn drop_fts_sync_triggers_script(src: &str, fts: &str) -> String {
    ["after_insert", "after_update", "after_delete"]
        .iter()
        .map(|event| format!("DROP TRIGGER IF EXISTS {};\n", trigger_name(src, event, fts)))
        .collect()
}

/// Re-index a source row whenever a many-to-many link to it is added or removed.
///
/// `src_id` is the key column of `src`, `n2m_id` the column of `n2m` referencing it.
#[must_use]
pub fn create_fts_sync_triggers_n2m_script(
    src: &str,
    fts: &str,
    n2m: &str,
    src_id: &str,
    n2m_id: &str,
    columns: &[String],
    kind: FtsKind,
) -> String {
    let src_q = quote_identifier(src);
    let fts_q = quote_identifier(fts);
    let src_id_q = quote_identifier(src_id);
    let n2m_q = quote_identifier(n2m);
    let n2m_id_q = quote_identifier(n2m_id);

    let reinsert = |row: &str| {
        format!(
            "INSERT INTO {fts_q} (\n    {}\n  )\n  SELECT\n    {}\n  FROM {src_q} SRC\n  WHERE SRC.{src_id_q} = {row}.{n2m_id_q};",
            column_list(columns),
            value_list(columns, "SRC"),
        )
    };

    match kind {
        FtsKind::Stateful => {
            let remove = |row: &str| {
                format!(
                    "DELETE FROM {fts_q}\n  WHERE rowid = (SELECT rowid FROM {src_q} WHERE {src_id_q} = {row}.{n2m_id_q});"
                )
            };
            format!(
                "
CREATE TRIGGER {insert_trigger}
AFTER INSERT ON {n2m_q} FOR EACH ROW
BEGIN
  {remove_new}

  {reinsert_new}
END;

CREATE TRIGGER {delete_trigger}
AFTER DELETE ON {n2m_q} FOR EACH ROW
BEGIN
  {remove_old}

  {reinsert_old}
END;
",
                insert_trigger = trigger_name(n2m, "after_insert", fts),
                delete_trigger = trigger_name(n2m, "after_delete", fts),
                remove_new = remove("NEW"),
                reinsert_new = reinsert("NEW"),
                remove_old = remove("OLD"),
                reinsert_old = reinsert("OLD"),
            )
        }
        // the 'delete' command needs the indexed values, so it runs before the link changes
        FtsKind::External => {
            let remove = |row: &str| {
                format!(
                    "INSERT INTO {fts_q} (\n    {fts_q}, {}\n  )\n  SELECT\n    'delete', {}\n  FROM {src_q} SRC\n  WHERE SRC.{src_id_q} = {row}.{n2m_id_q};",
                    column_list(columns),
                    value_list(columns, "SRC"),
                )
            };
            format!(
                "
CREATE TRIGGER {before_insert_trigger}
BEFORE INSERT ON {n2m_q} FOR EACH ROW
BEGIN
  {remove_new}
END;

CREATE TRIGGER {insert_trigger}
AFTER INSERT ON {n2m_q} FOR EACH ROW
BEGIN
  {reinsert_new}
END;

CREATE TRIGGER {before_delete_trigger}
BEFORE DELETE ON {n2m_q} FOR EACH ROW
BEGIN
  {remove_old}
END;

CREATE TRIGGER {delete_trigger}
AFTER DELETE ON {n2m_q} FOR EACH ROW
BEGIN
  {reinsert_old}
END;
",
                before_insert_trigger = trigger_name(n2m, "before_insert", fts),
                insert_trigger = trigger_name(n2m, "after_insert", fts),
                before_delete_trigger = trigger_name(n2m, "before_delete", fts),
                delete_trigger = trigger_name(n2m, "after_delete", fts),
                remove_new = remove("NEW"),
                reinsert_new = reinsert("NEW"),
                remove_old = remove("OLD"),
                reinsert_old = reinsert("OLD"),
            )
        }
    }
}

#[must_use]
pub fn drop_fts_sync_triggers_n2m_script(n2m: &str, fts: &str) -> String {
    ["before_insert", "after_insert", "before_delete", "after_delete"]
        .iter()
        .map(|event| format!("DROP TRIGGER IF EXISTS {};\n", trigger_name(n2m, event, fts)))
        .collect()
}

fn iso_trigger_name(table: &str, event: &str, column: &str) -> String {
    quote_identifier(&format!(
        "trg_{table}_after_{event}_of_{column}_fix_iso_timestamp"
    ))
}

/// Normalize `column` to `YYYY-MM-DDTHH:MM:SS.SSSZ` after every insert and every change.
#[must_use]
pub fn create_iso_timestamp_triggers_script(table: &str, column: &str) -> String {
    let table_q = quote_identifier(table);
    let column_q = quote_identifier(column);
    format!(
        "
CREATE TRIGGER {insert_trigger} AFTER INSERT ON {table_q}
BEGIN
UPDATE {table_q}
SET {column_q} = strftime('%Y-%m-%dT%H:%M:%fZ', NEW.{column_q})
WHERE rowid = NEW.rowid;
END;

CREATE TRIGGER {update_trigger} AFTER UPDATE OF {column_q} ON {table_q}
WHEN NEW.{column_q} IS NOT OLD.{column_q}
BEGIN
UPDATE {table_q}
SET {column_q} = strftime('%Y-%m-%dT%H:%M:%fZ', NEW.{column_q})
WHERE rowid = NEW.rowid;
END;
",
        insert_trigger = iso_trigger_name(table, "insert", column),
        update_trigger = iso_trigger_name(table, "update", column),
    )
}

#[must_use]
pub fn drop_iso_timestamp_triggers_script(table: &str, column: &str) -> String {
    format!(
        "DROP TRIGGER IF EXISTS {};\nDROP TRIGGER IF EXISTS {};\n",
        iso_trigger_name(table, "insert", column),
        iso_trigger_name(table, "update", column),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn stateful_triggers_delete_by_rowid() {
        let script = create_fts_sync_triggers_script(
            "questions",
            "questions_fts",
            &cols(&["q", "a"]),
            FtsKind::Stateful,
        );
        assert!(script.contains("DELETE FROM \"questions_fts\";"));
        assert!(script.contains("CREATE TRIGGER \"trg_questions_after_insert_sync_questions_fts\""));
        assert!(script.contains("WHERE rowid = OLD.rowid;"));
        assert!(script.contains("NEW.rowid, NEW.\"q\", NEW.\"a\""));
        assert!(script.contains("AFTER UPDATE OF \"q\", \"a\" ON \"questions\" FOR EACH ROW"));
        assert!(script.contains("BEGIN\n  DELETE FROM \"questions_fts\"\n  WHERE rowid = NEW.rowid;"));
        assert!(!script.contains("'delete'"));
    }

    #[test]
    fn external_triggers_use_delete_command() {
        let script = create_fts_sync_triggers_script(
            "docs",
            "docs_fts",
            &cols(&["body"]),
            FtsKind::External,
        );
        assert!(script.contains("INSERT INTO \"docs_fts\" (\"docs_fts\") VALUES ('delete-all');"));
        assert!(script.contains("'delete', OLD.rowid, OLD.\"body\""));
        assert!(!script.contains("WHERE rowid = OLD.rowid"));
    }

    #[test]
    fn computed_columns_substitute_row_alias() {
        let column = "SELECT group_concat(name) FROM tags WHERE item_id = $SRC.id".to_owned();
        let script =
            create_fts_sync_triggers_script("items", "items_fts", &[column], FtsKind::Stateful);
        assert!(script.contains("(SELECT group_concat(name) FROM tags WHERE item_id = NEW.id)"));
        assert!(script.contains("(SELECT group_concat(name) FROM tags WHERE item_id = SRC.id)"));
        assert!(script.contains("AFTER UPDATE OF \"id\" ON \"items\""));
    }

    #[test]
    fn n2m_triggers_reindex_source_row() {
        let script = create_fts_sync_triggers_n2m_script(
            "questions",
            "questions_fts",
            "question_categories",
            "id",
            "question_id",
            &cols(&["q"]),
            FtsKind::Stateful,
        );
        assert!(script.contains("\"trg_question_categories_after_insert_sync_questions_fts\""));
        assert!(script.contains("WHERE SRC.\"id\" = NEW.\"question_id\";"));
        assert!(script.contains(
            "WHERE rowid = (SELECT rowid FROM \"questions\" WHERE \"id\" = OLD.\"question_id\");"
        ));
    }

    #[test]
    fn drop_scripts_match_created_names() {
        let drop = drop_iso_timestamp_triggers_script("t", "created_at");
        assert!(drop.contains("\"trg_t_after_insert_of_created_at_fix_iso_timestamp\""));
        let create = create_iso_timestamp_triggers_script("t", "created_at");
        assert!(create.contains("CREATE TRIGGER \"trg_t_after_update_of_created_at_fix_iso_timestamp\""));
        assert!(create.contains("strftime('%Y-%m-%dT%H:%M:%fZ', NEW.\"created_at\")"));
    }

    #[test]
    fn fts_kind_arguments() {
        assert_eq!(FtsKind::from_arg(""), Some(FtsKind::Stateful));
        assert_eq!(FtsKind::from_arg("Contentless"), Some(FtsKind::External));
        assert_eq!(FtsKind::from_arg("bogus"), None);
    }
}
