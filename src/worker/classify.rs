//! Statement classification for change events.

use std::sync::LazyLock;

use regex::Regex;

use super::channel::{ChangeEvent, ChangeKind};
use crate::placeholders::statement_keyword;

static TARGET_AFTER_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^(?:INSERT|REPLACE)(?:\s+OR\s+\w+)?\s+INTO\s+|^UPDATE(?:\s+OR\s+\w+)?\s+|^DELETE\s+FROM\s+")
        .expect("valid target regex")
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:"((?:[^"]|"")+)"|\[([^\]]+)\]|`([^`]+)`|([A-Za-z_][A-Za-z0-9_$]*))"#)
        .expect("valid identifier regex")
});

/// Classify a mutating statement and extract its target table.
///
/// Handles `WITH ... INSERT/UPDATE/DELETE`, `INSERT OR <action>`, `REPLACE INTO` (reported as an
/// insert), quoted names and schema-qualified names. Returns `None` for anything else.
#[must_use]
pub fn classify_statement(sql: &str) -> Option<ChangeEvent> {
    let (offset, keyword) = statement_keyword(sql)?;
    let kind = match keyword.as_str() {
        "INSERT" | "REPLACE" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };
    let rest = &sql[offset..];
    let prefix = TARGET_AFTER_KEYWORD.find(rest)?;
    let table = qualified_name_tail(&rest[prefix.end()..])?;
    Some(ChangeEvent::new(kind, table))
}

/// Last component of `name` or `schema.name`.
fn qualified_name_tail(text: &str) -> Option<String> {
    let (first, consumed) = identifier(text)?;
    let after = text[consumed..].trim_start();
    if let Some(rest) = after.strip_prefix('.') {
        return identifier(rest.trim_start()).map(|(name, _)| name);
    }
    Some(first)
}

fn identifier(text: &str) -> Option<(String, usize)> {
    let caps = IDENTIFIER.captures(text)?;
    let whole = caps.get(0)?;
    let name = if let Some(quoted) = caps.get(1) {
        quoted.as_str().replace("\"\"", "\"")
    } else {
        (2..=4)
            .find_map(|i| caps.get(i))
            .map(|m| m.as_str().to_owned())?
    };
    Some((name, whole.end()))
}
