//! Quote- and comment-aware scanning of SQL text.
//!
//! Placeholders, keywords and parentheses inside string literals, quoted identifiers and
//! comments are ignored, so a `'?'` literal never counts as a bound parameter.

mod scanner;

pub(crate) use scanner::CodeBytes;
use scanner::is_word_byte;

/// Count the bound parameter slots in `sql`.
///
/// Bare `?` counts one slot each. Numbered `?NNN` placeholders count the highest number used,
/// and `:name`/`@name`/`$name` count once per distinct name.
#[must_use]
pub fn count_placeholders(sql: &str) -> usize {
    let bytes = sql.as_bytes();
    let mut anonymous = 0usize;
    let mut highest_numbered = 0usize;
    let mut named: Vec<&str> = Vec::new();
    let mut skip_until = 0usize;

    for (idx, b) in CodeBytes::new(sql) {
        if idx < skip_until {
            continue;
        }
        match b {
            b'?' => {
                let end = word_end(bytes, idx + 1);
                if end == idx + 1 {
                    anonymous += 1;
                } else if let Ok(n) = sql[idx + 1..end].parse::<usize>() {
                    highest_numbered = highest_numbered.max(n);
                }
                skip_until = end;
            }
            b':' | b'@' | b'$' => {
                let end = word_end(bytes, idx + 1);
                // `::` casts and lone sigils are not parameters
                if end > idx + 1 && !bytes[idx + 1].is_ascii_digit() {
                    let name = &sql[idx + 1..end];
                    if !named.contains(&name) {
                        named.push(name);
                    }
                }
                skip_until = end;
            }
            _ => {}
        }
    }

    anonymous.max(highest_numbered) + named.len()
}

/// Upper-cased first keyword of `sql`, skipping leading whitespace and comments.
#[must_use]
pub fn leading_keyword(sql: &str) -> Option<(usize, String)> {
    words(sql).next()
}

/// First top-level statement keyword once any `WITH` clause is skipped.
///
/// Returns the byte offset of the keyword together with its upper-cased text. Common table
/// expression bodies are parenthesized, so only depth-zero words are considered.
#[must_use]
pub fn statement_keyword(sql: &str) -> Option<(usize, String)> {
    let mut iter = words(sql);
    let first = iter.next()?;
    if first.1 != "WITH" {
        return Some(first);
    }
    iter.find(|(_, word)| {
        matches!(
            word.as_str(),
            "SELECT" | "INSERT" | "REPLACE" | "UPDATE" | "DELETE" | "VALUES"
        )
    })
}

/// Depth-zero words in code position, upper-cased with their byte offsets.
fn words(sql: &str) -> impl Iterator<Item = (usize, String)> + '_ {
    let bytes = sql.as_bytes();
    let mut depth = 0usize;
    let mut skip_until = 0usize;
    CodeBytes::new(sql).filter_map(move |(idx, b)| {
        if idx < skip_until {
            return None;
        }
        match b {
            b'(' => {
                depth += 1;
                None
            }
            b')' => {
                depth = depth.saturating_sub(1);
                None
            }
            _ if is_word_byte(b) => {
                let end = word_end(bytes, idx);
                skip_until = end;
                (depth == 0).then(|| (idx, sql[idx..end].to_ascii_uppercase()))
            }
            _ => None,
        }
    })
}

fn word_end(bytes: &[u8], start: usize) -> usize {
    let mut idx = start;
    while idx < bytes.len() && is_word_byte(bytes[idx]) {
        idx += 1;
    }
    idx
}
