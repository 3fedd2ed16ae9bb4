//! Full-text search helpers for FTS5 shadow tables.

use crate::entity::SqlEntity;
use crate::expr::{SqlExpr, SqlField, quote_identifier};
use crate::query_builder::{BuildError, Direction, Selector};
use crate::types::RowValues;

/// Turn free text typed by a user into an FTS5 MATCH expression.
///
/// Bare words become quoted prefix terms joined with `AND`; a word preceded by `-` is joined
/// with `NOT` instead. Text in double quotes is kept as one phrase, and an unterminated quote is
/// closed at the end of the input. Input without any term matches everything (`*`).
///
/// ```rust
/// use sqlite_access::fts::sanitize_web_search;
///
/// assert_eq!(sanitize_web_search("rust -java"), r#""rust"* NOT "java"*"#);
/// assert_eq!(sanitize_web_search("  "), "*");
/// ```
#[must_use]
pub fn sanitize_web_search(input: &str) -> String {
    let mut state = SearchQuery::default();
    let mut len = 0;

    for (i, c) in input.chars().enumerate() {
        len = i + 1;
        let i = i as isize;
        if c == '"' {
            state.toggle(i);
            continue;
        }

        if state.quoted {
            if c.is_whitespace() && state.auto {
                state.toggle(i);
                continue;
            }
        } else {
            if c.is_whitespace() || matches!(c, '*' | '+' | '-') {
                state.negate_next = c == '-' && !state.out.is_empty();
                continue;
            }
            state.auto = true;
            state.toggle(i);
        }

        state.out.push(c);
    }

    if state.quoted {
        state.opened_at = -1;
        state.toggle(len as isize);
    }

    if state.out.is_empty() {
        "*".to_owned()
    } else {
        state.out
    }
}

#[derive(Default)]
struct SearchQuery {
    out: String,
    quoted: bool,
    /// The open quote was inserted for a bare word and closes at the next whitespace.
    auto: bool,
    opened_at: isize,
    closed_at: isize,
    negate_next: bool,
}

impl SearchQuery {
    fn toggle(&mut self, i: isize) {
        if !self.auto {
            // A quote right after an opening or closing quote is swallowed.
            if self.quoted && i - self.opened_at == 1 {
                self.opened_at += 1;
                return;
            }
            if !self.quoted && i > 0 && i - self.closed_at == 1 {
                self.closed_at += 1;
                return;
            }
        }

        self.quoted = !self.quoted;
        if self.quoted {
            self.opened_at = i;
            if !self.out.is_empty() {
                let joiner = if std::mem::take(&mut self.negate_next) {
                    " NOT "
                } else {
                    " AND "
                };
                self.out.push_str(joiner);
            }
        } else {
            self.closed_at = i;
        }

        self.out.push('"');
        if !self.quoted {
            self.out.push('*');
            self.auto = false;
        }
    }
}

impl Selector {
    /// Restrict to rows of `table` whose FTS shadow row in `fts_table` matches `query`, best
    /// matches first. `None` or blank input leaves the selector unchanged.
    #[must_use]
    pub fn search(self, table: &str, fts_table: &str, query: Option<&str>) -> Self {
        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            return self;
        };
        let fts = quote_identifier(fts_table);
        self.join(fts_table, None)
            .on(SqlExpr::custom(
                format!("{fts}.rowid = {}.rowid", quote_identifier(table)),
                Vec::new(),
            ))
            .filter(SqlExpr::custom(
                format!("{fts} MATCH ?"),
                vec![RowValues::Text(sanitize_web_search(query))],
            ))
            .order_by(SqlField::with_source(fts_table, "rank"), Direction::Asc)
    }

    /// Order by a caller-supplied column name, accepted only if the entity declares it.
    ///
    /// # Errors
    /// Returns [`BuildError::UnknownColumn`] for a column the entity does not declare.
    pub fn sort_by_column<T>(
        self,
        entity: &SqlEntity<T>,
        column: Option<&str>,
        direction: Direction,
    ) -> Result<Self, BuildError> {
        let Some(column) = column else {
            return Ok(self);
        };
        let field = entity.col(column)?.of(entity.table());
        Ok(self.order_by(field, direction))
    }
}
