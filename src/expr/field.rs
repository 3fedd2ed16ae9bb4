use std::fmt;

/// A column reference, optionally qualified by a table name or alias.
///
/// Both parts always render as double-quoted identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqlField {
    name: String,
    source: Option<String>,
}

impl SqlField {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: Some(source.into()),
        }
    }

    /// Parse `"name"` or `"source.name"`.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        match path.split_once('.') {
            Some((source, name)) => Self::with_source(source, name),
            None => Self::new(path),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Same column, qualified by `source`.
    #[must_use]
    pub fn of(&self, source: impl Into<String>) -> Self {
        Self::with_source(source, self.name.clone())
    }

    /// The bare quoted column name, as used on the left of an assignment.
    #[must_use]
    pub fn quoted_name(&self) -> String {
        quote_identifier(&self.name)
    }
}

impl fmt::Display for SqlField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "{}.", quote_identifier(source))?;
        }
        f.write_str(&quote_identifier(&self.name))
    }
}

/// Double-quote an identifier, doubling any embedded quote.
#[must_use]
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_quoted() {
        assert_eq!(SqlField::new("name").to_string(), "\"name\"");
        assert_eq!(SqlField::parse("c.name").to_string(), "\"c\".\"name\"");
    }

    #[test]
    fn embedded_quotes_are_doubled() {
        assert_eq!(SqlField::new("we\"ird").to_string(), "\"we\"\"ird\"");
    }
}
