//! Identifier quoting per adapter dialect.
//!
//! Tenant names end up as schema or database identifiers in DDL and in the
//! search path, so they are always quoted: a name such as `tenant-with-'quote`
//! or `x"; DROP SCHEMA public; --` stays one identifier.

/// How an adapter quotes identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// ANSI double quotes (PostgreSQL, SQL Server in ANSI mode, DuckDB).
    #[default]
    DoubleQuote,
    /// Backticks (MySQL, MariaDB).
    Backtick,
    /// No quoting (file-backed SQLite databases, where the name is a path).
    Unquoted,
}

impl Dialect {
    /// Pick the dialect for an adapter name.
    pub fn for_adapter(adapter: &str) -> Self {
        match adapter.to_ascii_lowercase().as_str() {
            "mysql" | "mysql2" | "mariadb" | "trilogy" => Self::Backtick,
            "sqlite" | "sqlite3" => Self::Unquoted,
            _ => Self::DoubleQuote,
        }
    }

    /// Quote a single identifier.
    ///
    /// The quote character is doubled inside the identifier, which is the
    /// escape both PostgreSQL and MySQL understand.
    ///
    /// ```rust
    /// use prax_tenant::Dialect;
    ///
    /// assert_eq!(Dialect::DoubleQuote.quote("acme"), r#""acme""#);
    /// assert_eq!(Dialect::DoubleQuote.quote(r#"a"b"#), r#""a""b""#);
    /// assert_eq!(Dialect::Backtick.quote("a`b"), "`a``b`");
    /// ```
    pub fn quote(&self, identifier: &str) -> String {
        match self {
            Self::DoubleQuote => wrap(identifier, '"'),
            Self::Backtick => wrap(identifier, '`'),
            Self::Unquoted => identifier.to_string(),
        }
    }

    /// Longest identifier the server keeps, in bytes; longer names are
    /// silently truncated by PostgreSQL and rejected by MySQL.
    pub fn max_identifier_len(&self) -> Option<usize> {
        match self {
            Self::DoubleQuote => Some(63),
            Self::Backtick => Some(64),
            Self::Unquoted => None,
        }
    }

    /// Whether an unquoted `identifier` fits [`max_identifier_len`](Self::max_identifier_len).
    pub fn fits(&self, identifier: &str) -> bool {
        self.max_identifier_len()
            .is_none_or(|max| identifier.len() <= max)
    }

    /// Build a comma-separated search path: the tenant schema first, then the
    /// persistent schemas.
    pub fn search_path(&self, schema: &str, persistent: &[String]) -> String {
        std::iter::once(schema)
            .chain(persistent.iter().map(String::as_str))
            .map(|s| self.quote(s))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Quote `identifier` for `dialect`.
#[inline]
pub fn quote_identifier(dialect: Dialect, identifier: &str) -> String {
    dialect.quote(identifier)
}

fn wrap(identifier: &str, quote: char) -> String {
    let mut out = String::with_capacity(identifier.len() + 2);
    out.push(quote);
    for ch in identifier.chars() {
        if ch == quote {
            out.push(quote);
        }
        out.push(ch);
    }
    out.push(quote);
    out
}

/// Split a quoted search path back into schema names.
///
/// Inverse of [`Dialect::search_path`] for the double-quote and backtick
/// dialects; unquoted segments are trimmed and kept verbatim.
pub fn split_search_path(path: &str) -> Vec<String> {
    let mut schemas = Vec::new();
    let mut chars = path.chars().peekable();

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(&first) = chars.peek() else {
            break;
        };

        let mut name = String::new();
        if first == '"' || first == '`' {
            chars.next();
            while let Some(ch) = chars.next() {
                if ch == first {
                    if chars.peek() == Some(&first) {
                        chars.next();
                        name.push(first);
                    } else {
                        break;
                    }
                } else {
                    name.push(ch);
                }
            }
        } else {
            while let Some(&ch) = chars.peek() {
                if ch == ',' {
                    break;
                }
                name.push(ch);
                chars.next();
            }
            name = name.trim().to_string();
        }
        schemas.push(name);
    }

    schemas
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_dialect_for_adapter() {
        assert_eq!(Dialect::for_adapter("postgresql"), Dialect::DoubleQuote);
        assert_eq!(Dialect::for_adapter("MySQL2"), Dialect::Backtick);
        assert_eq!(Dialect::for_adapter("sqlite3"), Dialect::Unquoted);
    }

    #[test]
    fn test_identifier_length_limits() {
        let at_limit = "a".repeat(63);
        assert!(Dialect::DoubleQuote.fits(&at_limit));
        assert!(!Dialect::DoubleQuote.fits(&format!("{at_limit}b")));
        assert!(Dialect::Backtick.fits(&format!("{at_limit}b")));
        // Bytes, not characters.
        assert!(!Dialect::DoubleQuote.fits(&"é".repeat(32)));
        assert!(Dialect::Unquoted.fits(&"a".repeat(500)));
    }

    #[test]
    fn test_quote_keeps_similar_names_apart() {
        let quoted = Dialect::DoubleQuote.quote("tenant-with-'quote");
        assert_eq!(quoted, r#""tenant-with-'quote""#);
        assert_ne!(quoted, Dialect::DoubleQuote.quote("tenant-with-quote"));
    }

    #[test]
    fn test_injection_stays_one_identifier() {
        let quoted = Dialect::DoubleQuote.quote(r#"x"; DROP SCHEMA public; --"#);
        assert_eq!(quoted, r#""x""; DROP SCHEMA public; --""#);
        assert_eq!(split_search_path(&quoted), vec![r#"x"; DROP SCHEMA public; --"#]);
    }

    #[test]
    fn test_search_path() {
        let path = Dialect::DoubleQuote.search_path("acme", &["shared".to_string()]);
        assert_eq!(path, r#""acme", "shared""#);
        assert_eq!(split_search_path(&path), vec!["acme", "shared"]);
        assert_eq!(split_search_path("public, extensions"), vec!["public", "extensions"]);
    }

    proptest! {
        #[test]
        fn prop_quoting_is_injective(a in "\\PC{0,24}", b in "\\PC{0,24}") {
            for dialect in [Dialect::DoubleQuote, Dialect::Backtick] {
                prop_assert_eq!(a == b, dialect.quote(&a) == dialect.quote(&b));
            }
        }

        #[test]
        fn prop_search_path_round_trips(schema in "\\PC{1,32}") {
            let path = Dialect::DoubleQuote.search_path(&schema, &["public".to_string()]);
            prop_assert_eq!(split_search_path(&path), vec![schema, "public".to_string()]);
        }
    }
}
