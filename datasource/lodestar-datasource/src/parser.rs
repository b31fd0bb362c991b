//! Single-table DML parsing.
//!
//! The interceptor only acts on INSERT/UPDATE/DELETE against one table, so
//! the parser covers exactly those three statement forms: statement type,
//! table name, INSERT column list, the WHERE text, and how the positional
//! placeholders split between an UPDATE's SET clause and its WHERE clause.
//! Quoted string literals are respected throughout; anything fancier (joins,
//! subqueries, CTEs) is rejected and the statement passes through
//! un-intercepted.

use crate::{DatasourceError, DsResult};

/// Statement classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl SqlType {
    pub fn is_dml(self) -> bool {
        matches!(self, SqlType::Insert | SqlType::Update | SqlType::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SqlType::Select => "SELECT",
            SqlType::Insert => "INSERT",
            SqlType::Update => "UPDATE",
            SqlType::Delete => "DELETE",
            SqlType::Other => "OTHER",
        }
    }

    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "SELECT" => SqlType::Select,
            "INSERT" => SqlType::Insert,
            "UPDATE" => SqlType::Update,
            "DELETE" => SqlType::Delete,
            _ => SqlType::Other,
        }
    }
}

/// Result of parsing one DML statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSql {
    pub sql_type: SqlType,
    pub table_name: String,
    /// Column list of an INSERT, empty otherwise.
    pub columns: Vec<String>,
    /// Number of `?` placeholders in an UPDATE's SET clause; the remaining
    /// placeholders belong to the WHERE clause.
    pub set_placeholders: usize,
    /// WHERE clause text without the keyword, if present.
    pub where_clause: Option<String>,
    pub original: String,
}

impl ParsedSql {
    /// SQL that selects the rows a pending UPDATE/DELETE will touch.
    pub fn before_image_sql(&self) -> Option<String> {
        match self.sql_type {
            SqlType::Update | SqlType::Delete => Some(match &self.where_clause {
                Some(w) => format!("SELECT * FROM {} WHERE {}", self.table_name, w),
                None => format!("SELECT * FROM {}", self.table_name),
            }),
            _ => None,
        }
    }

    /// SQL that selects rows by primary key, for after-image capture.
    pub fn after_image_sql(&self, pk_column: &str, key_count: usize) -> String {
        let placeholders = vec!["?"; key_count].join(", ");
        format!(
            "SELECT * FROM {} WHERE {} IN ({})",
            self.table_name, pk_column, placeholders
        )
    }
}

/// Cheap classification without a full parse.
pub fn statement_type(sql: &str) -> SqlType {
    match first_keyword(sql) {
        Some(kw) => SqlType::from_str_loose(&kw),
        None => SqlType::Other,
    }
}

/// Whether the statement participates in AT-mode interception.
pub fn is_supported_dml(sql: &str) -> bool {
    statement_type(sql).is_dml()
}

/// Parse a supported DML statement.
pub fn parse(sql: &str) -> DsResult<ParsedSql> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(DatasourceError::UnsupportedSql("empty statement".into()));
    }
    match statement_type(trimmed) {
        SqlType::Insert => parse_insert(trimmed),
        SqlType::Update => parse_update(trimmed),
        SqlType::Delete => parse_delete(trimmed),
        other => Err(DatasourceError::UnsupportedSql(format!(
            "{} is not an interceptable statement",
            other.as_str()
        ))),
    }
}

fn parse_insert(sql: &str) -> DsResult<ParsedSql> {
    let mut cursor = Cursor::new(sql);
    cursor.expect_keyword("INSERT")?;
    cursor.expect_keyword("INTO")?;
    let table_name = cursor.identifier()?;

    let mut columns = Vec::new();
    cursor.skip_ws();
    if cursor.peek() == Some('(') {
        cursor.bump();
        loop {
            let column = cursor.identifier()?;
            columns.push(column);
            cursor.skip_ws();
            match cursor.peek() {
                Some(',') => {
                    cursor.bump();
                }
                Some(')') => {
                    cursor.bump();
                    break;
                }
                other => {
                    return Err(DatasourceError::UnsupportedSql(format!(
                        "malformed INSERT column list near {other:?}"
                    )))
                }
            }
        }
    }
    cursor.expect_keyword("VALUES")?;

    Ok(ParsedSql {
        sql_type: SqlType::Insert,
        table_name,
        columns,
        set_placeholders: 0,
        where_clause: None,
        original: sql.to_string(),
    })
}

fn parse_update(sql: &str) -> DsResult<ParsedSql> {
    let mut cursor = Cursor::new(sql);
    cursor.expect_keyword("UPDATE")?;
    let table_name = cursor.identifier()?;
    cursor.expect_keyword("SET")?;

    let rest = cursor.remainder();
    let (set_part, where_part) = split_on_keyword(rest, "WHERE");
    let set_placeholders = count_placeholders(set_part);
    let where_clause = where_part.map(|w| w.trim().to_string()).filter(|w| !w.is_empty());

    if set_part.trim().is_empty() {
        return Err(DatasourceError::UnsupportedSql("UPDATE without SET assignments".into()));
    }

    Ok(ParsedSql {
        sql_type: SqlType::Update,
        table_name,
        columns: Vec::new(),
        set_placeholders,
        where_clause,
        original: sql.to_string(),
    })
}

fn parse_delete(sql: &str) -> DsResult<ParsedSql> {
    let mut cursor = Cursor::new(sql);
    cursor.expect_keyword("DELETE")?;
    cursor.expect_keyword("FROM")?;
    let table_name = cursor.identifier()?;

    let rest = cursor.remainder();
    let (_, where_part) = split_on_keyword(rest, "WHERE");
    let where_clause = where_part.map(|w| w.trim().to_string()).filter(|w| !w.is_empty());

    Ok(ParsedSql {
        sql_type: SqlType::Delete,
        table_name,
        columns: Vec::new(),
        set_placeholders: 0,
        where_clause,
        original: sql.to_string(),
    })
}

/// Count `?` placeholders outside string literals.
fn count_placeholders(fragment: &str) -> usize {
    let mut count = 0;
    let mut in_string = false;
    for ch in fragment.chars() {
        match ch {
            '\'' => in_string = !in_string,
            '?' if !in_string => count += 1,
            _ => {}
        }
    }
    count
}

/// Split `fragment` at the first occurrence of `keyword` outside string
/// literals, matching on word boundaries case-insensitively.
fn split_on_keyword<'a>(fragment: &'a str, keyword: &str) -> (&'a str, Option<&'a str>) {
    let bytes = fragment.as_bytes();
    let kw = keyword.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i + kw.len() <= bytes.len() {
        let ch = bytes[i];
        if ch == b'\'' {
            in_string = !in_string;
            i += 1;
            continue;
        }
        if !in_string
            && bytes[i..i + kw.len()].eq_ignore_ascii_case(kw)
            && boundary_before(bytes, i)
            && boundary_after(bytes, i + kw.len())
        {
            return (&fragment[..i], Some(&fragment[i + kw.len()..]));
        }
        i += 1;
    }
    (fragment, None)
}

fn boundary_before(bytes: &[u8], idx: usize) -> bool {
    idx == 0 || !is_ident_byte(bytes[idx - 1])
}

fn boundary_after(bytes: &[u8], idx: usize) -> bool {
    idx >= bytes.len() || !is_ident_byte(bytes[idx])
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn first_keyword(sql: &str) -> Option<String> {
    let trimmed = sql.trim_start();
    let word: String = trimmed.chars().take_while(|c| c.is_ascii_alphabetic()).collect();
    if word.is_empty() {
        None
    } else {
        Some(word)
    }
}

/// Minimal forward-only scanner over the statement text.
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn expect_keyword(&mut self, keyword: &str) -> DsResult<()> {
        self.skip_ws();
        let bytes = self.text.as_bytes();
        let end = self.pos + keyword.len();
        if end <= bytes.len()
            && bytes[self.pos..end].eq_ignore_ascii_case(keyword.as_bytes())
            && boundary_after(bytes, end)
        {
            self.pos += keyword.len();
            Ok(())
        } else {
            Err(DatasourceError::UnsupportedSql(format!(
                "expected {keyword} near position {}",
                self.pos
            )))
        }
    }

    fn identifier(&mut self) -> DsResult<String> {
        self.skip_ws();
        let rest = &self.text[self.pos..];
        let mut chars = rest.chars();
        // Quoted identifiers: "name" or `name`.
        if let Some(quote @ ('"' | '`')) = chars.next() {
            if let Some(end) = rest[1..].find(quote) {
                let name = rest[1..1 + end].to_string();
                self.pos += end + 2;
                return Ok(name);
            }
            return Err(DatasourceError::UnsupportedSql("unterminated quoted identifier".into()));
        }
        let len = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
            .map(|c| c.len_utf8())
            .sum::<usize>();
        if len == 0 {
            return Err(DatasourceError::UnsupportedSql(format!(
                "expected identifier near position {}",
                self.pos
            )));
        }
        let name = rest[..len].to_string();
        self.pos += len;
        Ok(name)
    }

    fn remainder(&self) -> &'a str {
        &self.text[self.pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statement_types() {
        assert_eq!(statement_type("SELECT * FROM t"), SqlType::Select);
        assert_eq!(statement_type("  insert into t values (1)"), SqlType::Insert);
        assert_eq!(statement_type("Update t set a = 1"), SqlType::Update);
        assert_eq!(statement_type("DELETE FROM t"), SqlType::Delete);
        assert_eq!(statement_type("CREATE TABLE t (id INTEGER)"), SqlType::Other);
        assert!(!is_supported_dml("SELECT 1"));
        assert!(is_supported_dml("DELETE FROM t WHERE id = ?"));
    }

    #[test]
    fn parses_insert_with_column_list() {
        let parsed = parse("INSERT INTO ledger (id, amt) VALUES (?, ?)").unwrap();
        assert_eq!(parsed.sql_type, SqlType::Insert);
        assert_eq!(parsed.table_name, "ledger");
        assert_eq!(parsed.columns, vec!["id", "amt"]);
    }

    #[test]
    fn parses_insert_without_column_list() {
        let parsed = parse("INSERT INTO ledger VALUES (?, ?)").unwrap();
        assert_eq!(parsed.table_name, "ledger");
        assert!(parsed.columns.is_empty());
    }

    #[test]
    fn parses_update_and_splits_placeholders() {
        let parsed = parse("UPDATE account SET bal = ?, note = ? WHERE id = ? AND region = ?").unwrap();
        assert_eq!(parsed.sql_type, SqlType::Update);
        assert_eq!(parsed.table_name, "account");
        assert_eq!(parsed.set_placeholders, 2);
        assert_eq!(parsed.where_clause.as_deref(), Some("id = ? AND region = ?"));
    }

    #[test]
    fn update_where_keyword_inside_string_is_not_a_clause_boundary() {
        let parsed = parse("UPDATE t SET note = 'where it began' WHERE id = ?").unwrap();
        assert_eq!(parsed.set_placeholders, 0);
        assert_eq!(parsed.where_clause.as_deref(), Some("id = ?"));
    }

    #[test]
    fn update_without_where_touches_whole_table() {
        let parsed = parse("UPDATE account SET bal = bal - 10").unwrap();
        assert!(parsed.where_clause.is_none());
        assert_eq!(parsed.before_image_sql().unwrap(), "SELECT * FROM account");
    }

    #[test]
    fn parses_delete() {
        let parsed = parse("DELETE FROM ledger WHERE id = ?").unwrap();
        assert_eq!(parsed.sql_type, SqlType::Delete);
        assert_eq!(parsed.table_name, "ledger");
        assert_eq!(parsed.where_clause.as_deref(), Some("id = ?"));
    }

    #[test]
    fn select_is_rejected_by_parse() {
        assert!(matches!(
            parse("SELECT * FROM t"),
            Err(DatasourceError::UnsupportedSql(_))
        ));
    }

    #[test]
    fn quoted_table_names() {
        let parsed = parse("UPDATE \"order\" SET state = ? WHERE id = ?").unwrap();
        assert_eq!(parsed.table_name, "order");
    }

    #[test]
    fn image_sql_builders() {
        let parsed = parse("UPDATE account SET bal = ? WHERE id = ?").unwrap();
        assert_eq!(
            parsed.before_image_sql().unwrap(),
            "SELECT * FROM account WHERE id = ?"
        );
        assert_eq!(
            parsed.after_image_sql("id", 2),
            "SELECT * FROM account WHERE id IN (?, ?)"
        );

        let insert = parse("INSERT INTO ledger (id, amt) VALUES (?, ?)").unwrap();
        assert!(insert.before_image_sql().is_none());
    }

    #[test]
    fn placeholder_counting_ignores_literals() {
        assert_eq!(count_placeholders("a = ?, b = 'is it?'"), 1);
        assert_eq!(count_placeholders("a = ?, b = ?"), 2);
    }
}
