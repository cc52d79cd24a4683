//! SQL statement engine: comment stripping, statement splitting, placeholder
//! substitution and sequential execution on a [`Connection`].
//!
//! Splitting is lexical, not a parse. Dollar-quoted bodies (`$$ ... $$`,
//! `$BODY$ ... $BODY$`, any `$tag$ ... $tag$`, tags matched case-insensitively)
//! are swapped for opaque tokens before the text is split on top-level
//! semicolons and restored afterwards. Comments are removed in the same pass
//! that finds dollar-quoted bodies, so `--` or `/*` inside a body or a string
//! literal is never treated as a comment, and a `$$` inside a comment never
//! opens a body.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex_lite::Regex;

use crate::db::{Connection, StatementOutcome};
use crate::error::{format_db_error, Result, StrataError};
use crate::parameter::SqlParameter;
use crate::placeholder::replace_placeholders;

const BLOCK_TOKEN_PREFIX: &str = "__STRATA_BLOCK_";

/// Transaction control statements. The engine owns transaction boundaries.
const TRANSACTION_CONTROL: &[&str] = &[
    "BEGIN",
    "BEGIN WORK",
    "BEGIN TRANSACTION",
    "START TRANSACTION",
    "COMMIT",
    "COMMIT WORK",
    "COMMIT TRANSACTION",
    "END",
    "END WORK",
    "END TRANSACTION",
];

static SEARCH_PATH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^SELECT\s+pg_catalog\.set_config\s*\(.*search_path").unwrap()
});

/// Where a piece of SQL comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlSource {
    Inline(String),
    File(PathBuf),
}

/// One unit of SQL text (inline or file-backed) that executes as an ordered
/// list of statements.
#[derive(Debug, Clone)]
pub struct SqlContent {
    source: SqlSource,
    phase: String,
}

impl SqlContent {
    pub fn inline(sql: impl Into<String>) -> Self {
        Self {
            source: SqlSource::Inline(sql.into()),
            phase: "sql".to_string(),
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: SqlSource::File(path.into()),
            phase: "sql".to_string(),
        }
    }

    /// Label reported in execution errors (e.g. `changelog 1.2.0`, `create-app hook`).
    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = phase.into();
        self
    }

    pub fn source(&self) -> &SqlSource {
        &self.source
    }

    /// File path or `inline SQL`, for messages.
    pub fn source_name(&self) -> String {
        match &self.source {
            SqlSource::Inline(_) => "inline SQL".to_string(),
            SqlSource::File(path) => path.display().to_string(),
        }
    }

    fn text(&self) -> Result<String> {
        match &self.source {
            SqlSource::Inline(sql) => Ok(sql.clone()),
            SqlSource::File(path) => std::fs::read_to_string(path).map_err(|e| {
                StrataError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("Failed to read SQL file '{}': {}", path.display(), e),
                ))
            }),
        }
    }

    /// Split into statements and reject transaction control, without substitution.
    pub fn statements(&self) -> Result<Vec<String>> {
        let statements = split_statements(&self.text()?);
        for statement in &statements {
            check_forbidden(statement).map_err(|reason| StrataError::InvalidSql {
                source_name: self.source_name(),
                reason,
            })?;
        }
        Ok(statements)
    }

    /// Split and substitute placeholders, producing the exact statements that would run.
    pub fn prepare(&self, parameters: &HashMap<String, SqlParameter>) -> Result<Vec<String>> {
        self.statements()?
            .iter()
            .map(|statement| replace_placeholders(statement, parameters))
            .collect()
    }

    /// Check the content is non-empty, splits cleanly and has every placeholder bound.
    pub fn validate(&self, parameters: &HashMap<String, SqlParameter>) -> Result<()> {
        if self.text()?.trim().is_empty() {
            return Err(StrataError::InvalidSql {
                source_name: self.source_name(),
                reason: "SQL content is empty".to_string(),
            });
        }
        self.prepare(parameters)?;
        Ok(())
    }

    /// Execute every statement in order.
    ///
    /// The first failing statement aborts the rest of this source. With
    /// `commit` the open transaction is committed once all statements
    /// succeeded; otherwise the caller decides when to commit.
    pub async fn execute(
        &self,
        conn: &Connection,
        parameters: &HashMap<String, SqlParameter>,
        commit: bool,
    ) -> Result<SqlResult> {
        let statements = self.prepare(parameters)?;
        let mut result = SqlResult::default();

        for statement in &statements {
            tracing::debug!(source = %self.source_name(), statement = %statement, "Executing SQL statement");
            match conn.run_statement(statement).await {
                Ok(outcome) => result = SqlResult::from(outcome),
                Err(e) => {
                    return Err(StrataError::SqlExecution {
                        phase: self.phase.clone(),
                        source_name: self.source_name(),
                        statement: statement.clone(),
                        reason: format_db_error(&e),
                    });
                }
            }
        }

        if commit {
            conn.commit().await?;
        }

        Ok(result)
    }
}

/// Cursor-like view over the output of the last statement of a source.
#[derive(Debug, Default, Clone)]
pub struct SqlResult {
    columns: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
    row_count: u64,
    position: usize,
}

impl From<StatementOutcome> for SqlResult {
    fn from(outcome: StatementOutcome) -> Self {
        Self {
            columns: outcome.columns,
            rows: outcome.rows,
            row_count: outcome.row_count,
            position: 0,
        }
    }
}

impl SqlResult {
    /// Column names of the result set; empty for statements returning no rows.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows returned or affected, as reported by the server.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn rows(&self) -> &[Vec<Option<String>>] {
        &self.rows
    }

    pub fn fetch_one(&mut self) -> Option<Vec<Option<String>>> {
        let row = self.rows.get(self.position).cloned();
        if row.is_some() {
            self.position += 1;
        }
        row
    }

    pub fn fetch_many(&mut self, size: usize) -> Vec<Vec<Option<String>>> {
        let end = (self.position + size).min(self.rows.len());
        let batch = self.rows[self.position..end].to_vec();
        self.position = end;
        batch
    }

    pub fn fetch_all(&mut self) -> Vec<Vec<Option<String>>> {
        let rest = self.rows[self.position..].to_vec();
        self.position = self.rows.len();
        rest
    }
}

/// Read a SQL file and split it into statements.
pub fn statements_from_file(path: &Path) -> Result<Vec<String>> {
    SqlContent::file(path).statements()
}

/// Split SQL text into individually executable statements.
pub fn split_statements(sql: &str) -> Vec<String> {
    let (protected, blocks) = protect_blocks_and_strip_comments(sql);

    split_on_semicolons(&protected)
        .into_iter()
        .map(|s| restore_blocks(s.trim(), &blocks))
        .filter(|s| !s.is_empty())
        .collect()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Index just past the quoted section starting at `start` (which holds `quote`).
///
/// Doubled quotes are escapes; in `E'...'` strings a backslash escapes the next byte.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let backslash_escapes = quote == b'\''
        && start > 0
        && (bytes[start - 1] == b'E' || bytes[start - 1] == b'e')
        && (start < 2 || !is_ident_byte(bytes[start - 2]));

    let mut i = start + 1;
    while i < bytes.len() {
        if backslash_escapes && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            if i + 1 < bytes.len() && bytes[i + 1] == quote {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// If a dollar-quote opener (`$$` or `$tag$`) starts at `start`, return its end index.
fn dollar_tag_end(bytes: &[u8], start: usize) -> Option<usize> {
    if start > 0 && (is_ident_byte(bytes[start - 1]) || bytes[start - 1] == b'$') {
        return None;
    }
    let mut j = start + 1;
    if j < bytes.len() && bytes[j].is_ascii_digit() {
        return None;
    }
    while j < bytes.len() && is_ident_byte(bytes[j]) {
        j += 1;
    }
    if j < bytes.len() && bytes[j] == b'$' {
        Some(j + 1)
    } else {
        None
    }
}

fn find_closing_tag(bytes: &[u8], from: usize, tag: &[u8]) -> Option<usize> {
    if bytes.len() < tag.len() {
        return None;
    }
    (from..=bytes.len() - tag.len())
        .find(|&k| bytes[k..k + tag.len()].eq_ignore_ascii_case(tag))
        .map(|k| k + tag.len())
}

/// Remove comments and replace dollar-quoted bodies with tokens, in one left-to-right pass.
fn protect_blocks_and_strip_comments(sql: &str) -> (String, Vec<String>) {
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut blocks = Vec::new();
    let mut segment_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => {
                i = skip_quoted(bytes, i, bytes[i]);
            }
            b'-' if i + 1 < bytes.len() && bytes[i + 1] == b'-' => {
                out.push_str(&sql[segment_start..i]);
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                segment_start = i;
            }
            b'/' if i + 1 < bytes.len() && bytes[i + 1] == b'*' => {
                out.push_str(&sql[segment_start..i]);
                // Block comments nest in PostgreSQL.
                let mut depth = 1;
                i += 2;
                while i < bytes.len() && depth > 0 {
                    if bytes[i] == b'/' && i + 1 < bytes.len() && bytes[i + 1] == b'*' {
                        depth += 1;
                        i += 2;
                    } else if bytes[i] == b'*' && i + 1 < bytes.len() && bytes[i + 1] == b'/' {
                        depth -= 1;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
                out.push(' ');
                segment_start = i;
            }
            b'$' => match dollar_tag_end(bytes, i) {
                Some(tag_end) => match find_closing_tag(bytes, tag_end, &bytes[i..tag_end]) {
                    Some(block_end) => {
                        out.push_str(&sql[segment_start..i]);
                        out.push_str(&format!("{}{}__", BLOCK_TOKEN_PREFIX, blocks.len()));
                        blocks.push(sql[i..block_end].to_string());
                        i = block_end;
                        segment_start = i;
                    }
                    None => i = tag_end,
                },
                None => i += 1,
            },
            _ => i += 1,
        }
    }

    out.push_str(&sql[segment_start..]);
    (out, blocks)
}

/// Split on semicolons outside single- and double-quoted sections.
fn split_on_semicolons(sql: &str) -> Vec<&str> {
    let bytes = sql.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' => i = skip_quoted(bytes, i, bytes[i]),
            b';' => {
                statements.push(&sql[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }

    if start < sql.len() {
        statements.push(&sql[start..]);
    }
    statements
}

fn restore_blocks(statement: &str, blocks: &[String]) -> String {
    if !statement.contains(BLOCK_TOKEN_PREFIX) {
        return statement.to_string();
    }
    let mut restored = statement.to_string();
    for (idx, block) in blocks.iter().enumerate() {
        restored = restored.replace(&format!("{}{}__", BLOCK_TOKEN_PREFIX, idx), block);
    }
    restored
}

fn check_forbidden(statement: &str) -> std::result::Result<(), String> {
    let normalized = statement
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase();

    if TRANSACTION_CONTROL.contains(&normalized.as_str()) {
        return Err(format!(
            "'{};' is not allowed in executed SQL: transactions are handled by the migration engine",
            statement.trim()
        ));
    }
    if SEARCH_PATH_RE.is_match(statement.trim()) {
        return Err(
            "setting search_path through pg_catalog.set_config is not allowed in executed SQL"
                .to_string(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameter::ParameterValue;

    #[test]
    fn test_split_simple_statements() {
        let stmts = split_statements("CREATE TABLE a (id int);\nINSERT INTO a VALUES (1);\n");
        assert_eq!(stmts, vec!["CREATE TABLE a (id int)", "INSERT INTO a VALUES (1)"]);
    }

    #[test]
    fn test_trailing_statement_without_semicolon() {
        let stmts = split_statements("SELECT 1; SELECT 2");
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_semicolons_inside_quotes_are_kept() {
        let sql = "COMMENT ON TABLE t IS 'a; b; c';\nSELECT \"odd;name\" FROM t;\nSELECT 'it''s; fine';";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0], "COMMENT ON TABLE t IS 'a; b; c'");
        assert_eq!(stmts[1], "SELECT \"odd;name\" FROM t");
        assert_eq!(stmts[2], "SELECT 'it''s; fine'");
    }

    #[test]
    fn test_escape_string_backslash_quote() {
        let stmts = split_statements(r"SELECT E'a\'; b'; SELECT 2;");
        assert_eq!(stmts, vec![r"SELECT E'a\'; b'", "SELECT 2"]);
    }

    #[test]
    fn test_function_body_kept_intact() {
        let sql = r#"
CREATE TABLE app.foo (id serial PRIMARY KEY, bar text);

CREATE OR REPLACE FUNCTION app.ft_foo() RETURNS trigger AS $BODY$
BEGIN
    NEW.bar := upper(NEW.bar);
    RETURN NEW;
END;
$BODY$ LANGUAGE plpgsql;

CREATE TRIGGER tr_foo BEFORE INSERT ON app.foo
    FOR EACH ROW EXECUTE PROCEDURE app.ft_foo();
"#;
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 3);
        assert!(stmts[0].starts_with("CREATE TABLE app.foo"));
        assert!(stmts[1].starts_with("CREATE OR REPLACE FUNCTION app.ft_foo()"));
        assert!(stmts[1].contains("NEW.bar := upper(NEW.bar);\n    RETURN NEW;\nEND;\n$BODY$"));
        assert!(stmts[1].ends_with("LANGUAGE plpgsql"));
        assert!(stmts[2].starts_with("CREATE TRIGGER tr_foo"));
    }

    #[test]
    fn test_nested_dollar_quotes() {
        let sql = "DO $DO$ BEGIN EXECUTE $$ SELECT 1; $$; PERFORM 2; END $DO$;\nSELECT 3;";
        let stmts = split_statements(sql);
        assert_eq!(
            stmts,
            vec![
                "DO $DO$ BEGIN EXECUTE $$ SELECT 1; $$; PERFORM 2; END $DO$",
                "SELECT 3"
            ]
        );
    }

    #[test]
    fn test_dollar_tags_match_case_insensitively() {
        let stmts = split_statements("SELECT $body$ a; b $BODY$; SELECT 1;");
        assert_eq!(stmts, vec!["SELECT $body$ a; b $BODY$", "SELECT 1"]);
    }

    #[test]
    fn test_positional_parameters_are_not_dollar_quotes() {
        let stmts = split_statements("PREPARE p AS SELECT $1::int; SELECT 2;");
        assert_eq!(stmts, vec!["PREPARE p AS SELECT $1::int", "SELECT 2"]);
    }

    #[test]
    fn test_comments_are_removed() {
        let sql = "-- header; comment\nSELECT 1; /* block; comment */ SELECT 2; -- trailing\n";
        let stmts = split_statements(sql);
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_nested_block_comments() {
        let stmts = split_statements("/* outer /* inner; */ still; comment */ SELECT 1;");
        assert_eq!(stmts, vec!["SELECT 1"]);
    }

    #[test]
    fn test_comment_markers_inside_dollar_body_are_preserved() {
        let sql = "CREATE FUNCTION f() RETURNS text AS $$ SELECT '--not a comment'::text -- real comment\n; $$ LANGUAGE sql;";
        let stmts = split_statements(sql);
        assert_eq!(stmts.len(), 1);
        assert!(stmts[0].contains("'--not a comment'"));
        assert!(stmts[0].contains("-- real comment"));
    }

    #[test]
    fn test_comment_markers_inside_strings_are_preserved() {
        let stmts = split_statements("SELECT '-- keep; me', '/* and me */';");
        assert_eq!(stmts, vec!["SELECT '-- keep; me', '/* and me */'"]);
    }

    #[test]
    fn test_dollar_in_comment_does_not_open_block() {
        let stmts = split_statements("-- costs $$ money\nSELECT 1;\nSELECT 2;");
        assert_eq!(stmts, vec!["SELECT 1", "SELECT 2"]);
    }

    #[test]
    fn test_begin_and_commit_are_rejected() {
        let content = SqlContent::inline("BEGIN;\nCREATE TABLE t (id int);\nCOMMIT;");
        let err = content.validate(&HashMap::new()).unwrap_err();
        assert!(matches!(err, StrataError::InvalidSql { .. }));

        let content = SqlContent::inline("CREATE TABLE t (id int);\ncommit ;");
        assert!(content.validate(&HashMap::new()).is_err());

        let content = SqlContent::inline("start   transaction;");
        assert!(content.validate(&HashMap::new()).is_err());
    }

    #[test]
    fn test_begin_inside_function_body_is_allowed() {
        let content = SqlContent::inline(
            "CREATE FUNCTION f() RETURNS void AS $$ BEGIN; END; $$ LANGUAGE plpgsql;",
        );
        assert!(content.validate(&HashMap::new()).is_ok());
    }

    #[test]
    fn test_search_path_override_is_rejected() {
        let content =
            SqlContent::inline("SELECT pg_catalog.set_config('search_path', '', false);");
        assert!(content.validate(&HashMap::new()).is_err());
    }

    #[test]
    fn test_validate_empty_content() {
        assert!(SqlContent::inline("   \n").validate(&HashMap::new()).is_err());
    }

    #[test]
    fn test_validate_requires_bound_placeholders() {
        let content = SqlContent::inline("CREATE TABLE foo (name VARCHAR(${field_length}));");
        assert!(matches!(
            content.validate(&HashMap::new()),
            Err(StrataError::PlaceholderNotFound { .. })
        ));

        let mut params = HashMap::new();
        params.insert(
            "field_length".to_string(),
            SqlParameter::Literal(ParameterValue::Integer(50)),
        );
        let prepared = content.prepare(&params).unwrap();
        assert_eq!(prepared, vec!["CREATE TABLE foo (name VARCHAR(50))"]);

        params.insert(
            "field_length".to_string(),
            SqlParameter::Literal(ParameterValue::Integer(80)),
        );
        let prepared = content.prepare(&params).unwrap();
        assert_eq!(prepared, vec!["CREATE TABLE foo (name VARCHAR(80))"]);
    }

    #[test]
    fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("01_create.sql");
        std::fs::write(&path, "CREATE TABLE a (id int); CREATE TABLE b (id int);").unwrap();

        let stmts = statements_from_file(&path).unwrap();
        assert_eq!(stmts.len(), 2);
        assert_eq!(SqlContent::file(&path).source_name(), path.display().to_string());

        assert!(SqlContent::file(dir.path().join("missing.sql"))
            .validate(&HashMap::new())
            .is_err());
    }

    #[test]
    fn test_sql_result_cursor() {
        let mut result = SqlResult::from(StatementOutcome {
            columns: vec!["n".to_string()],
            rows: (1..=5).map(|n| vec![Some(n.to_string())]).collect(),
            row_count: 5,
        });
        assert_eq!(result.columns(), &["n".to_string()]);
        assert_eq!(result.row_count(), 5);
        assert_eq!(result.fetch_one(), Some(vec![Some("1".to_string())]));
        assert_eq!(result.fetch_many(2).len(), 2);
        assert_eq!(result.fetch_all().len(), 2);
        assert_eq!(result.fetch_one(), None);
        assert!(result.fetch_many(2).is_empty());
    }
}
