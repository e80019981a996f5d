//! Safety Filter
//!
//! Deterministic static gate in front of the executor. Accepts exactly one
//! read-only `SELECT` (optionally behind a `WITH` clause) and rejects
//! everything else. Every SQL string that reaches the database passes
//! through here, including repaired SQL.
//!
//! The text is looked at through several "views": literals masked under
//! standard (`''`) quoting and under backslash-escape quoting, with comments
//! either replaced by a space or removed outright. A statement is accepted
//! only if every view is a single statement, free of forbidden keywords and
//! starting with `SELECT`.

use crate::error_code::ErrorCode;
use crate::stages::SafetyGate;
use crate::types::{StageFailure, StageName, StageResult, StageTrace};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"```[A-Za-z0-9_+-]*").expect("static pattern");
    static ref FORBIDDEN: Regex = Regex::new(concat!(
        r"(?i)\b(delete|update|insert|drop|create|alter|attach|detach|pragma|reindex|vacuum|",
        r"replace|grant|revoke|execute|trigger|begin|commit|rollback)\b",
    ))
    .expect("static pattern");
    static ref LIMIT_CLAUSE: Regex = Regex::new(r"(?i)\blimit\b").expect("static pattern");
}

/// Zero-width characters and BOMs that could split a keyword invisibly
const INVISIBLE: &[char] = &[
    '\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}', '\u{180E}',
];

/// Sanitized statement accepted by the filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeSql {
    pub sql: String,
    pub rationale: String,
}

/// Reason a statement was rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyViolation {
    Empty,
    UnterminatedLiteral,
    MultipleStatements,
    ForbiddenKeyword(String),
    NonSelect,
    ExplainNotAllowed,
    /// Quoting modes disagree on where literals or comments end
    AmbiguousQuoting,
}

impl SafetyViolation {
    pub fn code(&self) -> ErrorCode {
        match self {
            SafetyViolation::MultipleStatements => ErrorCode::SafetyMultiStatement,
            SafetyViolation::ForbiddenKeyword(_) => ErrorCode::SafetyForbiddenKeyword,
            SafetyViolation::Empty
            | SafetyViolation::UnterminatedLiteral
            | SafetyViolation::NonSelect
            | SafetyViolation::ExplainNotAllowed
            | SafetyViolation::AmbiguousQuoting => ErrorCode::SafetyNonSelect,
        }
    }

    /// Short label used for metrics and trace notes
    pub fn reason(&self) -> &'static str {
        match self {
            SafetyViolation::Empty => "empty_statement",
            SafetyViolation::UnterminatedLiteral => "unterminated_literal",
            SafetyViolation::MultipleStatements => "multiple_statements",
            SafetyViolation::ForbiddenKeyword(_) => "forbidden_keyword",
            SafetyViolation::NonSelect => "non_readonly",
            SafetyViolation::ExplainNotAllowed => "explain_not_allowed",
            SafetyViolation::AmbiguousQuoting => "ambiguous_quoting",
        }
    }
}

impl fmt::Display for SafetyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SafetyViolation::Empty => write!(f, "Empty statement"),
            SafetyViolation::UnterminatedLiteral => write!(f, "Unterminated string literal"),
            SafetyViolation::MultipleStatements => write!(f, "Multiple statements detected"),
            SafetyViolation::ForbiddenKeyword(kw) => {
                write!(f, "Forbidden keyword detected: {}", kw)
            }
            SafetyViolation::NonSelect => write!(f, "Non-SELECT statement"),
            SafetyViolation::ExplainNotAllowed => write!(f, "EXPLAIN is not allowed"),
            SafetyViolation::AmbiguousQuoting => write!(
                f,
                "Ambiguous quoting: literal or comment boundaries depend on escape rules"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quoting {
    /// `''` doubles a quote, backslash is an ordinary character
    Standard,
    /// backslash escapes the next character
    Backslash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comments {
    Space,
    Collapse,
}

#[derive(Debug, Clone, Copy)]
struct View {
    quoting: Quoting,
    comments: Comments,
    keep_literals: bool,
}

const fn masked(quoting: Quoting, comments: Comments) -> View {
    View {
        quoting,
        comments,
        keep_literals: false,
    }
}

const MASKED_VIEWS: [View; 4] = [
    masked(Quoting::Standard, Comments::Space),
    masked(Quoting::Standard, Comments::Collapse),
    masked(Quoting::Backslash, Comments::Space),
    masked(Quoting::Backslash, Comments::Collapse),
];

const SANITIZED_VIEW: View = View {
    quoting: Quoting::Standard,
    comments: Comments::Space,
    keep_literals: true,
};

/// Single authoritative SQL safety gate
#[derive(Debug, Clone, Default)]
pub struct SafetyFilter {
    allow_explain: bool,
}

impl SafetyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_explain(mut self, allow_explain: bool) -> Self {
        self.allow_explain = allow_explain;
        self
    }

    /// Validate `sql`; on success `data.sql` is the sanitized statement.
    pub fn check(&self, sql: &str) -> StageResult<SafeSql> {
        let started = Instant::now();
        debug!("🧩 SQL candidate: {}", sql);

        match self.evaluate(sql) {
            Ok(sanitized) => {
                let trace = StageTrace::new(StageName::Safety, started.elapsed())
                    .with_note("sql_len", sanitized.len());
                StageResult::success(
                    SafeSql {
                        sql: sanitized,
                        rationale: "Statement validated as single read-only SELECT \
                                    (literals and comments ignored)."
                            .to_string(),
                    },
                    trace,
                )
            }
            Err(violation) => {
                warn!("Safety rejected statement: {}", violation);
                let trace = StageTrace::new(StageName::Safety, started.elapsed())
                    .with_note("reason", violation.reason());
                StageResult::failure(
                    StageFailure::new(violation.to_string()).with_code(violation.code()),
                    Some(trace),
                )
            }
        }
    }

    /// Accept/reject decision without trace bookkeeping.
    ///
    /// The sanitized statement is evaluated again and must come back
    /// unchanged, so accepted output is always a fixed point.
    pub fn evaluate(&self, sql: &str) -> std::result::Result<String, SafetyViolation> {
        let sanitized = self.decide(&normalize(sql))?;
        match self.decide(&normalize(&sanitized)) {
            Ok(again) if again == sanitized => Ok(sanitized),
            _ => Err(SafetyViolation::AmbiguousQuoting),
        }
    }

    fn decide(&self, normalized: &str) -> std::result::Result<String, SafetyViolation> {
        let mut bodies = Vec::with_capacity(MASKED_VIEWS.len());
        for view in MASKED_VIEWS {
            let masked = scan(normalized, view)?;
            bodies.push(single_statement(&masked)?);
        }

        for body in &bodies {
            if let Some(m) = FORBIDDEN.find(body) {
                return Err(SafetyViolation::ForbiddenKeyword(m.as_str().to_uppercase()));
            }
        }

        for body in &bodies {
            self.require_select(body)?;
        }

        let sanitized = trim_statement(&scan(normalized, SANITIZED_VIEW)?);
        if sanitized.is_empty() {
            return Err(SafetyViolation::Empty);
        }
        Ok(sanitized)
    }

    fn require_select(&self, body: &str) -> std::result::Result<(), SafetyViolation> {
        let (mut word, mut rest) = leading_word(body);

        if word == "EXPLAIN" {
            if !self.allow_explain {
                return Err(SafetyViolation::ExplainNotAllowed);
            }
            (word, rest) = leading_word(rest);
            if word == "QUERY" {
                let (plan, after_plan) = leading_word(rest);
                if plan != "PLAN" {
                    return Err(SafetyViolation::NonSelect);
                }
                (word, rest) = leading_word(after_plan);
            }
        }

        match word.as_str() {
            "SELECT" => Ok(()),
            "WITH" => match cte_main_keyword(rest).as_deref() {
                Some("SELECT") => Ok(()),
                _ => Err(SafetyViolation::NonSelect),
            },
            _ => Err(SafetyViolation::NonSelect),
        }
    }
}

impl SafetyGate for SafetyFilter {
    fn check(&self, sql: &str) -> StageResult<SafeSql> {
        SafetyFilter::check(self, sql)
    }
}

/// Whether the statement carries a `LIMIT` clause outside string literals
pub fn has_limit_clause(sql: &str) -> bool {
    let normalized = normalize(sql);
    let masked = scan(&normalized, MASKED_VIEWS[0]).unwrap_or(normalized);
    LIMIT_CLAUSE.is_match(&masked)
}

/// Strip markdown fences and invisible characters
fn normalize(sql: &str) -> String {
    let unfenced = CODE_FENCE.replace_all(sql, " ");
    unfenced.chars().filter(|c| !INVISIBLE.contains(c)).collect()
}

/// Walk the text once, handling literals and comments together so that a
/// `--` inside a literal is not a comment and a quote inside a comment is
/// not a literal.
fn scan(input: &str, view: View) -> std::result::Result<String, SafetyViolation> {
    let chars: Vec<char> = input.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(input.len());
    let mut i = 0;

    while i < len {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match c {
            '\'' | '"' => {
                let start = i;
                i += 1;
                let mut closed = false;
                while i < len {
                    let ch = chars[i];
                    if view.quoting == Quoting::Backslash && ch == '\\' {
                        i += 2;
                        continue;
                    }
                    if ch == c {
                        if chars.get(i + 1) == Some(&c) {
                            i += 2;
                            continue;
                        }
                        closed = true;
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                if !closed {
                    return Err(SafetyViolation::UnterminatedLiteral);
                }
                if view.keep_literals {
                    out.extend(&chars[start..i]);
                } else {
                    out.push(c);
                    out.push('X');
                    out.push(c);
                }
            }
            '-' if next == Some('-') => {
                while i < len && chars[i] != '\n' {
                    i += 1;
                }
                if view.comments == Comments::Space {
                    out.push(' ');
                }
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < len && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                // unterminated block comments run to end of input, as in SQLite
                i = (i + 2).min(len);
                if view.comments == Comments::Space {
                    out.push(' ');
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok(out)
}

/// Split on `;` and require exactly one non-empty fragment.
fn single_statement(masked: &str) -> std::result::Result<String, SafetyViolation> {
    let mut fragments = masked.split(';').map(str::trim).filter(|p| !p.is_empty());
    let first = fragments.next().ok_or(SafetyViolation::Empty)?;
    if fragments.next().is_some() {
        return Err(SafetyViolation::MultipleStatements);
    }
    Ok(first.to_string())
}

fn trim_statement(s: &str) -> String {
    s.trim_matches(|c: char| c == ';' || c.is_whitespace()).to_string()
}

/// Uppercased first word and the remainder after it
fn leading_word(s: &str) -> (String, &str) {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .find(|(_, c)| !(c.is_alphanumeric() || *c == '_'))
        .map(|(idx, _)| idx)
        .unwrap_or(s.len());
    (s[..end].to_uppercase(), &s[end..])
}

/// First top-level keyword after the CTE list of a `WITH` clause.
///
/// Parenthesized CTE bodies are skipped by depth; `AS` following a column
/// list is part of the CTE header.
fn cte_main_keyword(rest: &str) -> Option<String> {
    let chars: Vec<char> = rest.chars().collect();
    let len = chars.len();
    let mut depth: i32 = 0;
    let mut after_body = false;
    let mut i = 0;

    while i < len {
        let c = chars[i];
        match c {
            '(' => {
                depth += 1;
                i += 1;
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
                if depth == 0 {
                    after_body = true;
                }
                i += 1;
            }
            _ if depth > 0 => i += 1,
            ',' => {
                after_body = false;
                i += 1;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < len && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect::<String>().to_uppercase();
                if after_body {
                    if word == "AS" {
                        after_body = false;
                        continue;
                    }
                    return Some(word);
                }
            }
            _ => i += 1,
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejects(sql: &str) -> SafetyViolation {
        SafetyFilter::new()
            .evaluate(sql)
            .expect_err(&format!("expected rejection for {sql:?}"))
    }

    fn accepts(sql: &str) -> String {
        SafetyFilter::new()
            .evaluate(sql)
            .unwrap_or_else(|v| panic!("expected acceptance for {sql:?}, got {v}"))
    }

    #[test]
    fn test_allows_select_and_strips_trailing_semicolon() {
        let result = SafetyFilter::new().check("SELECT * FROM users;");
        assert!(result.is_ok());
        assert_eq!(result.data().unwrap().sql, "SELECT * FROM users");
        assert_eq!(result.trace().unwrap().stage, StageName::Safety);
    }

    #[test]
    fn test_allows_cte_select() {
        let sql = "
            WITH recent AS (
              SELECT id FROM users WHERE created_at > '2024-01-01'
            )
            SELECT * FROM users u JOIN recent r ON u.id = r.id;";
        accepts(sql);
        accepts(
            "WITH RECURSIVE cnt(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM cnt LIMIT 5) \
             SELECT x FROM cnt",
        );
        accepts("WITH a AS (SELECT 1), b AS NOT MATERIALIZED (SELECT 2) SELECT * FROM a, b");
    }

    #[test]
    fn test_allows_comments_and_fences() {
        assert_eq!(accepts("/* head */ \n -- inline\n SELECT 1; -- tail"), "SELECT 1");
        assert_eq!(accepts("```sql\nSELECT name FROM users\n```"), "SELECT name FROM users");
    }

    #[test]
    fn test_keywords_inside_literals_are_ignored() {
        let out = accepts("SELECT 'DROP TABLE x' as note, 'delete from y' as text;");
        assert!(out.contains("'DROP TABLE x'"));
        accepts("SELECT 'a;b' AS semi, 'it''s' AS quoted");
        accepts("SELECT '-- not a comment' AS c");
    }

    #[test]
    fn test_blocks_write_statements() {
        assert_eq!(
            rejects("DELETE FROM users;"),
            SafetyViolation::ForbiddenKeyword("DELETE".into())
        );
        for sql in [
            "UPDATE users SET name='X' WHERE id=1;",
            "INSERT INTO users(id) VALUES (1);",
            "DROP TABLE users;",
            "CREATE TABLE x(id INT);",
            "ALTER TABLE users ADD COLUMN x INT;",
            "ATTACH DATABASE 'hack.db' AS h;",
            "PRAGMA journal_mode=WAL;",
            "pragma journal_mode=WAL;",
            "BEGIN; SELECT 1",
            "VACUUM",
        ] {
            rejects(sql);
        }
    }

    #[test]
    fn test_blocks_stacked_statements() {
        assert_eq!(
            rejects("SELECT * FROM users; DELETE FROM users;"),
            SafetyViolation::MultipleStatements
        );
        assert_eq!(
            rejects("SELECT 1;  /* spacer */  SELECT 2;"),
            SafetyViolation::MultipleStatements
        );
        accepts("SELECT 1;  -- trailing comment\n");
        accepts("SELECT 1;;;");
    }

    #[test]
    fn test_blocks_dml_inside_cte() {
        let violation = rejects("WITH bad AS (DELETE FROM users RETURNING *) SELECT * FROM users;");
        assert_eq!(violation, SafetyViolation::ForbiddenKeyword("DELETE".into()));
    }

    #[test]
    fn test_blocks_comment_split_keywords() {
        assert_eq!(
            rejects("DR/*x*/OP TABLE t"),
            SafetyViolation::ForbiddenKeyword("DROP".into())
        );
        rejects("/*D*/ROP TABLE users;");
        rejects("SELECT 1 FROM t WHERE id IN (DE/**/LETE)");
    }

    #[test]
    fn test_blocks_invisible_character_tricks() {
        assert_eq!(
            rejects("SELECT 1; DR\u{200B}OP TABLE t"),
            SafetyViolation::MultipleStatements
        );
        assert_eq!(
            rejects("\u{FEFF}DR\u{200D}OP TABLE t"),
            SafetyViolation::ForbiddenKeyword("DROP".into())
        );
    }

    #[test]
    fn test_backslash_escape_cannot_hide_statements() {
        // Under standard quoting the literal ends at `\'` and a DROP follows.
        rejects("SELECT 'a\\'; DROP TABLE t; --'");
    }

    #[test]
    fn test_rejects_unterminated_literal() {
        assert_eq!(rejects("SELECT 'abc"), SafetyViolation::UnterminatedLiteral);
    }

    #[test]
    fn test_explain_requires_flag() {
        assert_eq!(rejects("EXPLAIN SELECT 1"), SafetyViolation::ExplainNotAllowed);
        let filter = SafetyFilter::new().with_explain(true);
        assert!(filter.evaluate("EXPLAIN SELECT 1").is_ok());
        assert!(filter.evaluate("EXPLAIN QUERY PLAN SELECT * FROM t").is_ok());
        assert!(filter.evaluate("EXPLAIN VALUES (1)").is_err());
    }

    #[test]
    fn test_rejects_non_select_and_empty() {
        assert_eq!(rejects("VALUES (1)"), SafetyViolation::NonSelect);
        assert_eq!(rejects("   ;  "), SafetyViolation::Empty);
        assert_eq!(rejects("-- just a comment"), SafetyViolation::Empty);
        assert_eq!(rejects("WITH x AS (SELECT 1) VALUES (2)"), SafetyViolation::NonSelect);
    }

    #[test]
    fn test_sanitized_output_is_stable() {
        let filter = SafetyFilter::new();
        let once = filter.evaluate("/* c */ SELECT name -- n\n FROM users;").unwrap();
        let twice = filter.evaluate(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_failure_carries_code_and_reason() {
        let result = SafetyFilter::new().check("DROP TABLE users;");
        assert!(!result.is_ok());
        assert_eq!(result.error_code(), Some(ErrorCode::SafetyForbiddenKeyword));
        assert!(result.errors()[0].contains("Forbidden keyword detected"));
        assert_eq!(
            result.trace().unwrap().note("reason"),
            Some(&serde_json::json!("forbidden_keyword"))
        );
    }

    #[test]
    fn test_escape_dependent_comment_is_rejected() {
        // backslash quoting reads one literal to the end, standard quoting a comment
        assert_eq!(rejects("SELECT 'a\\' -- '"), SafetyViolation::AmbiguousQuoting);
        assert_eq!(rejects("SELECT 'a\\' /* ' */"), SafetyViolation::AmbiguousQuoting);
        assert_eq!(
            SafetyFilter::new().check("SELECT 'a\\' -- '").error_code(),
            Some(ErrorCode::SafetyNonSelect)
        );
        assert_eq!(accepts("SELECT 'a\\b' AS path"), "SELECT 'a\\b' AS path");
    }

    #[test]
    fn test_limit_detection_ignores_literals() {
        assert!(has_limit_clause("SELECT * FROM t LIMIT 10"));
        assert!(!has_limit_clause("SELECT * FROM t WHERE note = 'limit'"));
        assert!(!has_limit_clause("SELECT * FROM t -- limit 5"));
    }
}
