use serde_json::Value;
use tracing::debug;

use querypilot_common::QueryKind;

use crate::coerce::coerce_sentinels;
use crate::query::SqlQuery;
use crate::SafetyViolation;

/// Placeholder style of the relational dialect the statement will run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlDialect {
    /// `$1`, `$2`, ... numbered placeholders.
    Postgres,
    /// `?` positional placeholders.
    MySql,
}

/// Validates and rewrites relational statements before execution.
pub struct SqlGate {
    dialect: SqlDialect,
    row_cap: i64,
}

const FORBIDDEN_VERBS: &[&str] = &["DROP", "TRUNCATE", "ALTER"];

impl SqlGate {
    pub fn new(dialect: SqlDialect, row_cap: i64) -> Self {
        Self { dialect, row_cap }
    }

    /// Run the full gate: structural checks, placeholder normalization to
    /// the target dialect, sentinel coercion, and row-cap enforcement.
    pub fn validate(
        &self,
        sql: &str,
        parameters: Vec<Value>,
        table: Option<String>,
    ) -> Result<SqlQuery, SafetyViolation> {
        let trimmed = sql.trim().trim_end_matches(';').trim();
        if trimmed.is_empty() {
            return Err(SafetyViolation::EmptyStatement);
        }

        // Literal-masked copy: all token scans run on this so that quoted
        // strings cannot smuggle separators, comments, or verbs.
        let masked = mask_string_literals(trimmed);

        if masked.contains(';') {
            return Err(SafetyViolation::MultipleStatements);
        }

        if masked.contains("--") || masked.contains("/*") || masked.contains('#') {
            return Err(SafetyViolation::CommentSyntax);
        }

        let tokens = keyword_tokens(&masked);
        for verb in FORBIDDEN_VERBS {
            if tokens.iter().any(|t| t == verb) {
                return Err(SafetyViolation::ForbiddenVerb((*verb).to_string()));
            }
        }

        let kind = match tokens.first().map(String::as_str) {
            Some("SELECT") | Some("WITH") | Some("SHOW") | Some("EXPLAIN") => QueryKind::Sql,
            Some("INSERT") => QueryKind::Insert,
            Some("UPDATE") => QueryKind::Update,
            Some("DELETE") => QueryKind::Delete,
            Some(other) => {
                return Err(SafetyViolation::UnsupportedOperation(other.to_lowercase()))
            }
            None => return Err(SafetyViolation::EmptyStatement),
        };

        if kind == QueryKind::Update && !tokens.iter().any(|t| t == "WHERE") {
            return Err(SafetyViolation::UpdateWithoutWhere);
        }
        if kind == QueryKind::Delete && !tokens.iter().any(|t| t == "WHERE") {
            return Err(SafetyViolation::DeleteWithoutWhere);
        }

        let (normalized, placeholder_count) = normalize_placeholders(trimmed, self.dialect)?;
        if placeholder_count != parameters.len() {
            return Err(SafetyViolation::ParameterMismatch {
                placeholders: placeholder_count,
                parameters: parameters.len(),
            });
        }

        let final_sql = if kind == QueryKind::Sql {
            apply_row_cap(&normalized, self.row_cap)
        } else {
            normalized
        };

        let parameters = parameters.iter().map(|p| coerce_sentinels(p)).collect();

        debug!(kind = kind.as_str(), "sql statement passed the gate");
        Ok(SqlQuery {
            sql: final_sql,
            parameters,
            table,
            kind,
        })
    }
}

/// Replace the contents of quoted literals with spaces, preserving
/// positions, so scans never match inside strings. Handles `''` escapes.
fn mask_string_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    let mut in_quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match in_quote {
            Some(q) => {
                if c == q {
                    if chars.peek() == Some(&q) {
                        chars.next();
                        out.push(' ');
                        out.push(' ');
                    } else {
                        in_quote = None;
                        out.push(q);
                    }
                } else {
                    out.push(' ');
                }
            }
            None => {
                if c == '\'' || c == '"' {
                    in_quote = Some(c);
                    out.push(c);
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}

fn keyword_tokens(masked: &str) -> Vec<String> {
    masked
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_uppercase())
        .collect()
}

/// Rewrite placeholders into the target dialect's form, preserving the
/// parameter count. `$n` placeholders must appear in ascending order for
/// the positional rewrite to be meaning-preserving.
fn normalize_placeholders(
    sql: &str,
    dialect: SqlDialect,
) -> Result<(String, usize), SafetyViolation> {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut in_quote: Option<char> = None;
    let mut question_count = 0usize;
    let mut dollar_indexes: Vec<usize> = Vec::new();

    while let Some(c) = chars.next() {
        if let Some(q) = in_quote {
            out.push(c);
            if c == q {
                in_quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => {
                in_quote = Some(c);
                out.push(c);
            }
            '?' => {
                question_count += 1;
                match dialect {
                    SqlDialect::Postgres => {
                        out.push_str(&format!("${}", question_count + dollar_indexes.len()))
                    }
                    SqlDialect::MySql => out.push('?'),
                }
            }
            '$' => {
                let mut digits = String::new();
                while let Some(d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(*d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if digits.is_empty() {
                    out.push('$');
                    continue;
                }
                let index: usize = digits
                    .parse()
                    .map_err(|_| SafetyViolation::ParameterMismatch {
                        placeholders: 0,
                        parameters: 0,
                    })?;
                dollar_indexes.push(index);
                match dialect {
                    SqlDialect::Postgres => {
                        out.push('$');
                        out.push_str(&digits);
                    }
                    SqlDialect::MySql => out.push('?'),
                }
            }
            _ => out.push(c),
        }
    }

    if question_count > 0 && !dollar_indexes.is_empty() {
        // Mixing both styles makes positional order ambiguous.
        return Err(SafetyViolation::ParameterMismatch {
            placeholders: question_count + dollar_indexes.len(),
            parameters: 0,
        });
    }

    if !dollar_indexes.is_empty() {
        let ascending = dollar_indexes.windows(2).all(|w| w[0] < w[1]);
        let starts_at_one = dollar_indexes.first() == Some(&1);
        if dialect == SqlDialect::MySql && (!ascending || !starts_at_one) {
            // Positional '?' cannot represent repeated or reordered $n.
            return Err(SafetyViolation::ParameterMismatch {
                placeholders: dollar_indexes.len(),
                parameters: 0,
            });
        }
    }

    let count = if question_count > 0 {
        question_count
    } else {
        dollar_indexes.iter().copied().max().unwrap_or(0)
    };
    Ok((out, count))
}

/// Append or clamp a trailing LIMIT so reads never exceed the cap.
fn apply_row_cap(sql: &str, cap: i64) -> String {
    let masked = mask_string_literals(sql);
    let upper = masked.to_ascii_uppercase();

    if let Some(pos) = upper.rfind(" LIMIT ") {
        let after = &sql[pos + 7..];
        let digits: String = after
            .trim_start()
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        if let Ok(requested) = digits.parse::<i64>() {
            if requested > cap {
                let prefix = &sql[..pos];
                let leading_ws = after.len() - after.trim_start().len();
                let rest = &after[leading_ws + digits.len()..];
                return format!("{prefix} LIMIT {cap}{rest}");
            }
        }
        // A LIMIT clause is present (possibly parameterized); leave it.
        return sql.to_string();
    }
    format!("{sql} LIMIT {cap}")
}

#[cfg(test)]
mod tests {
    use super::{SqlDialect, SqlGate};
    use crate::SafetyViolation;
    use querypilot_common::QueryKind;
    use serde_json::json;

    fn gate() -> SqlGate {
        SqlGate::new(SqlDialect::Postgres, 1000)
    }

    #[test]
    fn multi_statement_block_is_rejected_before_the_drop_is_seen() {
        let err = gate()
            .validate("SELECT 1; DROP TABLE users", vec![], None)
            .expect_err("piggybacked statement must be rejected");
        assert_eq!(err.rule(), "MULTIPLE_STATEMENTS");
    }

    #[test]
    fn a_single_trailing_semicolon_is_tolerated() {
        let query = gate()
            .validate("SELECT id FROM users;", vec![], Some("users".into()))
            .expect("trailing semicolon should be stripped");
        assert!(!query.sql.contains(';'));
    }

    #[test]
    fn delete_without_where_is_rejected() {
        let err = gate()
            .validate("DELETE FROM orders", vec![], Some("orders".into()))
            .expect_err("unbounded delete must be rejected");
        assert_eq!(err.rule(), "DELETE_WITHOUT_WHERE");
        assert!(matches!(err, SafetyViolation::DeleteWithoutWhere));
    }

    #[test]
    fn update_without_where_is_rejected() {
        let err = gate()
            .validate("UPDATE users SET active = true", vec![], None)
            .expect_err("unbounded update must be rejected");
        assert_eq!(err.rule(), "UPDATE_WITHOUT_WHERE");
    }

    #[test]
    fn bounded_delete_passes_and_is_classified() {
        let query = gate()
            .validate(
                "DELETE FROM orders WHERE id = $1",
                vec![json!(7)],
                Some("orders".into()),
            )
            .expect("bounded delete should pass");
        assert_eq!(query.kind, QueryKind::Delete);
    }

    #[test]
    fn ddl_verbs_are_rejected() {
        for sql in [
            "DROP TABLE users",
            "TRUNCATE TABLE logs",
            "ALTER TABLE users ADD COLUMN x int",
        ] {
            let err = gate().validate(sql, vec![], None).expect_err("ddl must be rejected");
            assert_eq!(err.rule(), "FORBIDDEN_VERB");
        }
    }

    #[test]
    fn verbs_inside_string_literals_are_ignored() {
        let query = gate()
            .validate(
                "SELECT * FROM notes WHERE body = 'please DROP me a line'",
                vec![],
                Some("notes".into()),
            )
            .expect("literal content must not trip the verb scan");
        assert_eq!(query.kind, QueryKind::Sql);
    }

    #[test]
    fn comment_syntax_is_rejected() {
        let err = gate()
            .validate("SELECT 1 -- sneaky", vec![], None)
            .expect_err("comments must be rejected");
        assert_eq!(err.rule(), "COMMENT_SYNTAX");

        let err = gate()
            .validate("SELECT /* hidden */ 1", vec![], None)
            .expect_err("block comments must be rejected");
        assert_eq!(err.rule(), "COMMENT_SYNTAX");
    }

    #[test]
    fn question_marks_are_renumbered_for_postgres() {
        let query = gate()
            .validate(
                "SELECT * FROM users WHERE age > ? AND city = ?",
                vec![json!(21), json!("Lisbon")],
                Some("users".into()),
            )
            .expect("placeholder rewrite should succeed");
        assert!(query.sql.contains("$1"));
        assert!(query.sql.contains("$2"));
        assert!(!query.sql.contains('?'));
    }

    #[test]
    fn dollar_placeholders_become_question_marks_for_mysql() {
        let gate = SqlGate::new(SqlDialect::MySql, 1000);
        let query = gate
            .validate(
                "SELECT * FROM users WHERE age > $1 AND city = $2",
                vec![json!(21), json!("Lisbon")],
                Some("users".into()),
            )
            .expect("placeholder rewrite should succeed");
        assert_eq!(query.sql.matches('?').count(), 2);
        assert!(!query.sql.contains('$'));
    }

    #[test]
    fn parameter_count_mismatch_is_fatal() {
        let err = gate()
            .validate("SELECT * FROM users WHERE id = $1", vec![], None)
            .expect_err("missing parameter must be fatal");
        assert_eq!(err.rule(), "PARAMETER_MISMATCH");
    }

    #[test]
    fn select_without_limit_gets_the_cap_appended() {
        let query = gate()
            .validate("SELECT * FROM events", vec![], Some("events".into()))
            .expect("select should pass");
        assert!(query.sql.ends_with("LIMIT 1000"));
    }

    #[test]
    fn oversized_limit_is_clamped_to_the_cap() {
        let query = gate()
            .validate("SELECT * FROM events LIMIT 50000", vec![], None)
            .expect("select should pass");
        assert!(query.sql.contains("LIMIT 1000"));
        assert!(!query.sql.contains("50000"));
    }

    #[test]
    fn limit_under_the_cap_is_preserved() {
        let query = gate()
            .validate("SELECT * FROM events LIMIT 10", vec![], None)
            .expect("select should pass");
        assert!(query.sql.contains("LIMIT 10"));
    }

    #[test]
    fn date_sentinels_in_parameters_are_coerced() {
        let query = gate()
            .validate(
                "SELECT * FROM orders WHERE created_at >= $1",
                vec![json!("DATE_30_DAYS_AGO")],
                Some("orders".into()),
            )
            .expect("select should pass");
        let raw = query.parameters[0]
            .as_str()
            .expect("parameter should still be a string");
        assert!(chrono::DateTime::parse_from_rfc3339(raw).is_ok());
    }
}
