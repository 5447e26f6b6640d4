//! Per-shard SQL generation by token-stream rewriting.
//!
//! The original statement is re-tokenized (whitespace preserved) and emitted
//! token by token, with three kinds of edits:
//!
//! - logical table names replaced by the unit's physical names
//! - AVG's derived `COUNT(x) AS ..., SUM(x) AS ...` columns appended to the
//!   projection, just before the top-level FROM
//! - a generated key column and its literal values appended to an INSERT
//!
//! Edits are literal-only, so `?` placeholder ordinals never shift.

use quilt_common::Value;
use quilt_error::{ErrorCode, QuiltError, Result};
use sqlparser::dialect::GenericDialect;
use sqlparser::keywords::Keyword;
use sqlparser::tokenizer::{Token, Tokenizer, Word};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::statement::{AggregationKind, SqlStatement};
use crate::{AVG_DERIVED_COUNT_ALIAS, AVG_DERIVED_SUM_ALIAS};

/// A key generated for an INSERT that did not mention the key column.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    pub column: String,
    /// One value per VALUES row, in row order.
    pub values: Vec<Value>,
}

/// Everything one execution unit needs rewritten into its SQL.
#[derive(Debug)]
pub struct RewriteInput<'a> {
    pub statement: &'a SqlStatement,
    /// Logical table name (lowercase-insensitive) to physical table name.
    pub table_map: &'a BTreeMap<String, String>,
    pub generated_key: Option<&'a GeneratedKey>,
}

/// Produces the physical SQL text for one execution unit.
pub fn rewrite(input: &RewriteInput<'_>) -> Result<String> {
    let dialect = GenericDialect {};
    let tokens = Tokenizer::new(&dialect, &input.statement.sql)
        .tokenize()
        .map_err(|e| {
            QuiltError::new(
                ErrorCode::SyntaxError,
                format!("Cannot tokenize SQL for rewriting: {}", e),
            )
        })?;

    let derived = derived_projection(input.statement);
    let mut insert_edit = input
        .generated_key
        .map(|key| InsertEdit::new(key, input.statement));

    let mut out = String::with_capacity(input.statement.sql.len() + 32);
    let mut depth = 0usize;
    let mut derived_pending = derived.is_some();
    let mut previous_was_period = false;

    for token in &tokens {
        match token {
            Token::LParen => {
                if let Some(edit) = insert_edit.as_mut() {
                    edit.open_paren(depth);
                }
                depth += 1;
            }
            Token::RParen => {
                depth = depth.saturating_sub(1);
                if let Some(edit) = insert_edit.as_mut() {
                    if let Some(text) = edit.close_paren(depth) {
                        out.push_str(&text);
                    }
                }
            }
            Token::Word(word) => {
                if derived_pending && depth == 0 && word.keyword == Keyword::FROM {
                    trim_trailing_space(&mut out);
                    out.push_str(derived.as_deref().unwrap_or(""));
                    out.push(' ');
                    derived_pending = false;
                }
                if let Some(edit) = insert_edit.as_mut() {
                    edit.word(word, depth);
                }
                if !previous_was_period {
                    if let Some(physical) = physical_table(word, input.table_map) {
                        out.push_str(physical);
                        previous_was_period = false;
                        continue;
                    }
                }
            }
            // The tokenizer unescapes doubled quotes but `Token`'s Display
            // does not re-escape them.
            Token::SingleQuotedString(s) => {
                previous_was_period = false;
                let _ = write!(out, "'{}'", s.replace('\'', "''"));
                continue;
            }
            _ => {}
        }
        previous_was_period = matches!(token, Token::Period);
        let _ = write!(out, "{}", token);
    }

    Ok(out)
}

fn physical_table<'a>(word: &Word, table_map: &'a BTreeMap<String, String>) -> Option<&'a str> {
    if word.quote_style.is_some() {
        return None;
    }
    table_map
        .iter()
        .find(|(logical, _)| logical.eq_ignore_ascii_case(&word.value))
        .map(|(_, physical)| physical.as_str())
}

/// `, COUNT(x) AS AVG_DERIVED_COUNT_k, SUM(x) AS AVG_DERIVED_SUM_k` for each
/// AVG in the projection, in aggregation order.
fn derived_projection(statement: &SqlStatement) -> Option<String> {
    let select = statement.select.as_ref()?;
    let mut text = String::new();
    let mut ordinal = 0usize;
    for aggregation in &select.aggregations {
        if aggregation.kind != AggregationKind::Avg {
            continue;
        }
        let _ = write!(
            text,
            ", COUNT({arg}) AS {count_alias}{ordinal}, SUM({arg}) AS {sum_alias}{ordinal}",
            arg = aggregation.arg,
            count_alias = AVG_DERIVED_COUNT_ALIAS,
            sum_alias = AVG_DERIVED_SUM_ALIAS,
            ordinal = ordinal,
        );
        ordinal += 1;
    }
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn trim_trailing_space(out: &mut String) {
    while out.ends_with(' ') || out.ends_with('\t') || out.ends_with('\n') {
        out.pop();
    }
}

/// Tracks INSERT structure during emission: the first top-level paren group
/// is the column list, each top-level group after VALUES is one row. The key
/// column is appended to the former, one literal to each of the latter.
struct InsertEdit<'a> {
    key: &'a GeneratedKey,
    has_column_list: bool,
    seen_values: bool,
    in_column_list: bool,
    in_row: bool,
    row: usize,
}

impl<'a> InsertEdit<'a> {
    fn new(key: &'a GeneratedKey, statement: &SqlStatement) -> Self {
        let has_column_list = statement
            .insert
            .as_ref()
            .map(|i| !i.columns.is_empty())
            .unwrap_or(false);
        InsertEdit {
            key,
            has_column_list,
            seen_values: false,
            in_column_list: false,
            in_row: false,
            row: 0,
        }
    }

    fn word(&mut self, word: &Word, depth: usize) {
        if depth == 0 && word.keyword == Keyword::VALUES {
            self.seen_values = true;
        }
    }

    fn open_paren(&mut self, depth: usize) {
        if depth != 0 {
            return;
        }
        if self.seen_values {
            self.in_row = true;
        } else if self.has_column_list {
            self.in_column_list = true;
        }
    }

    /// Text to splice in before the closing paren, if this one ends the
    /// column list or a row.
    fn close_paren(&mut self, depth: usize) -> Option<String> {
        if depth != 0 {
            return None;
        }
        if self.in_column_list {
            self.in_column_list = false;
            return Some(format!(", {}", self.key.column));
        }
        if self.in_row {
            self.in_row = false;
            let value = self.key.values.get(self.row).cloned().unwrap_or(Value::Null);
            self.row += 1;
            return Some(format!(", {}", value));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::parse;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_replaces_logical_tables() {
        let statement = parse("SELECT * FROM t_order WHERE order_id = ?").unwrap();
        let table_map = map(&[("t_order", "t_order_1")]);
        let sql = rewrite(&RewriteInput {
            statement: &statement,
            table_map: &table_map,
            generated_key: None,
        })
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t_order_1 WHERE order_id = ?");
    }

    #[test]
    fn test_replaces_binding_tables_in_join() {
        let statement = parse(
            "SELECT o.order_id FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id",
        )
        .unwrap();
        let table_map = map(&[("t_order", "t_order_0"), ("t_order_item", "t_order_item_0")]);
        let sql = rewrite(&RewriteInput {
            statement: &statement,
            table_map: &table_map,
            generated_key: None,
        })
        .unwrap();
        assert!(sql.contains("FROM t_order_0 o"));
        assert!(sql.contains("JOIN t_order_item_0 i"));
    }

    #[test]
    fn test_case_insensitive_table_match() {
        let statement = parse("SELECT * FROM T_ORDER").unwrap();
        let table_map = map(&[("t_order", "t_order_1")]);
        let sql = rewrite(&RewriteInput {
            statement: &statement,
            table_map: &table_map,
            generated_key: None,
        })
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t_order_1");
    }

    #[test]
    fn test_avg_derives_count_and_sum() {
        let statement = parse("SELECT AVG(price) FROM t_order").unwrap();
        let table_map = map(&[("t_order", "t_order_0")]);
        let sql = rewrite(&RewriteInput {
            statement: &statement,
            table_map: &table_map,
            generated_key: None,
        })
        .unwrap();
        assert_eq!(
            sql,
            "SELECT AVG(price), COUNT(price) AS AVG_DERIVED_COUNT_0, \
             SUM(price) AS AVG_DERIVED_SUM_0 FROM t_order_0"
        );
    }

    #[test]
    fn test_avg_rewrite_preserves_placeholders() {
        let statement =
            parse("SELECT AVG(price) FROM t_order WHERE user_id = ?").unwrap();
        let table_map = map(&[("t_order", "t_order_0")]);
        let sql = rewrite(&RewriteInput {
            statement: &statement,
            table_map: &table_map,
            generated_key: None,
        })
        .unwrap();
        assert!(sql.ends_with("WHERE user_id = ?"));
        assert_eq!(sql.matches('?').count(), 1);
    }

    #[test]
    fn test_appends_generated_key() {
        let statement =
            parse("INSERT INTO t_order (user_id, status) VALUES (?, ?)").unwrap();
        let table_map = map(&[("t_order", "t_order_1")]);
        let key = GeneratedKey {
            column: "order_id".to_string(),
            values: vec![Value::Int(1001)],
        };
        let sql = rewrite(&RewriteInput {
            statement: &statement,
            table_map: &table_map,
            generated_key: Some(&key),
        })
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO t_order_1 (user_id, status, order_id) VALUES (?, ?, 1001)"
        );
    }

    #[test]
    fn test_appends_generated_key_per_row() {
        let statement =
            parse("INSERT INTO t_order (user_id) VALUES (?), (?)").unwrap();
        let table_map = map(&[("t_order", "t_order_0")]);
        let key = GeneratedKey {
            column: "order_id".to_string(),
            values: vec![Value::Int(7), Value::Int(8)],
        };
        let sql = rewrite(&RewriteInput {
            statement: &statement,
            table_map: &table_map,
            generated_key: Some(&key),
        })
        .unwrap();
        assert_eq!(
            sql,
            "INSERT INTO t_order_0 (user_id, order_id) VALUES (?, 7), (?, 8)"
        );
    }

    #[test]
    fn test_untouched_without_rule_tables() {
        let statement = parse("SELECT * FROM t_config").unwrap();
        let table_map = map(&[("t_order", "t_order_0")]);
        let sql = rewrite(&RewriteInput {
            statement: &statement,
            table_map: &table_map,
            generated_key: None,
        })
        .unwrap();
        assert_eq!(sql, "SELECT * FROM t_config");
    }
}
