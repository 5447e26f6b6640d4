//! In-memory GROUP BY / DISTINCT merge.
//!
//! Shard rows are regrouped by key, partial aggregates folded per group,
//! then the groups are sorted: by ORDER BY when present, otherwise by group
//! key ascending so the output is deterministic.

use crate::backend::Rows;
use crate::merger::aggregate::{finalize_row, fold_row};
use crate::merger::{compare_rows, current_row, order_indexes, MergedRows};
use quilt_common::Value;
use quilt_error::{ErrorCode, ErrorContext, QuiltError, Result};
use quilt_sql::SelectContext;
use std::collections::HashMap;

#[derive(Debug)]
pub struct GroupByMergedRows {
    rows: Vec<Vec<Value>>,
    /// Index into `rows`; `None` before the first `next`.
    cursor: Option<usize>,
}

impl GroupByMergedRows {
    pub fn new(select: &SelectContext, mut inputs: Vec<Box<dyn Rows>>) -> Result<Self> {
        let key_indexes = key_indexes(select)?;

        let mut groups: HashMap<Vec<Value>, Vec<Value>> = HashMap::new();
        let mut insertion: Vec<Vec<Value>> = Vec::new();
        for rows in &mut inputs {
            while rows.next()? {
                let row = current_row(rows.as_ref())?;
                let key: Vec<Value> = key_indexes
                    .iter()
                    .map(|&index| row.get(index).cloned().unwrap_or(Value::Null))
                    .collect();
                match groups.get_mut(&key) {
                    Some(accumulated) => {
                        fold_row(accumulated, &row, &select.aggregations)?;
                    }
                    None => {
                        let mut accumulated = vec![Value::Null; row.len()];
                        // Non-aggregate columns keep the first value seen.
                        for (index, value) in row.iter().enumerate() {
                            accumulated[index] = value.clone();
                        }
                        // Aggregate slots restart from the identity and fold
                        // the first shard row like any other.
                        for aggregation in &select.aggregations {
                            accumulated[aggregation.index] = Value::Null;
                            for derived in [
                                aggregation.derived_count_index,
                                aggregation.derived_sum_index,
                            ]
                            .into_iter()
                            .flatten()
                            {
                                accumulated[derived] = Value::Null;
                            }
                        }
                        fold_row(&mut accumulated, &row, &select.aggregations)?;
                        groups.insert(key.clone(), accumulated);
                        insertion.push(key);
                    }
                }
            }
        }

        let mut merged: Vec<Vec<Value>> = insertion
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .collect();
        for row in &mut merged {
            finalize_row(row, &select.aggregations);
            row.truncate(select.projection_width);
        }

        let order = if select.order_by.is_empty() {
            key_indexes.into_iter().map(|index| (index, false)).collect()
        } else {
            order_indexes(select)?
        };
        merged.sort_by(|left, right| compare_rows(left, right, &order));

        Ok(GroupByMergedRows {
            rows: merged,
            cursor: None,
        })
    }
}

/// Grouping key columns: the GROUP BY items, or the whole projection for
/// a bare DISTINCT.
fn key_indexes(select: &SelectContext) -> Result<Vec<usize>> {
    if select.group_by.is_empty() {
        return Ok((0..select.projection_width).collect());
    }
    select
        .group_by
        .iter()
        .map(|item| {
            item.index.ok_or_else(|| {
                QuiltError::new(
                    ErrorCode::UnsupportedMerge,
                    format!("GROUP BY '{}' does not appear in the projection", item.name),
                )
                .with_context(ErrorContext::Merge {
                    reason: "unaligned group column".to_string(),
                    column: Some(item.name.clone()),
                })
                .with_hint("Project the grouping column so shard rows can be regrouped")
            })
        })
        .collect()
}

impl MergedRows for GroupByMergedRows {
    fn next(&mut self) -> Result<bool> {
        let next = self.cursor.map_or(0, |cursor| cursor + 1);
        if next < self.rows.len() {
            self.cursor = Some(next);
            Ok(true)
        } else {
            self.cursor = Some(self.rows.len());
            Ok(false)
        }
    }

    fn get(&self, index: usize) -> Result<Value> {
        self.cursor
            .and_then(|cursor| self.rows.get(cursor))
            .and_then(|row| row.get(index).cloned())
            .ok_or_else(|| {
                QuiltError::new(
                    ErrorCode::Internal,
                    "Cursor is past the end of the merged result",
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::rows_from;
    use quilt_sql::parse;

    fn select(sql: &str) -> SelectContext {
        parse(sql).unwrap().select.unwrap()
    }

    fn drain(merged: &mut GroupByMergedRows, width: usize) -> Vec<Vec<Value>> {
        let mut out = Vec::new();
        while merged.next().unwrap() {
            out.push((0..width).map(|i| merged.get(i).unwrap()).collect());
        }
        out
    }

    #[test]
    fn test_regroups_and_sums() {
        let context = select("SELECT status, SUM(amount) FROM t_order GROUP BY status");
        let mut merged = GroupByMergedRows::new(
            &context,
            vec![
                rows_from(vec![
                    vec![Value::Text("init".into()), Value::Int(10)],
                    vec![Value::Text("done".into()), Value::Int(5)],
                ]),
                rows_from(vec![vec![Value::Text("init".into()), Value::Int(20)]]),
            ],
        )
        .unwrap();
        let rows = drain(&mut merged, 2);
        assert_eq!(
            rows,
            vec![
                vec![Value::Text("done".into()), Value::Int(5)],
                vec![Value::Text("init".into()), Value::Int(30)],
            ]
        );
    }

    #[test]
    fn test_orders_groups_by_order_by() {
        let context =
            select("SELECT status, COUNT(*) AS cnt FROM t_order GROUP BY status ORDER BY cnt DESC");
        let mut merged = GroupByMergedRows::new(
            &context,
            vec![
                rows_from(vec![
                    vec![Value::Text("a".into()), Value::Int(1)],
                    vec![Value::Text("b".into()), Value::Int(4)],
                ]),
                rows_from(vec![vec![Value::Text("a".into()), Value::Int(2)]]),
            ],
        )
        .unwrap();
        let rows = drain(&mut merged, 2);
        assert_eq!(
            rows,
            vec![
                vec![Value::Text("b".into()), Value::Int(4)],
                vec![Value::Text("a".into()), Value::Int(3)],
            ]
        );
    }

    #[test]
    fn test_distinct_deduplicates_whole_rows() {
        let context = select("SELECT DISTINCT status FROM t_order");
        let mut merged = GroupByMergedRows::new(
            &context,
            vec![
                rows_from(vec![
                    vec![Value::Text("x".into())],
                    vec![Value::Text("y".into())],
                ]),
                rows_from(vec![vec![Value::Text("x".into())]]),
            ],
        )
        .unwrap();
        let rows = drain(&mut merged, 1);
        assert_eq!(
            rows,
            vec![vec![Value::Text("x".into())], vec![Value::Text("y".into())]]
        );
    }

    #[test]
    fn test_group_by_avg_uses_derived_columns() {
        let context = select("SELECT status, AVG(amount) FROM t_order GROUP BY status");
        // Physical rows: status, avg, derived count, derived sum.
        let mut merged = GroupByMergedRows::new(
            &context,
            vec![
                rows_from(vec![vec![
                    Value::Text("s".into()),
                    Value::Float(1.0),
                    Value::Int(1),
                    Value::Int(10),
                ]]),
                rows_from(vec![vec![
                    Value::Text("s".into()),
                    Value::Float(99.0),
                    Value::Int(3),
                    Value::Int(30),
                ]]),
            ],
        )
        .unwrap();
        let rows = drain(&mut merged, 2);
        assert_eq!(rows, vec![vec![Value::Text("s".into()), Value::Float(10.0)]]);
    }

    #[test]
    fn test_unaligned_group_column_rejected() {
        let context = select("SELECT COUNT(*) FROM t_order GROUP BY status");
        let err = GroupByMergedRows::new(&context, vec![rows_from(vec![])]).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedMerge);
    }
}
