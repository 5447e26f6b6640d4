//! Single-row aggregate merge, and the accumulator shared with the grouped
//! merge.
//!
//! Shard rows carry partial aggregates; COUNT and SUM add up, MAX/MIN keep
//! the extreme, AVG recomputes from its derived COUNT and SUM columns.

use crate::backend::Rows;
use crate::merger::{current_row, MergedRows};
use quilt_common::Value;
use quilt_error::{ErrorCode, ErrorContext, QuiltError, Result};
use quilt_sql::{AggregationItem, AggregationKind, SelectContext};

/// Folds one shard row into the accumulated row (physical width).
pub(crate) fn fold_row(
    accumulated: &mut [Value],
    row: &[Value],
    aggregations: &[AggregationItem],
) -> Result<()> {
    for aggregation in aggregations {
        match aggregation.kind {
            AggregationKind::Count | AggregationKind::Sum => {
                add_into(accumulated, row, aggregation.index, &aggregation.arg)?;
            }
            AggregationKind::Max => extreme_into(accumulated, row, aggregation.index, true),
            AggregationKind::Min => extreme_into(accumulated, row, aggregation.index, false),
            AggregationKind::Avg => {
                for index in [
                    aggregation.derived_count_index,
                    aggregation.derived_sum_index,
                ]
                .into_iter()
                .flatten()
                {
                    add_into(accumulated, row, index, &aggregation.arg)?;
                }
            }
        }
    }
    Ok(())
}

/// Replaces AVG slots with derived sum / derived count and zero-fills
/// never-seen COUNTs.
pub(crate) fn finalize_row(row: &mut [Value], aggregations: &[AggregationItem]) {
    for aggregation in aggregations {
        match aggregation.kind {
            AggregationKind::Count => {
                if row.get(aggregation.index).is_some_and(Value::is_null) {
                    row[aggregation.index] = Value::Int(0);
                }
            }
            AggregationKind::Avg => {
                let count = aggregation
                    .derived_count_index
                    .and_then(|index| row.get(index))
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let sum = aggregation
                    .derived_sum_index
                    .and_then(|index| row.get(index))
                    .and_then(Value::as_f64);
                row[aggregation.index] = match sum {
                    Some(sum) if count > 0.0 => Value::Float(sum / count),
                    _ => Value::Null,
                };
            }
            _ => {}
        }
    }
}

fn add_into(accumulated: &mut [Value], row: &[Value], index: usize, column: &str) -> Result<()> {
    let incoming = match row.get(index) {
        Some(value) => value,
        None => return Ok(()),
    };
    let merged = accumulated[index].sql_add(incoming).ok_or_else(|| {
        QuiltError::new(
            ErrorCode::UnsupportedMerge,
            format!("Cannot sum non-numeric values for '{}'", column),
        )
        .with_context(ErrorContext::Merge {
            reason: "non-numeric aggregate".to_string(),
            column: Some(column.to_string()),
        })
    })?;
    accumulated[index] = merged;
    Ok(())
}

fn extreme_into(accumulated: &mut [Value], row: &[Value], index: usize, keep_greater: bool) {
    let incoming = match row.get(index) {
        Some(value) if !value.is_null() => value,
        _ => return,
    };
    let current = &accumulated[index];
    let replace = current.is_null()
        || if keep_greater {
            incoming.sql_cmp(current) == std::cmp::Ordering::Greater
        } else {
            incoming.sql_cmp(current) == std::cmp::Ordering::Less
        };
    if replace {
        accumulated[index] = incoming.clone();
    }
}

/// Merge for aggregations without GROUP BY: always exactly one output row.
#[derive(Debug)]
pub struct AggregateMergedRows {
    row: Vec<Value>,
    emitted: bool,
}

impl AggregateMergedRows {
    pub fn new(select: &SelectContext, mut inputs: Vec<Box<dyn Rows>>) -> Result<Self> {
        let mut accumulated = vec![Value::Null; select.physical_width()];
        for rows in &mut inputs {
            while rows.next()? {
                let row = current_row(rows.as_ref())?;
                fold_row(&mut accumulated, &row, &select.aggregations)?;
            }
        }
        finalize_row(&mut accumulated, &select.aggregations);
        accumulated.truncate(select.projection_width);
        Ok(AggregateMergedRows {
            row: accumulated,
            emitted: false,
        })
    }
}

impl MergedRows for AggregateMergedRows {
    fn next(&mut self) -> Result<bool> {
        if self.emitted {
            return Ok(false);
        }
        self.emitted = true;
        Ok(true)
    }

    fn get(&self, index: usize) -> Result<Value> {
        self.row.get(index).cloned().ok_or_else(|| {
            QuiltError::new(
                ErrorCode::Internal,
                format!("Column index {} out of range", index),
            )
        })
    }
}
