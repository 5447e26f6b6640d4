//! The merge engine: folds per-shard result sets into one logical result.
//!
//! Strategy selection follows the statement shape:
//! - aggregations without GROUP BY fold to a single row
//! - GROUP BY (or DISTINCT) merges grouped rows in memory
//! - ORDER BY streams a k-way merge over pre-sorted shard results
//! - plain selects concatenate shard results
//!
//! LIMIT/OFFSET wraps any of the above, skipping lazily.

mod aggregate;
mod groupby;
mod iterator;
mod limit;
mod orderby;

pub use aggregate::AggregateMergedRows;
pub use groupby::GroupByMergedRows;
pub use iterator::IteratorMergedRows;
pub use limit::LimitMergedRows;
pub use orderby::OrderByMergedRows;

use crate::backend::Rows;
use quilt_error::{ErrorCode, ErrorContext, QuiltError, Result};
use quilt_common::Value;
use quilt_sql::{AggregationKind, SelectContext};

/// The merged logical result set. Column indexes are those of the logical
/// projection; derived columns are consumed by the merge and not exposed.
pub trait MergedRows {
    fn next(&mut self) -> Result<bool>;
    fn get(&self, index: usize) -> Result<Value>;
}

impl std::fmt::Debug for dyn MergedRows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MergedRows")
    }
}

/// Picks and builds the merge strategy for one SELECT.
pub fn merge(
    select: Option<&SelectContext>,
    inputs: Vec<Box<dyn Rows>>,
) -> Result<Box<dyn MergedRows>> {
    let select = match select {
        Some(select) => select,
        None => return Ok(Box::new(IteratorMergedRows::new(inputs))),
    };

    for aggregation in &select.aggregations {
        if aggregation.kind == AggregationKind::Avg && aggregation.distinct_arg {
            return Err(QuiltError::new(
                ErrorCode::UnsupportedMerge,
                "AVG(DISTINCT ...) cannot be merged across shards",
            )
            .with_context(ErrorContext::Merge {
                reason: "distinct average".to_string(),
                column: Some(aggregation.arg.clone()),
            }));
        }
    }

    let merged: Box<dyn MergedRows> = if !select.aggregations.is_empty()
        && select.group_by.is_empty()
        && !select.distinct
    {
        Box::new(AggregateMergedRows::new(select, inputs)?)
    } else if !select.group_by.is_empty() || select.distinct {
        Box::new(GroupByMergedRows::new(select, inputs)?)
    } else if !select.order_by.is_empty() {
        Box::new(OrderByMergedRows::new(select, inputs)?)
    } else {
        Box::new(IteratorMergedRows::new(inputs))
    };

    Ok(match select.limit {
        Some(limit) => Box::new(LimitMergedRows::new(merged, limit)),
        None => merged,
    })
}

/// Reads the current row of a shard cursor.
pub(crate) fn current_row(rows: &dyn Rows) -> Result<Vec<Value>> {
    (0..rows.width()).map(|index| rows.get(index)).collect()
}

/// Resolves ORDER BY items to `(column index, desc)` pairs; an unresolved
/// item cannot be aligned with shard rows.
pub(crate) fn order_indexes(select: &SelectContext) -> Result<Vec<(usize, bool)>> {
    select
        .order_by
        .iter()
        .map(|item| {
            item.index.map(|index| (index, item.desc)).ok_or_else(|| {
                QuiltError::new(
                    ErrorCode::ConflictingStreams,
                    format!(
                        "ORDER BY '{}' does not appear in the projection",
                        item.name
                    ),
                )
                .with_context(ErrorContext::Merge {
                    reason: "unaligned order column".to_string(),
                    column: Some(item.name.clone()),
                })
                .with_hint("Project the ordering column so shard results can be aligned")
            })
        })
        .collect()
}

pub(crate) fn compare_rows(
    left: &[Value],
    right: &[Value],
    order: &[(usize, bool)],
) -> std::cmp::Ordering {
    for &(index, desc) in order {
        let ordering = match (left.get(index), right.get(index)) {
            (Some(a), Some(b)) => a.sql_cmp(b),
            _ => std::cmp::Ordering::Equal,
        };
        let ordering = if desc { ordering.reverse() } else { ordering };
        if ordering != std::cmp::Ordering::Equal {
            return ordering;
        }
    }
    std::cmp::Ordering::Equal
}
