//! Streaming ORDER BY merge: each shard result arrives pre-sorted, so one
//! buffered row per shard is enough to emit globally sorted rows.

use crate::backend::Rows;
use crate::merger::{compare_rows, current_row, order_indexes, MergedRows};
use quilt_common::Value;
use quilt_error::{ErrorCode, QuiltError, Result};
use quilt_sql::SelectContext;

#[derive(Debug)]
struct Cursor {
    rows: Box<dyn Rows>,
    buffered: Option<Vec<Value>>,
}

impl Cursor {
    fn advance(&mut self) -> Result<()> {
        self.buffered = if self.rows.next()? {
            Some(current_row(self.rows.as_ref())?)
        } else {
            None
        };
        Ok(())
    }
}

#[derive(Debug)]
pub struct OrderByMergedRows {
    cursors: Vec<Cursor>,
    order: Vec<(usize, bool)>,
    /// Cursor whose buffered row is the current output row.
    current: Option<usize>,
    started: bool,
}

impl OrderByMergedRows {
    pub fn new(select: &SelectContext, inputs: Vec<Box<dyn Rows>>) -> Result<Self> {
        Ok(OrderByMergedRows {
            cursors: inputs
                .into_iter()
                .map(|rows| Cursor {
                    rows,
                    buffered: None,
                })
                .collect(),
            order: order_indexes(select)?,
            current: None,
            started: false,
        })
    }

    fn pick_min(&self) -> Option<usize> {
        let mut best: Option<usize> = None;
        for (index, cursor) in self.cursors.iter().enumerate() {
            let row = match &cursor.buffered {
                Some(row) => row,
                None => continue,
            };
            match best {
                None => best = Some(index),
                Some(current_best) => {
                    let best_row = self.cursors[current_best]
                        .buffered
                        .as_ref()
                        .unwrap_or(row);
                    // Ties keep the earlier shard for stability.
                    if compare_rows(row, best_row, &self.order) == std::cmp::Ordering::Less {
                        best = Some(index);
                    }
                }
            }
        }
        best
    }
}

impl MergedRows for OrderByMergedRows {
    fn next(&mut self) -> Result<bool> {
        if !self.started {
            self.started = true;
            for cursor in &mut self.cursors {
                cursor.advance()?;
            }
        } else if let Some(current) = self.current {
            self.cursors[current].advance()?;
        }
        self.current = self.pick_min();
        Ok(self.current.is_some())
    }

    fn get(&self, index: usize) -> Result<Value> {
        self.current
            .and_then(|cursor| self.cursors[cursor].buffered.as_ref())
            .and_then(|row| row.get(index).cloned())
            .ok_or_else(|| {
                QuiltError::new(
                    ErrorCode::Internal,
                    "Cursor is past the end of the merged result",
                )
            })
    }
}
