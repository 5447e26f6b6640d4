//! Concatenating merge: shard results replay back to back, in unit order.

use crate::backend::Rows;
use crate::merger::MergedRows;
use quilt_common::Value;
use quilt_error::{ErrorCode, QuiltError, Result};

pub struct IteratorMergedRows {
    inputs: Vec<Box<dyn Rows>>,
    current: usize,
}

impl IteratorMergedRows {
    pub fn new(inputs: Vec<Box<dyn Rows>>) -> Self {
        IteratorMergedRows { inputs, current: 0 }
    }
}

impl MergedRows for IteratorMergedRows {
    fn next(&mut self) -> Result<bool> {
        while let Some(rows) = self.inputs.get_mut(self.current) {
            if rows.next()? {
                return Ok(true);
            }
            self.current += 1;
        }
        Ok(false)
    }

    fn get(&self, index: usize) -> Result<Value> {
        match self.inputs.get(self.current) {
            Some(rows) => rows.get(index),
            None => Err(QuiltError::new(
                ErrorCode::Internal,
                "Cursor is past the end of the merged result",
            )),
        }
    }
}
