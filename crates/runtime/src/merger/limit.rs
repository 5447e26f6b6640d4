//! Lazy LIMIT/OFFSET decorator over any merged result.

use crate::merger::MergedRows;
use quilt_common::Value;
use quilt_error::Result;
use quilt_sql::Limit;

pub struct LimitMergedRows {
    inner: Box<dyn MergedRows>,
    offset: u64,
    remaining: Option<u64>,
    skipped: bool,
}

impl LimitMergedRows {
    pub fn new(inner: Box<dyn MergedRows>, limit: Limit) -> Self {
        LimitMergedRows {
            inner,
            offset: limit.offset,
            remaining: limit.row_count,
            skipped: false,
        }
    }
}

impl MergedRows for LimitMergedRows {
    fn next(&mut self) -> Result<bool> {
        if !self.skipped {
            self.skipped = true;
            for _ in 0..self.offset {
                if !self.inner.next()? {
                    return Ok(false);
                }
            }
        }
        if let Some(remaining) = self.remaining {
            if remaining == 0 {
                return Ok(false);
            }
        }
        if !self.inner.next()? {
            return Ok(false);
        }
        if let Some(remaining) = &mut self.remaining {
            *remaining -= 1;
        }
        Ok(true)
    }

    fn get(&self, index: usize) -> Result<Value> {
        self.inner.get(index)
    }
}
