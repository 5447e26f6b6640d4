//! Statement-level executors layered over the engine: queries, updates and
//! batches, each with its fallback for suppressed failures.

use crate::backend::{BackendStatement, Rows};
use crate::executor::{ExceptionPolicy, ExecutorEngine};
use quilt_common::Value;
use quilt_error::{ErrorCode, ErrorContext, QuiltError, Result};
use std::sync::Arc;
use tracing::info;

/// One routed unit, prepared against its backend and ready to run.
pub struct PreparedUnit {
    pub data_source: String,
    pub sql: String,
    pub statement: Box<dyn BackendStatement>,
    pub parameters: Vec<Value>,
}

/// One routed unit of a batch, carrying every parameter set it accumulated
/// and the logical batch positions they came from.
pub struct BatchUnit {
    pub data_source: String,
    pub sql: String,
    pub statement: Box<dyn BackendStatement>,
    pub parameter_sets: Vec<Vec<Value>>,
    /// `batch_indexes[local]` = logical add-batch position of set `local`.
    pub batch_indexes: Vec<usize>,
}

/// Empty result set, substituted for suppressed query failures.
struct EmptyRows;

impl Rows for EmptyRows {
    fn next(&mut self) -> Result<bool> {
        Ok(false)
    }

    fn get(&self, _index: usize) -> Result<Value> {
        Err(QuiltError::new(
            ErrorCode::Internal,
            "Cannot read from an empty result set",
        ))
    }

    fn width(&self) -> usize {
        0
    }
}

fn task_failed(err: QuiltError, data_source: &str, sql: &str) -> QuiltError {
    QuiltError::new(
        ErrorCode::TaskFailed,
        format!("Execution failed on '{}': {}", data_source, err.message),
    )
    .with_context(ErrorContext::Execution {
        datasource: data_source.to_string(),
        sql: sql.to_string(),
    })
}

/// Fans prepared units out over the engine.
pub struct StatementExecutor {
    engine: Arc<ExecutorEngine>,
    policy: ExceptionPolicy,
    sql_show: bool,
}

impl StatementExecutor {
    pub fn new(engine: Arc<ExecutorEngine>, policy: ExceptionPolicy, sql_show: bool) -> Self {
        StatementExecutor {
            engine,
            policy,
            sql_show,
        }
    }

    fn show(&self, units: &[PreparedUnit]) {
        if !self.sql_show {
            return;
        }
        for unit in units {
            info!(target: "sql", data_source = %unit.data_source, sql = %unit.sql);
        }
    }

    /// One result set per unit, in unit order. Suppressed failures read as
    /// empty result sets.
    pub fn execute_query(&self, units: Vec<PreparedUnit>) -> Result<Vec<Box<dyn Rows>>> {
        self.show(&units);
        self.engine.execute_group(
            units,
            self.policy,
            |mut unit| {
                unit.statement
                    .execute_query(&unit.parameters)
                    .map_err(|err| task_failed(err, &unit.data_source, &unit.sql))
            },
            || Box::new(EmptyRows) as Box<dyn Rows>,
        )
    }

    /// Sum of affected rows. Suppressed failures count zero.
    pub fn execute_update(&self, units: Vec<PreparedUnit>) -> Result<u64> {
        self.show(&units);
        let counts = self.engine.execute_group(
            units,
            self.policy,
            |mut unit| {
                unit.statement
                    .execute_update(&unit.parameters)
                    .map_err(|err| task_failed(err, &unit.data_source, &unit.sql))
            },
            || 0,
        )?;
        Ok(counts.into_iter().sum())
    }

    /// Generic execute; the first unit's answer is the statement's answer.
    pub fn execute(&self, units: Vec<PreparedUnit>) -> Result<bool> {
        self.show(&units);
        let results = self.engine.execute_group(
            units,
            self.policy,
            |mut unit| {
                unit.statement
                    .execute(&unit.parameters)
                    .map_err(|err| task_failed(err, &unit.data_source, &unit.sql))
            },
            || false,
        )?;
        Ok(results.into_iter().next().unwrap_or(false))
    }
}

/// Runs accumulated batches and folds per-unit counts back onto logical
/// add-batch positions.
pub struct BatchStatementExecutor {
    engine: Arc<ExecutorEngine>,
    policy: ExceptionPolicy,
}

impl BatchStatementExecutor {
    pub fn new(engine: Arc<ExecutorEngine>, policy: ExceptionPolicy) -> Self {
        BatchStatementExecutor { engine, policy }
    }

    /// Returns one update count per logical add-batch call. A logical
    /// position touched by several units sums their counts; suppressed
    /// failures contribute zero.
    pub fn execute_batch(&self, units: Vec<BatchUnit>, total_batches: usize) -> Result<Vec<u64>> {
        let per_unit = self.engine.execute_group(
            units,
            self.policy,
            |mut unit| {
                for parameters in &unit.parameter_sets {
                    unit.statement
                        .add_batch(parameters)
                        .map_err(|err| task_failed(err, &unit.data_source, &unit.sql))?;
                }
                let counts = unit
                    .statement
                    .execute_batch()
                    .map_err(|err| task_failed(err, &unit.data_source, &unit.sql))?;
                Ok((unit.batch_indexes, counts))
            },
            || (Vec::new(), Vec::new()),
        )?;

        let mut logical = vec![0u64; total_batches];
        for (indexes, counts) in per_unit {
            for (local, count) in counts.into_iter().enumerate() {
                if let Some(&position) = indexes.get(local) {
                    if let Some(slot) = logical.get_mut(position) {
                        *slot += count;
                    }
                }
            }
        }
        Ok(logical)
    }
}
