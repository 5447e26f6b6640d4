//! The logical prepared statement: route, fan out, merge.

use crate::connection::ShardingConnection;
use crate::executor::{
    BatchStatementExecutor, BatchUnit, ExceptionPolicy, PreparedUnit, StatementExecutor,
};
use crate::merger::{merge, MergedRows};
use crate::routing::{route, RouteResult};
use quilt_common::Value;
use quilt_error::Result;
use quilt_sql::SqlStatement;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One logical statement against a sharding connection. Each execution
/// re-routes with the parameters bound for that call.
pub struct ShardingStatement<'a> {
    connection: &'a ShardingConnection,
    statement: Arc<SqlStatement>,
    policy: ExceptionPolicy,
    generated_keys: Vec<Value>,
    batch: BatchAccumulator,
}

#[derive(Default)]
struct BatchAccumulator {
    /// Logical add-batch calls so far.
    count: usize,
    /// Parameter sets per routed (datasource, sql) unit.
    units: BTreeMap<(String, String), BatchSets>,
}

#[derive(Default)]
struct BatchSets {
    parameter_sets: Vec<Vec<Value>>,
    batch_indexes: Vec<usize>,
}

impl<'a> ShardingStatement<'a> {
    pub(crate) fn new(connection: &'a ShardingConnection, statement: Arc<SqlStatement>) -> Self {
        ShardingStatement {
            connection,
            statement,
            policy: ExceptionPolicy::default(),
            generated_keys: Vec::new(),
            batch: BatchAccumulator::default(),
        }
    }

    /// Chooses what a failed shard does to the whole statement.
    pub fn set_exception_policy(&mut self, policy: ExceptionPolicy) {
        self.policy = policy;
    }

    /// Keys generated for the most recent INSERT execution, in row order.
    pub fn generated_keys(&self) -> &[Value] {
        &self.generated_keys
    }

    fn route_and_prepare(
        &mut self,
        parameters: &[Value],
    ) -> Result<(RouteResult, Vec<PreparedUnit>)> {
        let context = self.connection.context();
        let routed = route(&context.rule, &self.statement, parameters)?;
        self.generated_keys = routed.generated_keys.clone();

        let mut units = Vec::with_capacity(routed.units.len());
        for unit in &routed.units {
            units.push(PreparedUnit {
                statement: self.connection.prepare_backend(
                    &unit.data_source,
                    self.statement.sql_type,
                    &unit.sql,
                )?,
                data_source: unit.data_source.clone(),
                sql: unit.sql.clone(),
                parameters: parameters.to_vec(),
            });
        }
        Ok((routed, units))
    }

    fn executor(&self) -> StatementExecutor {
        let context = self.connection.context();
        StatementExecutor::new(context.executor.clone(), self.policy, context.sql_show)
    }

    /// Routes, executes and merges a query.
    pub fn execute_query(&mut self, parameters: &[Value]) -> Result<Box<dyn MergedRows>> {
        let (_, units) = self.route_and_prepare(parameters)?;
        let shards = self.executor().execute_query(units)?;
        merge(self.statement.select.as_ref(), shards)
    }

    /// Routes and executes a write; returns the summed affected-row count.
    pub fn execute_update(&mut self, parameters: &[Value]) -> Result<u64> {
        let (_, units) = self.route_and_prepare(parameters)?;
        self.executor().execute_update(units)
    }

    /// Generic execute; `true` when the statement produced a result set.
    pub fn execute(&mut self, parameters: &[Value]) -> Result<bool> {
        let (_, units) = self.route_and_prepare(parameters)?;
        self.executor().execute(units)
    }

    /// Queues one parameter set. Routing happens now, so each physical unit
    /// accumulates exactly the sets destined for it.
    pub fn add_batch(&mut self, parameters: &[Value]) -> Result<()> {
        let context = self.connection.context();
        let routed = route(&context.rule, &self.statement, parameters)?;
        self.generated_keys.extend(routed.generated_keys);
        let logical = self.batch.count;
        for unit in routed.units {
            let sets = self
                .batch
                .units
                .entry((unit.data_source, unit.sql))
                .or_default();
            sets.parameter_sets.push(parameters.to_vec());
            sets.batch_indexes.push(logical);
        }
        self.batch.count += 1;
        Ok(())
    }

    /// Discards accumulated parameter sets without executing them.
    pub fn clear_batch(&mut self) {
        self.batch = BatchAccumulator::default();
    }

    /// Runs every accumulated batch; one count per add-batch call.
    pub fn execute_batch(&mut self) -> Result<Vec<u64>> {
        let accumulated = std::mem::take(&mut self.batch);
        let mut units = Vec::with_capacity(accumulated.units.len());
        for ((data_source, sql), sets) in accumulated.units {
            units.push(BatchUnit {
                statement: self.connection.prepare_backend(
                    &data_source,
                    self.statement.sql_type,
                    &sql,
                )?,
                data_source,
                sql,
                parameter_sets: sets.parameter_sets,
                batch_indexes: sets.batch_indexes,
            });
        }
        let context = self.connection.context();
        let executor = BatchStatementExecutor::new(context.executor.clone(), self.policy);
        executor.execute_batch(units, accumulated.count)
    }
}
