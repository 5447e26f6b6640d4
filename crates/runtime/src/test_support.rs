//! In-memory backend for tests: scripted result sets, injectable failures
//! and a log of every executed statement.

use crate::backend::{BackendConnection, BackendStatement, Datasource, Rows};
use quilt_common::config::{ShardingRuleConfig, StrategyConfig, TableRuleConfig};
use quilt_common::Value;
use quilt_error::{ErrorCode, QuiltError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MemoryState {
    queries: Mutex<HashMap<String, Vec<Vec<Value>>>>,
    updates: Mutex<HashMap<String, u64>>,
    failures: Mutex<HashSet<String>>,
    executed: Mutex<Vec<String>>,
}

impl MemoryState {
    fn record(&self, sql: &str) -> Result<()> {
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(sql.to_string());
        }
        let failing = self
            .failures
            .lock()
            .map(|failures| failures.contains(sql))
            .unwrap_or(false);
        if failing {
            return Err(QuiltError::new(
                ErrorCode::ConnectionFailed,
                format!("scripted failure for '{}'", sql),
            ));
        }
        Ok(())
    }
}

/// A scriptable datasource. Unscripted queries return empty result sets,
/// unscripted updates report one affected row.
pub struct MemoryDatasource {
    name: String,
    state: Arc<MemoryState>,
}

impl MemoryDatasource {
    pub fn new(name: &str) -> Self {
        MemoryDatasource {
            name: name.to_string(),
            state: Arc::new(MemoryState::default()),
        }
    }

    pub fn script_query(&self, sql: &str, rows: Vec<Vec<Value>>) {
        if let Ok(mut queries) = self.state.queries.lock() {
            queries.insert(sql.to_string(), rows);
        }
    }

    pub fn script_update(&self, sql: &str, count: u64) {
        if let Ok(mut updates) = self.state.updates.lock() {
            updates.insert(sql.to_string(), count);
        }
    }

    pub fn fail_on(&self, sql: &str) {
        if let Ok(mut failures) = self.state.failures.lock() {
            failures.insert(sql.to_string());
        }
    }

    /// Every statement executed against this datasource, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state
            .executed
            .lock()
            .map(|executed| executed.clone())
            .unwrap_or_default()
    }
}

impl Datasource for MemoryDatasource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection(&self) -> Result<Box<dyn BackendConnection>> {
        Ok(Box::new(MemoryConnection {
            state: self.state.clone(),
        }))
    }
}

struct MemoryConnection {
    state: Arc<MemoryState>,
}

impl BackendConnection for MemoryConnection {
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn BackendStatement>> {
        Ok(Box::new(MemoryStatement {
            state: self.state.clone(),
            sql: sql.to_string(),
            batched: Vec::new(),
        }))
    }
}

struct MemoryStatement {
    state: Arc<MemoryState>,
    sql: String,
    batched: Vec<Vec<Value>>,
}

impl BackendStatement for MemoryStatement {
    fn execute_query(&mut self, _parameters: &[Value]) -> Result<Box<dyn Rows>> {
        self.state.record(&self.sql)?;
        let rows = self
            .state
            .queries
            .lock()
            .ok()
            .and_then(|queries| queries.get(&self.sql).cloned())
            .unwrap_or_default();
        Ok(Box::new(MemoryRows { rows, cursor: None }))
    }

    fn execute_update(&mut self, _parameters: &[Value]) -> Result<u64> {
        self.state.record(&self.sql)?;
        Ok(self
            .state
            .updates
            .lock()
            .ok()
            .and_then(|updates| updates.get(&self.sql).copied())
            .unwrap_or(1))
    }

    fn execute(&mut self, _parameters: &[Value]) -> Result<bool> {
        self.state.record(&self.sql)?;
        let is_query = self
            .state
            .queries
            .lock()
            .map(|queries| queries.contains_key(&self.sql))
            .unwrap_or(false);
        Ok(is_query)
    }

    fn add_batch(&mut self, parameters: &[Value]) -> Result<()> {
        self.batched.push(parameters.to_vec());
        Ok(())
    }

    fn execute_batch(&mut self) -> Result<Vec<u64>> {
        self.state.record(&self.sql)?;
        let counts = vec![1; self.batched.len()];
        self.batched.clear();
        Ok(counts)
    }
}

struct MemoryRows {
    rows: Vec<Vec<Value>>,
    cursor: Option<usize>,
}

impl Rows for MemoryRows {
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
                QuiltError::new(ErrorCode::Internal, "No current row in scripted result")
            })
    }

    fn width(&self) -> usize {
        self.rows.first().map(Vec::len).unwrap_or(0)
    }
}

/// A standalone result cursor over literal rows.
pub fn rows_from(rows: Vec<Vec<Value>>) -> Box<dyn Rows> {
    Box::new(MemoryRows { rows, cursor: None })
}

/// Shorthand for integer-only rows.
pub fn rows_of(rows: &[&[i64]]) -> Box<dyn Rows> {
    rows_from(
        rows.iter()
            .map(|row| row.iter().copied().map(Value::Int).collect())
            .collect(),
    )
}

/// One fresh in-memory datasource per name.
pub fn memory_sources(names: &[&str]) -> BTreeMap<String, Arc<dyn Datasource>> {
    names
        .iter()
        .map(|name| {
            (
                name.to_string(),
                Arc::new(MemoryDatasource::new(name)) as Arc<dyn Datasource>,
            )
        })
        .collect()
}

/// The canonical two-by-two order topology used across the test suite:
/// `t_order` and `t_order_item` sharded over `ds_0`/`ds_1` by `user_id`
/// and over two tables each by `order_id`, bound together, with generated
/// `order_id` keys on `t_order`.
pub fn sharded_order_config() -> ShardingRuleConfig {
    let modulo = |column: &str| StrategyConfig {
        algorithm: "modulo".to_string(),
        sharding_columns: vec![column.to_string()],
    };
    let table = |logic_table: &str, generate_key: bool| TableRuleConfig {
        logic_table: logic_table.to_string(),
        actual_data_nodes: vec![format!("ds_${{0..1}}.{}_${{0..1}}", logic_table)],
        database_strategy: Some(modulo("user_id")),
        table_strategy: Some(modulo("order_id")),
        generate_key_column: generate_key.then(|| "order_id".to_string()),
        key_generator: None,
        logic_index: None,
    };
    ShardingRuleConfig {
        default_data_source: Some("ds_0".to_string()),
        tables: vec![table("t_order", true), table("t_order_item", false)],
        binding_tables: vec![vec!["t_order".to_string(), "t_order_item".to_string()]],
        ..Default::default()
    }
}
