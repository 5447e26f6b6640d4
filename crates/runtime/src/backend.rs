//! Backend abstraction: the physical datasources Quilt routes to.
//!
//! Quilt never speaks a wire protocol itself; callers register anything that
//! can prepare and execute SQL. Statements and result cursors are owned
//! boxes so they can cross into the executor's worker threads.

use quilt_common::Value;
use quilt_error::Result;
use quilt_sql::SqlType;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Forward-only result cursor over one physical statement.
pub trait Rows: Send {
    /// Advances to the next row; `false` once exhausted.
    fn next(&mut self) -> Result<bool>;
    /// Reads column `index` (0-based) of the current row.
    fn get(&self, index: usize) -> Result<Value>;
    fn width(&self) -> usize;
}

impl std::fmt::Debug for dyn Rows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Rows")
    }
}

/// One prepared physical statement.
pub trait BackendStatement: Send {
    fn execute_query(&mut self, parameters: &[Value]) -> Result<Box<dyn Rows>>;
    fn execute_update(&mut self, parameters: &[Value]) -> Result<u64>;
    /// Generic execute; `true` when the result is a row set.
    fn execute(&mut self, parameters: &[Value]) -> Result<bool>;
    fn add_batch(&mut self, parameters: &[Value]) -> Result<()>;
    /// One update count per batched parameter set, in batch order.
    fn execute_batch(&mut self) -> Result<Vec<u64>>;
}

/// One open connection to a physical datasource.
pub trait BackendConnection: Send {
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn BackendStatement>>;
}

/// A named physical datasource.
pub trait Datasource: Send + Sync {
    fn name(&self) -> &str;
    fn connection(&self) -> Result<Box<dyn BackendConnection>>;

    /// Statement-type-aware connection handout; read/write splitting hooks
    /// in here. The default ignores the statement type.
    fn connection_for(&self, sql_type: SqlType) -> Result<Box<dyn BackendConnection>> {
        let _ = sql_type;
        self.connection()
    }
}

impl std::fmt::Debug for dyn Datasource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Datasource")
    }
}

/// Master/slave group exposed as a single logical datasource: writes (and
/// anything non-DQL) go to the master, queries round-robin over the slaves.
pub struct MasterSlaveDatasource {
    name: String,
    master: Arc<dyn Datasource>,
    slaves: Vec<Arc<dyn Datasource>>,
    cursor: AtomicUsize,
}

impl MasterSlaveDatasource {
    pub fn new(name: &str, master: Arc<dyn Datasource>, slaves: Vec<Arc<dyn Datasource>>) -> Self {
        MasterSlaveDatasource {
            name: name.to_string(),
            master,
            slaves,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Datasource for MasterSlaveDatasource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connection(&self) -> Result<Box<dyn BackendConnection>> {
        self.master.connection()
    }

    fn connection_for(&self, sql_type: SqlType) -> Result<Box<dyn BackendConnection>> {
        if sql_type.is_query() && !self.slaves.is_empty() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slaves.len();
            self.slaves[index].connection()
        } else {
            self.master.connection()
        }
    }
}
