//! A logical connection: lazily opened backend connections plus a parse
//! cache, pinned to one rule snapshot.

use crate::backend::BackendStatement;
use crate::context::ShardingContext;
use crate::statement::ShardingStatement;
use parking_lot::Mutex;
use quilt_error::Result;
use quilt_sql::{SqlStatement, SqlType};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct ShardingConnection {
    context: Arc<ShardingContext>,
    /// Backend connections by datasource and read/write role.
    connections: Mutex<BTreeMap<(String, bool), Box<dyn crate::backend::BackendConnection>>>,
    /// Parsed statements by SQL text.
    parsed: Mutex<HashMap<String, Arc<SqlStatement>>>,
}

impl ShardingConnection {
    pub(crate) fn new(context: Arc<ShardingContext>) -> Self {
        ShardingConnection {
            context,
            connections: Mutex::new(BTreeMap::new()),
            parsed: Mutex::new(HashMap::new()),
        }
    }

    /// Prepares one logical statement. Parsing is cached per SQL text;
    /// routing happens on every execution with the bound parameters.
    pub fn prepare(&self, sql: &str) -> Result<ShardingStatement<'_>> {
        let parsed = {
            let cache = self.parsed.lock();
            cache.get(sql).cloned()
        };
        let parsed = match parsed {
            Some(parsed) => parsed,
            None => {
                let parsed = Arc::new(quilt_sql::parse(sql)?);
                self.parsed
                    .lock()
                    .insert(sql.to_string(), parsed.clone());
                parsed
            }
        };
        Ok(ShardingStatement::new(self, parsed))
    }

    pub fn context(&self) -> &Arc<ShardingContext> {
        &self.context
    }

    /// Prepares a physical statement on the given datasource. Connections
    /// are pooled per datasource and role, except for DDL, which always
    /// runs on a fresh connection.
    pub(crate) fn prepare_backend(
        &self,
        data_source: &str,
        sql_type: SqlType,
        sql: &str,
    ) -> Result<Box<dyn BackendStatement>> {
        let datasource = self.context.rule.data_source(data_source)?;
        if sql_type == SqlType::Ddl {
            return datasource.connection_for(sql_type)?.prepare(sql);
        }
        let key = (data_source.to_string(), sql_type.is_query());
        let mut connections = self.connections.lock();
        if !connections.contains_key(&key) {
            connections.insert(key.clone(), datasource.connection_for(sql_type)?);
        }
        match connections.get_mut(&key) {
            Some(connection) => connection.prepare(sql),
            None => datasource.connection_for(sql_type)?.prepare(sql),
        }
    }
}
