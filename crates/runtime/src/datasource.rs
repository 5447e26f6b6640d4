//! The top-level facade: a sharding-aware datasource.

use crate::connection::ShardingConnection;
use crate::context::ShardingContext;
use crate::executor::ExecutorEngine;
use crate::rule::ShardingRule;
use parking_lot::RwLock;
use quilt_common::ShardingSettings;
use std::sync::Arc;
use tracing::info;

/// Entry point: hand it a rule and settings, get connections that route,
/// fan out and merge transparently.
pub struct ShardingDataSource {
    context: RwLock<Arc<ShardingContext>>,
}

impl ShardingDataSource {
    pub fn new(rule: ShardingRule, settings: &ShardingSettings) -> Self {
        let executor = Arc::new(ExecutorEngine::new(settings.effective_executor_size()));
        info!(
            data_sources = rule.data_sources.len(),
            table_rules = rule.table_rules.len(),
            executor_size = executor.size(),
            "sharding datasource ready"
        );
        ShardingDataSource {
            context: RwLock::new(Arc::new(ShardingContext {
                rule,
                executor,
                sql_show: settings.sql_show,
            })),
        }
    }

    /// Swaps in a new rule at runtime. The worker pool survives the swap
    /// when its size is unchanged; otherwise the old pool is drained and a
    /// new one spun up. Connections already handed out keep their snapshot.
    pub fn renew(&self, rule: ShardingRule, settings: &ShardingSettings) {
        let mut guard = self.context.write();
        let executor = if guard.executor.size() == settings.effective_executor_size() {
            guard.executor.clone()
        } else {
            guard.executor.close();
            Arc::new(ExecutorEngine::new(settings.effective_executor_size()))
        };
        info!(
            table_rules = rule.table_rules.len(),
            executor_size = executor.size(),
            "sharding rule renewed"
        );
        *guard = Arc::new(ShardingContext {
            rule,
            executor,
            sql_show: settings.sql_show,
        });
    }

    /// Opens a connection pinned to the current snapshot.
    pub fn connection(&self) -> ShardingConnection {
        ShardingConnection::new(self.context.read().clone())
    }

    /// The current snapshot. Exposed for observability and tests.
    pub fn context(&self) -> Arc<ShardingContext> {
        self.context.read().clone()
    }

    /// Drains the worker pool. Subsequent multi-unit executions fail with
    /// an engine-closed error.
    pub fn close(&self) {
        self.context.read().executor.close();
    }
}
