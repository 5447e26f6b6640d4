//! The immutable runtime snapshot behind one datasource generation.

use crate::executor::ExecutorEngine;
use crate::rule::ShardingRule;
use std::sync::Arc;

/// Everything a connection needs, pinned for its lifetime. Renewing the
/// datasource swaps the whole snapshot; connections opened earlier keep the
/// one they started with.
pub struct ShardingContext {
    pub rule: ShardingRule,
    pub executor: Arc<ExecutorEngine>,
    pub sql_show: bool,
}
