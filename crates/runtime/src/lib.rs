//! Quilt's runtime: the rule model, routing, fan-out execution and result
//! merging behind a datasource facade.
//!
//! The flow for one statement:
//!
//! 1. [`ShardingConnection::prepare`] parses (and caches) the SQL.
//! 2. Execution routes it against the [`rule::ShardingRule`] into per-shard
//!    units with rewritten SQL.
//! 3. The [`executor::ExecutorEngine`] fans the units out over its worker
//!    pool and collects results in unit order.
//! 4. Queries flow through the [`merger`], which folds shard result sets
//!    into one logical result.

pub mod backend;
pub mod connection;
pub mod context;
pub mod datasource;
pub mod executor;
pub mod keygen;
pub mod merger;
pub mod routing;
pub mod rule;
pub mod statement;
pub mod strategy;
pub mod test_support;

pub use backend::{BackendConnection, BackendStatement, Datasource, MasterSlaveDatasource, Rows};
pub use connection::ShardingConnection;
pub use context::ShardingContext;
pub use datasource::ShardingDataSource;
pub use executor::{ExceptionPolicy, ExecutorEngine};
pub use keygen::{KeyGenerator, KeyGeneratorRegistry, SnowflakeKeyGenerator};
pub use merger::MergedRows;
pub use routing::{route, ExecutionUnit, RouteResult};
pub use rule::{build_sharding_rule, DataNode, ShardingRule, TableRule};
pub use statement::ShardingStatement;
pub use strategy::{ShardingStrategy, ShardingValue, StrategyRegistry};
