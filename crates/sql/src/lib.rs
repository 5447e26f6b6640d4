//! Statement analysis boundary between the SQL parser and the routing engine.
//!
//! The router never touches a raw AST. [`parse`] reduces a statement to the
//! facts routing and merging need:
//!
//! - classification (DQL / DML / DDL / DAL)
//! - the logical tables it references
//! - sharding conditions (`=`, `IN`, `BETWEEN` conjuncts, with placeholder
//!   ordinals so bound values can be resolved at route time)
//! - the SELECT merge context (aggregations, GROUP BY, ORDER BY, LIMIT)
//! - INSERT shape for generated-key handling
//!
//! [`rewrite`] then produces per-shard SQL from the same token stream,
//! substituting physical table names, appending AVG's derived COUNT/SUM
//! columns and generated-key literals without disturbing `?` positions.

mod analyze;
mod rewrite;
mod statement;

pub use analyze::parse;
pub use rewrite::{rewrite, GeneratedKey, RewriteInput};
pub use statement::{
    AggregationItem, AggregationKind, Condition, ConditionValue, GroupByItem, InsertContext,
    Limit, OrderItem, SelectContext, ShardingOperator, SqlStatement, SqlType,
};

/// Column alias prefix for AVG's derived COUNT column.
pub const AVG_DERIVED_COUNT_ALIAS: &str = "AVG_DERIVED_COUNT_";
/// Column alias prefix for AVG's derived SUM column.
pub const AVG_DERIVED_SUM_ALIAS: &str = "AVG_DERIVED_SUM_";
