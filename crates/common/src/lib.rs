//! Shared types for the Quilt sharding middleware.
//!
//! Carries the pieces every engine depends on: the rule/settings configuration
//! surface, the SQL value model, inline data-node expression expansion and
//! telemetry bootstrap.

pub mod config;
pub mod inline;
pub mod telemetry;
pub mod value;

pub use config::{ShardingRuleConfig, ShardingSettings, StrategyConfig, TableRuleConfig};
pub use value::Value;
