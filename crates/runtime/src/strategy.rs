//! Sharding strategies and their registry.
//!
//! A strategy maps sharding values onto a subset of the available targets
//! (datasource names or physical table names). Algorithms are looked up by
//! name at rule-build time; there is no reflective loading.

use quilt_common::Value;
use quilt_error::{ErrorCode, ErrorContext, QuiltError, Result};
use quilt_sql::ShardingOperator;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Resolved values for one sharding column of one statement.
#[derive(Debug, Clone)]
pub struct ShardingValue {
    pub column: String,
    pub operator: ShardingOperator,
    pub values: Vec<Value>,
}

/// Picks targets out of `available` for the given values.
///
/// Returning a name not present in `available` is a routing error surfaced
/// by the caller; returning an empty vector routes nothing.
pub trait ShardingStrategy: Send + Sync {
    fn shard(&self, available: &[String], values: &[ShardingValue]) -> Vec<String>;
}

impl std::fmt::Debug for dyn ShardingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ShardingStrategy")
    }
}

/// A strategy bound to the columns it shards on, as configured per rule.
#[derive(Clone)]
pub struct BoundStrategy {
    pub columns: Vec<String>,
    pub algorithm: Arc<dyn ShardingStrategy>,
}

impl std::fmt::Debug for BoundStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundStrategy")
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

/// `target = available[value % available.len()]` over integer values.
/// BETWEEN expands to every integer in the range (capped at the target
/// count, past which it degenerates to a broadcast anyway).
pub struct ModuloStrategy;

impl ShardingStrategy for ModuloStrategy {
    fn shard(&self, available: &[String], values: &[ShardingValue]) -> Vec<String> {
        if available.is_empty() {
            return Vec::new();
        }
        let len = available.len() as i64;
        let mut picked: Vec<String> = Vec::new();
        let mut push = |index: i64| {
            let target = &available[index.rem_euclid(len) as usize];
            if !picked.contains(target) {
                picked.push(target.clone());
            }
        };
        for value in values {
            match value.operator {
                ShardingOperator::Between => {
                    let (low, high) = match (
                        value.values.first().and_then(Value::as_i64),
                        value.values.get(1).and_then(Value::as_i64),
                    ) {
                        (Some(low), Some(high)) if low <= high => (low, high),
                        _ => return available.to_vec(),
                    };
                    if high - low >= len {
                        return available.to_vec();
                    }
                    for v in low..=high {
                        push(v);
                    }
                }
                _ => {
                    for v in &value.values {
                        match v.as_i64() {
                            Some(v) => push(v),
                            // Non-integer sharding value: fall open.
                            None => return available.to_vec(),
                        }
                    }
                }
            }
        }
        if picked.is_empty() {
            available.to_vec()
        } else {
            picked
        }
    }
}

/// Broadcast: every statement hits every target.
pub struct NoneStrategy;

impl ShardingStrategy for NoneStrategy {
    fn shard(&self, available: &[String], _values: &[ShardingValue]) -> Vec<String> {
        available.to_vec()
    }
}

/// Name-keyed strategy registry. `with_defaults` seeds the built-ins;
/// callers register custom algorithms before building rules.
pub struct StrategyRegistry {
    algorithms: BTreeMap<String, Arc<dyn ShardingStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        StrategyRegistry {
            algorithms: BTreeMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("modulo", Arc::new(ModuloStrategy));
        registry.register("none", Arc::new(NoneStrategy));
        registry
    }

    pub fn register(&mut self, name: &str, algorithm: Arc<dyn ShardingStrategy>) {
        self.algorithms.insert(name.to_string(), algorithm);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ShardingStrategy>> {
        self.algorithms.get(name).cloned().ok_or_else(|| {
            QuiltError::new(
                ErrorCode::UnknownStrategy,
                format!("No sharding algorithm registered under '{}'", name),
            )
            .with_context(ErrorContext::generic([(
                "known_algorithms",
                self.algorithms
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", "),
            )]))
            .with_hint("Register the algorithm before building the sharding rule")
        })
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("t_order_{}", i)).collect()
    }

    fn value(operator: ShardingOperator, values: Vec<i64>) -> ShardingValue {
        ShardingValue {
            column: "order_id".to_string(),
            operator,
            values: values.into_iter().map(Value::Int).collect(),
        }
    }

    #[test]
    fn test_modulo_equal() {
        let picked = ModuloStrategy.shard(&targets(2), &[value(ShardingOperator::Equal, vec![5])]);
        assert_eq!(picked, vec!["t_order_1"]);
    }

    #[test]
    fn test_modulo_in_dedups() {
        let picked =
            ModuloStrategy.shard(&targets(2), &[value(ShardingOperator::In, vec![1, 3, 5])]);
        assert_eq!(picked, vec!["t_order_1"]);
    }

    #[test]
    fn test_modulo_between_expands() {
        let picked =
            ModuloStrategy.shard(&targets(4), &[value(ShardingOperator::Between, vec![1, 2])]);
        assert_eq!(picked, vec!["t_order_1", "t_order_2"]);
    }

    #[test]
    fn test_modulo_wide_between_broadcasts() {
        let picked =
            ModuloStrategy.shard(&targets(2), &[value(ShardingOperator::Between, vec![0, 99])]);
        assert_eq!(picked, targets(2));
    }

    #[test]
    fn test_modulo_negative_value() {
        let picked = ModuloStrategy.shard(&targets(2), &[value(ShardingOperator::Equal, vec![-3])]);
        assert_eq!(picked, vec!["t_order_1"]);
    }

    #[test]
    fn test_no_values_broadcasts() {
        let picked = ModuloStrategy.shard(&targets(3), &[]);
        assert_eq!(picked, targets(3));
    }

    #[test]
    fn test_registry_unknown_name() {
        let registry = StrategyRegistry::with_defaults();
        assert!(registry.get("modulo").is_ok());
        let err = registry.get("consistent_hash").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownStrategy);
    }
}
