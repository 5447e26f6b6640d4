//! Builds an immutable [`ShardingRule`] from declarative configuration.

use crate::backend::{Datasource, MasterSlaveDatasource};
use crate::keygen::KeyGeneratorRegistry;
use crate::rule::{DataNode, ShardingRule, TableRule};
use crate::strategy::{BoundStrategy, StrategyRegistry};
use quilt_common::config::{ShardingRuleConfig, StrategyConfig, TableRuleConfig};
use quilt_common::inline;
use quilt_error::{ErrorCode, ErrorContext, QuiltError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_KEY_GENERATOR: &str = "snowflake";

/// Assembles the rule: folds master/slave groups into single datasources,
/// expands inline data-node expressions and resolves strategy and generator
/// names against the registries.
///
/// The datasource map is consumed; master/slave members are replaced by
/// their group entry.
pub fn build_sharding_rule(
    config: &ShardingRuleConfig,
    mut data_sources: BTreeMap<String, Arc<dyn Datasource>>,
    strategies: &StrategyRegistry,
    key_generators: &KeyGeneratorRegistry,
) -> Result<ShardingRule> {
    if data_sources.is_empty() {
        return Err(QuiltError::new(
            ErrorCode::EmptyDataSources,
            "At least one datasource is required",
        ));
    }

    for group in &config.master_slave {
        let master = take_data_source(&mut data_sources, &group.master)?;
        let mut slaves = Vec::with_capacity(group.slaves.len());
        for slave in &group.slaves {
            slaves.push(take_data_source(&mut data_sources, slave)?);
        }
        data_sources.insert(
            group.name.clone(),
            Arc::new(MasterSlaveDatasource::new(&group.name, master, slaves)),
        );
    }

    if let Some(name) = &config.default_data_source {
        if !data_sources.contains_key(name) {
            return Err(unknown_data_source(name, &data_sources));
        }
    }

    let default_database_strategy = config
        .default_database_strategy
        .as_ref()
        .map(|s| bind_strategy(s, strategies))
        .transpose()?;
    let default_table_strategy = config
        .default_table_strategy
        .as_ref()
        .map(|s| bind_strategy(s, strategies))
        .transpose()?;
    let default_key_generator = key_generators.get(
        config
            .default_key_generator
            .as_deref()
            .unwrap_or(DEFAULT_KEY_GENERATOR),
    )?;

    let mut table_rules = Vec::with_capacity(config.tables.len());
    for table in &config.tables {
        table_rules.push(build_table_rule(
            table,
            &data_sources,
            strategies,
            key_generators,
        )?);
    }

    Ok(ShardingRule {
        data_sources,
        default_data_source_name: config.default_data_source.clone(),
        table_rules,
        binding_groups: config.binding_tables.clone(),
        default_database_strategy,
        default_table_strategy,
        default_key_generator,
    })
}

fn build_table_rule(
    config: &TableRuleConfig,
    data_sources: &BTreeMap<String, Arc<dyn Datasource>>,
    strategies: &StrategyRegistry,
    key_generators: &KeyGeneratorRegistry,
) -> Result<TableRule> {
    let mut data_nodes = Vec::new();
    if config.actual_data_nodes.is_empty() {
        // One node per datasource, physical name = logical name.
        for name in data_sources.keys() {
            data_nodes.push(DataNode {
                data_source: name.clone(),
                table: config.logic_table.clone(),
            });
        }
    } else {
        for expression in &config.actual_data_nodes {
            for expanded in inline::expand(expression)? {
                let node = DataNode::parse(&expanded)?;
                if !data_sources.contains_key(&node.data_source) {
                    return Err(QuiltError::new(
                        ErrorCode::InvalidDataNode,
                        format!(
                            "Data node '{}' names unknown datasource '{}'",
                            expanded, node.data_source
                        ),
                    )
                    .with_context(ErrorContext::DataNode {
                        expression: expression.clone(),
                        datasource: Some(node.data_source.clone()),
                    }));
                }
                data_nodes.push(node);
            }
        }
    }

    let database_strategy = config
        .database_strategy
        .as_ref()
        .map(|s| bind_strategy(s, strategies))
        .transpose()?;
    let table_strategy = config
        .table_strategy
        .as_ref()
        .map(|s| bind_strategy(s, strategies))
        .transpose()?;
    let key_generator = config
        .key_generator
        .as_deref()
        .map(|name| key_generators.get(name))
        .transpose()?;

    Ok(TableRule {
        logic_table: config.logic_table.clone(),
        data_nodes,
        database_strategy,
        table_strategy,
        generate_key_column: config.generate_key_column.clone(),
        key_generator,
        logic_index: config.logic_index.clone(),
    })
}

fn bind_strategy(config: &StrategyConfig, strategies: &StrategyRegistry) -> Result<BoundStrategy> {
    Ok(BoundStrategy {
        columns: config.sharding_columns.clone(),
        algorithm: strategies.get(&config.algorithm)?,
    })
}

fn take_data_source(
    data_sources: &mut BTreeMap<String, Arc<dyn Datasource>>,
    name: &str,
) -> Result<Arc<dyn Datasource>> {
    data_sources
        .remove(name)
        .ok_or_else(|| unknown_data_source(name, data_sources))
}

fn unknown_data_source(
    name: &str,
    data_sources: &BTreeMap<String, Arc<dyn Datasource>>,
) -> QuiltError {
    QuiltError::new(
        ErrorCode::UnknownDataSource,
        format!("No datasource named '{}'", name),
    )
    .with_context(ErrorContext::generic([(
        "known_data_sources",
        data_sources.keys().cloned().collect::<Vec<_>>().join(", "),
    )]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MemoryDatasource;
    use quilt_common::config::MasterSlaveConfig;

    fn sources(names: &[&str]) -> BTreeMap<String, Arc<dyn Datasource>> {
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

    fn order_table() -> TableRuleConfig {
        let toml = r#"
            logic_table = "t_order"
            actual_data_nodes = ["ds_${0..1}.t_order_${0..1}"]

            [table_strategy]
            algorithm = "modulo"
            sharding_columns = ["order_id"]
        "#;
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn test_builds_rule_with_expanded_nodes() {
        let config = ShardingRuleConfig {
            default_data_source: Some("ds_0".to_string()),
            tables: vec![order_table()],
            ..Default::default()
        };
        let rule = build_sharding_rule(
            &config,
            sources(&["ds_0", "ds_1"]),
            &StrategyRegistry::with_defaults(),
            &KeyGeneratorRegistry::with_defaults(),
        )
        .unwrap();

        let table = rule.table_rule("t_order").unwrap();
        assert_eq!(table.data_nodes.len(), 4);
        assert_eq!(table.actual_data_source_names(), vec!["ds_0", "ds_1"]);
        assert_eq!(
            table.actual_table_names("ds_1"),
            vec!["t_order_0", "t_order_1"]
        );
    }

    #[test]
    fn test_empty_nodes_default_to_all_datasources() {
        let config = ShardingRuleConfig {
            tables: vec![TableRuleConfig {
                logic_table: "t_config".to_string(),
                actual_data_nodes: Vec::new(),
                database_strategy: None,
                table_strategy: None,
                generate_key_column: None,
                key_generator: None,
                logic_index: None,
            }],
            ..Default::default()
        };
        let rule = build_sharding_rule(
            &config,
            sources(&["ds_0", "ds_1"]),
            &StrategyRegistry::with_defaults(),
            &KeyGeneratorRegistry::with_defaults(),
        )
        .unwrap();
        let table = rule.table_rule("t_config").unwrap();
        assert_eq!(table.data_nodes.len(), 2);
        assert_eq!(table.actual_table_names("ds_0"), vec!["t_config"]);
    }

    #[test]
    fn test_rejects_empty_datasources() {
        let err = build_sharding_rule(
            &ShardingRuleConfig::default(),
            BTreeMap::new(),
            &StrategyRegistry::with_defaults(),
            &KeyGeneratorRegistry::with_defaults(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::EmptyDataSources);
    }

    #[test]
    fn test_rejects_node_with_unknown_datasource() {
        let mut table = order_table();
        table.actual_data_nodes = vec!["ds_9.t_order_0".to_string()];
        let config = ShardingRuleConfig {
            tables: vec![table],
            ..Default::default()
        };
        let err = build_sharding_rule(
            &config,
            sources(&["ds_0"]),
            &StrategyRegistry::with_defaults(),
            &KeyGeneratorRegistry::with_defaults(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDataNode);
    }

    #[test]
    fn test_master_slave_folds_members() {
        let config = ShardingRuleConfig {
            master_slave: vec![MasterSlaveConfig {
                name: "ds_ms".to_string(),
                master: "ds_master".to_string(),
                slaves: vec!["ds_slave_0".to_string(), "ds_slave_1".to_string()],
            }],
            default_data_source: Some("ds_ms".to_string()),
            ..Default::default()
        };
        let rule = build_sharding_rule(
            &config,
            sources(&["ds_master", "ds_slave_0", "ds_slave_1"]),
            &StrategyRegistry::with_defaults(),
            &KeyGeneratorRegistry::with_defaults(),
        )
        .unwrap();
        assert_eq!(rule.data_sources.len(), 1);
        assert!(rule.data_sources.contains_key("ds_ms"));
    }

    #[test]
    fn test_unknown_strategy_name() {
        let mut table = order_table();
        table.table_strategy.as_mut().unwrap().algorithm = "missing".to_string();
        let config = ShardingRuleConfig {
            tables: vec![table],
            ..Default::default()
        };
        let err = build_sharding_rule(
            &config,
            sources(&["ds_0", "ds_1"]),
            &StrategyRegistry::with_defaults(),
            &KeyGeneratorRegistry::with_defaults(),
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownStrategy);
    }
}
