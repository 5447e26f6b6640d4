//! Routing: from one logical statement to its physical execution units.
//!
//! A unit is one rewritten SQL text bound to one datasource. Units come out
//! in data-node configuration order, so results (and merge input) are
//! deterministic for a given rule.

use crate::rule::{ShardingRule, TableRule};
use crate::strategy::ShardingValue;
use quilt_common::Value;
use quilt_error::{ErrorCode, ErrorContext, QuiltError, Result};
use quilt_sql::{rewrite, GeneratedKey, RewriteInput, SqlStatement, SqlType};
use std::collections::BTreeMap;
use tracing::debug;

/// One physical statement to run against one datasource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionUnit {
    pub data_source: String,
    pub sql: String,
}

/// The routed form of one logical statement.
#[derive(Debug, Default)]
pub struct RouteResult {
    pub units: Vec<ExecutionUnit>,
    /// Column filled by key generation, when it happened.
    pub generated_key_column: Option<String>,
    /// One generated key per INSERT row, in row order.
    pub generated_keys: Vec<Value>,
}

/// Routes a parsed statement with its bound parameters.
pub fn route(
    rule: &ShardingRule,
    statement: &SqlStatement,
    parameters: &[Value],
) -> Result<RouteResult> {
    let primary = statement
        .tables
        .iter()
        .find_map(|table| rule.table_rule(table));

    let table_rule = match primary {
        Some(table_rule) => table_rule,
        None => {
            // No ruled table: the whole statement goes to the default
            // datasource untouched.
            let name = rule.default_data_source().map(|ds| ds.name().to_string());
            let name = match name {
                Ok(name) => name,
                Err(err) if statement.tables.is_empty() => return Err(err),
                Err(err) => {
                    return Err(err.with_context(ErrorContext::TableRule {
                        logic_table: statement.tables[0].clone(),
                        known_tables: rule
                            .table_rules
                            .iter()
                            .map(|r| r.logic_table.clone())
                            .collect(),
                    }))
                }
            };
            return Ok(RouteResult {
                units: vec![ExecutionUnit {
                    data_source: name,
                    sql: statement.sql.clone(),
                }],
                ..Default::default()
            });
        }
    };

    if statement.sql_type == SqlType::Ddl {
        return route_broadcast(rule, table_rule, statement);
    }
    route_standard(rule, table_rule, statement, parameters)
}

/// DDL hits every data node of the ruled table.
fn route_broadcast(
    rule: &ShardingRule,
    table_rule: &TableRule,
    statement: &SqlStatement,
) -> Result<RouteResult> {
    let mut units = Vec::with_capacity(table_rule.data_nodes.len());
    for node in &table_rule.data_nodes {
        rule.data_source(&node.data_source)?;
        let mut table_map = BTreeMap::new();
        table_map.insert(table_rule.logic_table.clone(), node.table.clone());
        if let Some(index) = &table_rule.logic_index {
            // Physical index names carry the physical table name as suffix.
            table_map.insert(index.clone(), format!("{}_{}", index, node.table));
        }
        units.push(ExecutionUnit {
            data_source: node.data_source.clone(),
            sql: rewrite(&RewriteInput {
                statement,
                table_map: &table_map,
                generated_key: None,
            })?,
        });
    }
    debug!(
        logic_table = %table_rule.logic_table,
        units = units.len(),
        "broadcast route"
    );
    Ok(RouteResult {
        units,
        ..Default::default()
    })
}

fn route_standard(
    rule: &ShardingRule,
    table_rule: &TableRule,
    statement: &SqlStatement,
    parameters: &[Value],
) -> Result<RouteResult> {
    let generated = generate_key(rule, table_rule, statement);

    let available_data_sources = table_rule.actual_data_source_names();
    let routed_data_sources = shard(
        rule.database_strategy(table_rule),
        &available_data_sources,
        table_rule,
        statement,
        parameters,
        generated.as_ref(),
    )?;
    validate_targets(
        &table_rule.logic_table,
        &routed_data_sources,
        &available_data_sources,
    )?;

    let mut routed_nodes: Vec<(String, String)> = Vec::new();
    for data_source in &routed_data_sources {
        let available_tables = table_rule.actual_table_names(data_source);
        let routed_tables = shard(
            rule.table_strategy(table_rule),
            &available_tables,
            table_rule,
            statement,
            parameters,
            generated.as_ref(),
        )?;
        validate_targets(&table_rule.logic_table, &routed_tables, &available_tables)?;
        for table in routed_tables {
            routed_nodes.push((data_source.clone(), table));
        }
    }

    // Emit in data-node order.
    let mut units = Vec::new();
    for node in &table_rule.data_nodes {
        if !routed_nodes
            .iter()
            .any(|(ds, table)| ds == &node.data_source && table == &node.table)
        {
            continue;
        }
        let mut table_map = BTreeMap::new();
        table_map.insert(table_rule.logic_table.clone(), node.table.clone());
        bind_peer_tables(rule, table_rule, statement, node, &mut table_map)?;
        units.push(ExecutionUnit {
            data_source: node.data_source.clone(),
            sql: rewrite(&RewriteInput {
                statement,
                table_map: &table_map,
                generated_key: generated.as_ref(),
            })?,
        });
    }

    // An INSERT row lives on exactly one data node. A broadcast here would
    // write the same rows to every routed node, so refuse it instead.
    if statement.insert.is_some() && units.len() > 1 {
        return Err(QuiltError::new(
            ErrorCode::AmbiguousInsertRoute,
            format!(
                "INSERT into '{}' resolved to {} data nodes instead of one",
                table_rule.logic_table,
                units.len()
            ),
        )
        .with_hint(
            "Supply a value for every sharding column and keep each INSERT's rows on one shard",
        ));
    }

    debug!(
        logic_table = %table_rule.logic_table,
        units = units.len(),
        "standard route"
    );

    Ok(RouteResult {
        units,
        generated_key_column: generated.as_ref().map(|key| key.column.clone()),
        generated_keys: generated.map(|key| key.values).unwrap_or_default(),
    })
}

/// Maps the statement's other ruled tables onto this node via binding
/// groups. Tables without rules pass through unrewritten; a second ruled
/// table outside the primary's binding group cannot be routed consistently.
fn bind_peer_tables(
    rule: &ShardingRule,
    table_rule: &TableRule,
    statement: &SqlStatement,
    node: &crate::rule::DataNode,
    table_map: &mut BTreeMap<String, String>,
) -> Result<()> {
    for peer in &statement.tables {
        if peer.eq_ignore_ascii_case(&table_rule.logic_table) {
            continue;
        }
        if rule.table_rule(peer).is_none() {
            continue;
        }
        if !rule.is_binding(&table_rule.logic_table, peer) {
            return Err(QuiltError::new(
                ErrorCode::UnsupportedStatement,
                format!(
                    "Cannot join sharded tables '{}' and '{}' outside a binding group",
                    table_rule.logic_table, peer
                ),
            )
            .with_hint("Declare the tables in rule.binding_tables if they shard identically"));
        }
        let actual = rule.binding_actual_table(
            &node.data_source,
            &table_rule.logic_table,
            &node.table,
            peer,
        )?;
        table_map.insert(peer.clone(), actual);
    }
    Ok(())
}

/// Applies one bound strategy, falling open to every target when there is no
/// strategy or no usable sharding value.
fn shard(
    strategy: Option<&crate::strategy::BoundStrategy>,
    available: &[String],
    table_rule: &TableRule,
    statement: &SqlStatement,
    parameters: &[Value],
    generated: Option<&GeneratedKey>,
) -> Result<Vec<String>> {
    let strategy = match strategy {
        Some(strategy) => strategy,
        None => return Ok(available.to_vec()),
    };
    let mut values = Vec::new();
    for column in &strategy.columns {
        for condition in statement.conditions_for(&table_rule.logic_table, column) {
            let mut resolved = Vec::with_capacity(condition.values.len());
            for value in &condition.values {
                resolved.push(value.resolve(parameters).ok_or_else(|| {
                    QuiltError::new(
                        ErrorCode::MissingParameter,
                        format!(
                            "Sharding column '{}' references an unbound parameter",
                            column
                        ),
                    )
                    .with_hint("Bind every `?` before executing")
                })?);
            }
            values.push(ShardingValue {
                column: column.clone(),
                operator: condition.operator,
                values: resolved,
            });
        }
        // A generated key on a sharding column routes the INSERT even
        // though it never appeared in the statement.
        if let Some(generated) = generated {
            if generated.column.eq_ignore_ascii_case(column) {
                values.push(ShardingValue {
                    column: column.clone(),
                    operator: quilt_sql::ShardingOperator::In,
                    values: generated.values.clone(),
                });
            }
        }
    }
    if values.is_empty() {
        return Ok(available.to_vec());
    }
    Ok(strategy.algorithm.shard(available, &values))
}

fn validate_targets(logic_table: &str, picked: &[String], available: &[String]) -> Result<()> {
    for target in picked {
        if !available.contains(target) {
            return Err(QuiltError::new(
                ErrorCode::InvalidRouteTarget,
                format!("Sharding algorithm produced unknown target '{}'", target),
            )
            .with_context(ErrorContext::RouteTarget {
                logic_table: logic_table.to_string(),
                target: target.clone(),
                available: available.to_vec(),
            }));
        }
    }
    Ok(())
}

/// Generates keys for an INSERT missing its configured key column. Requires
/// an explicit column list; positional inserts are assumed to carry the key.
fn generate_key(
    rule: &ShardingRule,
    table_rule: &TableRule,
    statement: &SqlStatement,
) -> Option<GeneratedKey> {
    let insert = statement.insert.as_ref()?;
    let column = table_rule.generate_key_column.as_deref()?;
    if insert.columns.is_empty() || insert.contains_column(column) {
        return None;
    }
    let generator = rule.key_generator(table_rule);
    let values = (0..insert.rows).map(|_| generator.next_key()).collect();
    Some(GeneratedKey {
        column: column.to_string(),
        values,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keygen::KeyGeneratorRegistry;
    use crate::rule::build_sharding_rule;
    use crate::strategy::StrategyRegistry;
    use crate::test_support::{memory_sources, sharded_order_config};
    use quilt_sql::parse;

    fn order_rule() -> ShardingRule {
        build_sharding_rule(
            &sharded_order_config(),
            memory_sources(&["ds_0", "ds_1"]),
            &StrategyRegistry::with_defaults(),
            &KeyGeneratorRegistry::with_defaults(),
        )
        .unwrap()
    }

    #[test]
    fn test_single_shard_select() {
        let rule = order_rule();
        let statement =
            parse("SELECT * FROM t_order WHERE user_id = 1 AND order_id = 2").unwrap();
        let result = route(&rule, &statement, &[]).unwrap();
        assert_eq!(
            result.units,
            vec![ExecutionUnit {
                data_source: "ds_1".to_string(),
                sql: "SELECT * FROM t_order_0 WHERE user_id = 1 AND order_id = 2".to_string(),
            }]
        );
    }

    #[test]
    fn test_placeholder_resolution() {
        let rule = order_rule();
        let statement = parse("SELECT * FROM t_order WHERE user_id = ?").unwrap();
        let result = route(&rule, &statement, &[Value::Int(0)]).unwrap();
        // user_id = 0 pins ds_0; no table condition broadcasts both tables.
        assert_eq!(result.units.len(), 2);
        assert!(result
            .units
            .iter()
            .all(|unit| unit.data_source == "ds_0"));
    }

    #[test]
    fn test_missing_parameter() {
        let rule = order_rule();
        let statement = parse("SELECT * FROM t_order WHERE user_id = ?").unwrap();
        let err = route(&rule, &statement, &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::MissingParameter);
    }

    #[test]
    fn test_no_conditions_broadcasts_all_nodes() {
        let rule = order_rule();
        let statement = parse("SELECT * FROM t_order").unwrap();
        let result = route(&rule, &statement, &[]).unwrap();
        assert_eq!(result.units.len(), 4);
        // Data-node configuration order.
        assert_eq!(result.units[0].data_source, "ds_0");
        assert!(result.units[0].sql.contains("t_order_0"));
        assert_eq!(result.units[3].data_source, "ds_1");
        assert!(result.units[3].sql.contains("t_order_1"));
    }

    #[test]
    fn test_ruleless_table_uses_default() {
        let rule = order_rule();
        let statement = parse("SELECT * FROM t_config").unwrap();
        let result = route(&rule, &statement, &[]).unwrap();
        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].data_source, "ds_0");
        assert_eq!(result.units[0].sql, "SELECT * FROM t_config");
    }

    #[test]
    fn test_ddl_broadcasts_every_node() {
        let rule = order_rule();
        let statement = parse("CREATE TABLE t_order (order_id INT)").unwrap();
        let result = route(&rule, &statement, &[]).unwrap();
        assert_eq!(result.units.len(), 4);
        assert!(result.units[1].sql.contains("t_order_1"));
    }

    #[test]
    fn test_binding_tables_route_together() {
        let rule = order_rule();
        let statement = parse(
            "SELECT * FROM t_order o JOIN t_order_item i ON o.order_id = i.order_id \
             WHERE o.user_id = 1 AND o.order_id = 3",
        )
        .unwrap();
        let result = route(&rule, &statement, &[]).unwrap();
        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].data_source, "ds_1");
        assert!(result.units[0].sql.contains("t_order_1 o"));
        assert!(result.units[0].sql.contains("t_order_item_1 i"));
    }

    #[test]
    fn test_insert_generates_missing_key() {
        let rule = order_rule();
        let statement =
            parse("INSERT INTO t_order (user_id, status) VALUES (3, 'init')").unwrap();
        let result = route(&rule, &statement, &[]).unwrap();
        assert_eq!(result.generated_key_column.as_deref(), Some("order_id"));
        assert_eq!(result.generated_keys.len(), 1);
        // The key routes the insert to exactly one table of ds_1.
        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].data_source, "ds_1");
        let key = result.generated_keys[0].as_i64().unwrap();
        let expected_table = format!("t_order_{}", key.rem_euclid(2));
        assert!(result.units[0].sql.contains(&expected_table));
        assert!(result.units[0].sql.contains(&format!(", {})", key)));
    }

    #[test]
    fn test_insert_without_database_sharding_value_is_rejected() {
        let rule = order_rule();
        // The generated key pins the table, but nothing narrows the
        // datasource, so the row cannot be placed.
        let statement = parse("INSERT INTO t_order (status) VALUES ('init')").unwrap();
        let err = route(&rule, &statement, &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::AmbiguousInsertRoute);
    }

    #[test]
    fn test_multi_row_insert_spanning_shards_is_rejected() {
        let rule = order_rule();
        let statement =
            parse("INSERT INTO t_order (order_id, user_id) VALUES (0, 0), (1, 1)").unwrap();
        let err = route(&rule, &statement, &[]).unwrap_err();
        assert_eq!(err.code, ErrorCode::AmbiguousInsertRoute);
    }

    #[test]
    fn test_multi_row_insert_on_one_node_routes_once() {
        let rule = order_rule();
        let statement =
            parse("INSERT INTO t_order (order_id, user_id) VALUES (0, 0), (2, 0)").unwrap();
        let result = route(&rule, &statement, &[]).unwrap();
        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].data_source, "ds_0");
        assert!(result.units[0].sql.contains("t_order_0"));
    }

    #[test]
    fn test_insert_with_explicit_key_generates_nothing() {
        let rule = order_rule();
        let statement =
            parse("INSERT INTO t_order (order_id, user_id) VALUES (4, 2)").unwrap();
        let result = route(&rule, &statement, &[]).unwrap();
        assert!(result.generated_key_column.is_none());
        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].data_source, "ds_0");
        assert!(result.units[0].sql.contains("t_order_0"));
    }
}
