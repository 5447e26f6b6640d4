//! The rule model: data nodes, table rules and the aggregate sharding rule.

mod builder;

pub use builder::build_sharding_rule;

use crate::backend::Datasource;
use crate::keygen::KeyGenerator;
use crate::strategy::BoundStrategy;
use quilt_error::{ErrorCode, ErrorContext, QuiltError, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One physical location of a logical table: `datasource.table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNode {
    pub data_source: String,
    pub table: String,
}

impl DataNode {
    /// Parses a `ds.table` expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let mut parts = expression.splitn(2, '.');
        match (parts.next(), parts.next()) {
            (Some(data_source), Some(table)) if !data_source.is_empty() && !table.is_empty() => {
                Ok(DataNode {
                    data_source: data_source.to_string(),
                    table: table.to_string(),
                })
            }
            _ => Err(QuiltError::new(
                ErrorCode::InvalidDataNode,
                format!("Invalid data node expression '{}'", expression),
            )
            .with_context(ErrorContext::DataNode {
                expression: expression.to_string(),
                datasource: None,
            })
            .with_hint("Data nodes are written as 'datasource.table'")),
        }
    }
}

/// Sharding rule for one logical table. Data nodes keep configuration order;
/// routing emits execution units in this order.
#[derive(Debug)]
pub struct TableRule {
    pub logic_table: String,
    pub data_nodes: Vec<DataNode>,
    pub database_strategy: Option<BoundStrategy>,
    pub table_strategy: Option<BoundStrategy>,
    pub generate_key_column: Option<String>,
    pub key_generator: Option<Arc<dyn KeyGenerator>>,
    /// Logical index name, rewritten like a table name in DDL.
    pub logic_index: Option<String>,
}

impl TableRule {
    /// Datasource names in first-appearance order, deduplicated.
    pub fn actual_data_source_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for node in &self.data_nodes {
            if !names.contains(&node.data_source) {
                names.push(node.data_source.clone());
            }
        }
        names
    }

    /// Physical table names within one datasource, in node order.
    pub fn actual_table_names(&self, data_source: &str) -> Vec<String> {
        self.data_nodes
            .iter()
            .filter(|node| node.data_source == data_source)
            .map(|node| node.table.clone())
            .collect()
    }

    /// Position of a physical table within its datasource's node list.
    /// Binding-table routing pairs peers by this index.
    pub fn actual_table_index(&self, data_source: &str, table: &str) -> Option<usize> {
        self.data_nodes
            .iter()
            .filter(|node| node.data_source == data_source)
            .position(|node| node.table == table)
    }
}

/// The aggregate rule: datasources, per-table rules, binding groups and
/// defaults. Built once from configuration and shared immutably.
#[derive(Debug)]
pub struct ShardingRule {
    pub data_sources: BTreeMap<String, Arc<dyn Datasource>>,
    pub default_data_source_name: Option<String>,
    pub table_rules: Vec<TableRule>,
    /// Groups of logic tables sharing identical sharding, routed together.
    pub binding_groups: Vec<Vec<String>>,
    pub default_database_strategy: Option<BoundStrategy>,
    pub default_table_strategy: Option<BoundStrategy>,
    pub default_key_generator: Arc<dyn KeyGenerator>,
}

impl ShardingRule {
    pub fn table_rule(&self, logic_table: &str) -> Option<&TableRule> {
        self.table_rules
            .iter()
            .find(|rule| rule.logic_table.eq_ignore_ascii_case(logic_table))
    }

    pub fn data_source(&self, name: &str) -> Result<&Arc<dyn Datasource>> {
        self.data_sources.get(name).ok_or_else(|| {
            QuiltError::new(
                ErrorCode::UnknownDataSource,
                format!("No datasource named '{}'", name),
            )
            .with_context(ErrorContext::generic([(
                "known_data_sources",
                self.data_sources.keys().cloned().collect::<Vec<_>>().join(", "),
            )]))
        })
    }

    /// The datasource statements without table rules fall back to.
    pub fn default_data_source(&self) -> Result<&Arc<dyn Datasource>> {
        match &self.default_data_source_name {
            Some(name) => self.data_source(name),
            None => Err(QuiltError::new(
                ErrorCode::NoTableRule,
                "No table rule matched and no default datasource is configured",
            )
            .with_hint("Configure rule.default_data_source or add a table rule")),
        }
    }

    pub fn is_binding(&self, left: &str, right: &str) -> bool {
        self.binding_groups.iter().any(|group| {
            group.iter().any(|t| t.eq_ignore_ascii_case(left))
                && group.iter().any(|t| t.eq_ignore_ascii_case(right))
        })
    }

    /// Resolves a binding peer's physical table: the peer uses the same node
    /// index as the primary table within the same datasource.
    pub fn binding_actual_table(
        &self,
        data_source: &str,
        primary_logic: &str,
        primary_actual: &str,
        peer_logic: &str,
    ) -> Result<String> {
        let primary = self.table_rule(primary_logic);
        let peer = self.table_rule(peer_logic);
        if let (Some(primary), Some(peer)) = (primary, peer) {
            if let Some(index) = primary.actual_table_index(data_source, primary_actual) {
                if let Some(table) = peer.actual_table_names(data_source).get(index) {
                    return Ok(table.clone());
                }
            }
        }
        Err(QuiltError::new(
            ErrorCode::InvalidRouteTarget,
            format!(
                "Cannot pair binding table '{}' with '{}.{}'",
                peer_logic, data_source, primary_actual
            ),
        )
        .with_context(ErrorContext::RouteTarget {
            logic_table: peer_logic.to_string(),
            target: format!("{}.{}", data_source, primary_actual),
            available: peer
                .map(|rule| rule.actual_table_names(data_source))
                .unwrap_or_default(),
        }))
    }

    /// Effective database strategy for a table rule (rule-level wins).
    pub fn database_strategy<'a>(&'a self, rule: &'a TableRule) -> Option<&'a BoundStrategy> {
        rule.database_strategy
            .as_ref()
            .or(self.default_database_strategy.as_ref())
    }

    /// Effective table strategy for a table rule (rule-level wins).
    pub fn table_strategy<'a>(&'a self, rule: &'a TableRule) -> Option<&'a BoundStrategy> {
        rule.table_strategy
            .as_ref()
            .or(self.default_table_strategy.as_ref())
    }

    /// Effective key generator for a table rule.
    pub fn key_generator(&self, rule: &TableRule) -> Arc<dyn KeyGenerator> {
        rule.key_generator
            .clone()
            .unwrap_or_else(|| self.default_key_generator.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_node_parse() {
        let node = DataNode::parse("ds_0.t_order_1").unwrap();
        assert_eq!(node.data_source, "ds_0");
        assert_eq!(node.table, "t_order_1");
    }

    #[test]
    fn test_data_node_parse_rejects_bare_table() {
        let err = DataNode::parse("t_order").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidDataNode);
        assert!(DataNode::parse("ds_0.").is_err());
        assert!(DataNode::parse(".t_order").is_err());
    }

    fn rule_with_nodes(expressions: &[&str]) -> TableRule {
        TableRule {
            logic_table: "t_order".to_string(),
            data_nodes: expressions
                .iter()
                .map(|e| DataNode::parse(e).unwrap())
                .collect(),
            database_strategy: None,
            table_strategy: None,
            generate_key_column: None,
            key_generator: None,
            logic_index: None,
        }
    }

    #[test]
    fn test_actual_names_preserve_order() {
        let rule = rule_with_nodes(&["ds_1.t_order_0", "ds_0.t_order_0", "ds_1.t_order_1"]);
        assert_eq!(rule.actual_data_source_names(), vec!["ds_1", "ds_0"]);
        assert_eq!(
            rule.actual_table_names("ds_1"),
            vec!["t_order_0", "t_order_1"]
        );
        assert_eq!(rule.actual_table_index("ds_1", "t_order_1"), Some(1));
        assert_eq!(rule.actual_table_index("ds_0", "t_order_1"), None);
    }
}
