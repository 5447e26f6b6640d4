//! Parsed-statement facts consumed by routing, execution and merging.

use quilt_common::Value;
use serde::Serialize;

/// Coarse statement classification driving routing and result handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SqlType {
    /// SELECT — results are merged.
    Dql,
    /// INSERT / UPDATE / DELETE — update counts are summed.
    Dml,
    /// Schema changes — always broadcast.
    Ddl,
    /// Administrative statements — routed to the default datasource.
    Dal,
}

impl SqlType {
    pub fn is_query(&self) -> bool {
        matches!(self, SqlType::Dql)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShardingOperator {
    Equal,
    In,
    Between,
}

/// A condition value: a literal, or a `?` resolved against bound parameters
/// at route time (ordinal = occurrence order within the whole statement).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ConditionValue {
    Literal(Value),
    Placeholder(usize),
}

impl ConditionValue {
    pub fn resolve(&self, parameters: &[Value]) -> Option<Value> {
        match self {
            ConditionValue::Literal(v) => Some(v.clone()),
            ConditionValue::Placeholder(i) => parameters.get(*i).cloned(),
        }
    }
}

/// One sharding-relevant conjunct extracted from WHERE (or INSERT values).
#[derive(Debug, Clone, Serialize)]
pub struct Condition {
    /// Table qualifier as written, if any.
    pub table: Option<String>,
    pub column: String,
    pub operator: ShardingOperator,
    pub values: Vec<ConditionValue>,
}

impl Condition {
    /// Whether this condition constrains `column` of `logic_table`.
    /// An unqualified condition matches any table (single-table statements).
    pub fn matches(&self, logic_table: &str, column: &str) -> bool {
        let table_ok = match &self.table {
            Some(t) => t.eq_ignore_ascii_case(logic_table),
            None => true,
        };
        table_ok && self.column.eq_ignore_ascii_case(column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggregationKind {
    Count,
    Sum,
    Avg,
    Max,
    Min,
}

/// One aggregate projection item.
#[derive(Debug, Clone, Serialize)]
pub struct AggregationItem {
    pub kind: AggregationKind,
    /// Position within the projection (0-based result-set index).
    pub index: usize,
    /// Argument text, e.g. `price` or `*`; reused by the AVG rewrite.
    pub arg: String,
    /// `AVG` carries a DISTINCT/qualified shape we refuse to merge.
    pub distinct_arg: bool,
    /// Result-set index of the derived COUNT column (AVG only).
    pub derived_count_index: Option<usize>,
    /// Result-set index of the derived SUM column (AVG only).
    pub derived_sum_index: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupByItem {
    pub name: String,
    /// Resolved projection index; `None` means the merge cannot align it.
    pub index: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderItem {
    pub name: String,
    pub index: Option<usize>,
    pub desc: bool,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Limit {
    pub offset: u64,
    pub row_count: Option<u64>,
}

/// Everything the merge engine needs to know about a SELECT.
#[derive(Debug, Clone, Serialize)]
pub struct SelectContext {
    /// Number of projection items in the logical statement (derived columns
    /// appended by the rewrite sit at indexes >= this).
    pub projection_width: usize,
    pub distinct: bool,
    pub aggregations: Vec<AggregationItem>,
    pub group_by: Vec<GroupByItem>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<Limit>,
}

impl SelectContext {
    /// Total column count of the physical result sets, derived columns
    /// included.
    pub fn physical_width(&self) -> usize {
        let derived = self
            .aggregations
            .iter()
            .filter(|a| a.kind == AggregationKind::Avg)
            .count();
        self.projection_width + derived * 2
    }
}

/// INSERT shape for generated-key decisions.
#[derive(Debug, Clone, Serialize)]
pub struct InsertContext {
    /// Explicit column list, as written. Empty when omitted.
    pub columns: Vec<String>,
    /// Number of VALUES rows.
    pub rows: usize,
}

impl InsertContext {
    pub fn contains_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c.eq_ignore_ascii_case(column))
    }
}

/// The routed view of one parsed statement. Immutable once built; the facade
/// caches it per distinct SQL text and re-routes per execution.
#[derive(Debug, Clone, Serialize)]
pub struct SqlStatement {
    pub sql: String,
    pub sql_type: SqlType,
    /// Logical tables in reference order; the first ruled one drives routing.
    pub tables: Vec<String>,
    pub conditions: Vec<Condition>,
    pub select: Option<SelectContext>,
    pub insert: Option<InsertContext>,
}

impl SqlStatement {
    pub fn primary_table(&self) -> Option<&str> {
        self.tables.first().map(String::as_str)
    }

    /// Conditions constraining `column` of `logic_table`.
    pub fn conditions_for(&self, logic_table: &str, column: &str) -> Vec<&Condition> {
        self.conditions
            .iter()
            .filter(|c| c.matches(logic_table, column))
            .collect()
    }
}
