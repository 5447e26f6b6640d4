//! Statement analysis: classification, table references, sharding conditions
//! and the SELECT merge context.

use quilt_common::Value;
use quilt_error::{ErrorCode, QuiltError, Result};
use sqlparser::ast::{
    self, BinaryOperator, Delete, Expr, FromTable, FunctionArg, FunctionArgExpr,
    FunctionArguments, GroupByExpr, Insert, Join, ObjectName, Offset, OrderByExpr, Query, Select,
    SelectItem, SetExpr, Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use std::collections::HashMap;

use crate::statement::{
    AggregationItem, AggregationKind, Condition, ConditionValue, GroupByItem, InsertContext,
    Limit, OrderItem, SelectContext, ShardingOperator, SqlStatement, SqlType,
};

/// Parses one SQL statement into the routed view.
///
/// Exactly one statement per text; multi-statement strings are rejected.
pub fn parse(sql: &str) -> Result<SqlStatement> {
    let dialect = GenericDialect {};
    let mut statements = Parser::parse_sql(&dialect, sql).map_err(|e| {
        QuiltError::new(ErrorCode::SyntaxError, format!("Cannot parse SQL: {}", e))
            .with_hint("Quilt accepts a single standard SQL statement per call")
    })?;
    if statements.len() != 1 {
        return Err(QuiltError::new(
            ErrorCode::UnsupportedStatement,
            format!("Expected 1 statement, found {}", statements.len()),
        ));
    }

    match statements.remove(0) {
        Statement::Query(query) => analyze_query(sql, &query),
        Statement::Insert(insert) => analyze_insert(sql, &insert),
        Statement::Update {
            table,
            assignments,
            selection,
            ..
        } => analyze_update(sql, &table, &assignments, selection.as_ref()),
        Statement::Delete(delete) => analyze_delete(sql, &delete),
        Statement::CreateTable { name, .. } => Ok(ddl(sql, vec![object_name(&name)])),
        Statement::CreateIndex { table_name, .. } => Ok(ddl(sql, vec![object_name(&table_name)])),
        Statement::AlterTable { name, .. } => Ok(ddl(sql, vec![object_name(&name)])),
        Statement::Drop { names, .. } => {
            Ok(ddl(sql, names.iter().map(object_name).collect()))
        }
        Statement::Truncate { table_name, .. } => Ok(ddl(sql, vec![object_name(&table_name)])),
        _ => Ok(SqlStatement {
            sql: sql.to_string(),
            sql_type: SqlType::Dal,
            tables: Vec::new(),
            conditions: Vec::new(),
            select: None,
            insert: None,
        }),
    }
}

fn ddl(sql: &str, tables: Vec<String>) -> SqlStatement {
    SqlStatement {
        sql: sql.to_string(),
        sql_type: SqlType::Ddl,
        tables,
        conditions: Vec::new(),
        select: None,
        insert: None,
    }
}

fn analyze_query(sql: &str, query: &Query) -> Result<SqlStatement> {
    let select = match query.body.as_ref() {
        SetExpr::Select(select) => select,
        _ => {
            // UNION / VALUES and friends pass through unanalyzed: broadcast
            // semantics, no merge context.
            return Ok(SqlStatement {
                sql: sql.to_string(),
                sql_type: SqlType::Dql,
                tables: Vec::new(),
                conditions: Vec::new(),
                select: None,
                insert: None,
            });
        }
    };

    let (tables, aliases) = tables_of(&select.from);
    let mut extractor = ConditionExtractor::with_aliases(aliases);

    // Projection first: `?` ordinals follow textual order.
    for item in &select.projection {
        match item {
            SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                extractor.count_placeholders(expr)
            }
            _ => {}
        }
    }
    if let Some(selection) = &select.selection {
        extractor.extract(selection);
    }

    let context = select_context(select, query)?;

    Ok(SqlStatement {
        sql: sql.to_string(),
        sql_type: SqlType::Dql,
        tables,
        conditions: extractor.conditions,
        select: Some(context),
        insert: None,
    })
}

fn analyze_insert(sql: &str, insert: &Insert) -> Result<SqlStatement> {
    let table = object_name(&insert.table_name);
    let columns: Vec<String> = insert.columns.iter().map(|c| c.value.clone()).collect();

    let mut extractor = ConditionExtractor::default();
    let mut rows = 0usize;

    if let Some(source) = &insert.source {
        if let SetExpr::Values(values) = source.body.as_ref() {
            rows = values.rows.len();
            extractor.extract_insert_values(&columns, &values.rows, &table);
        }
    }

    Ok(SqlStatement {
        sql: sql.to_string(),
        sql_type: SqlType::Dml,
        tables: vec![table],
        conditions: extractor.conditions,
        select: None,
        insert: Some(InsertContext { columns, rows }),
    })
}

fn analyze_update(
    sql: &str,
    table: &TableWithJoins,
    assignments: &[ast::Assignment],
    selection: Option<&Expr>,
) -> Result<SqlStatement> {
    let (tables, aliases) = tables_of(std::slice::from_ref(table));
    let mut extractor = ConditionExtractor::with_aliases(aliases);

    // SET expressions precede WHERE, so their `?` ordinals come first.
    for assignment in assignments {
        extractor.count_placeholders(&assignment.value);
    }
    if let Some(selection) = selection {
        extractor.extract(selection);
    }

    Ok(SqlStatement {
        sql: sql.to_string(),
        sql_type: SqlType::Dml,
        tables,
        conditions: extractor.conditions,
        select: None,
        insert: None,
    })
}

fn analyze_delete(sql: &str, delete: &Delete) -> Result<SqlStatement> {
    let from = match &delete.from {
        FromTable::WithFromKeyword(from) | FromTable::WithoutKeyword(from) => from,
    };
    let (tables, aliases) = tables_of(from);
    let mut extractor = ConditionExtractor::with_aliases(aliases);
    if let Some(selection) = &delete.selection {
        extractor.extract(selection);
    }

    Ok(SqlStatement {
        sql: sql.to_string(),
        sql_type: SqlType::Dml,
        tables,
        conditions: extractor.conditions,
        select: None,
        insert: None,
    })
}

// === tables ===

/// Tables in reference order, plus an alias-to-table map so qualified
/// conditions can be scoped to their logical table.
fn tables_of(from: &[TableWithJoins]) -> (Vec<String>, HashMap<String, String>) {
    let mut tables = Vec::new();
    let mut aliases = HashMap::new();
    for twj in from {
        collect_table(&twj.relation, &mut tables, &mut aliases);
        for Join { relation, .. } in &twj.joins {
            collect_table(relation, &mut tables, &mut aliases);
        }
    }
    (tables, aliases)
}

fn collect_table(
    factor: &TableFactor,
    out: &mut Vec<String>,
    aliases: &mut HashMap<String, String>,
) {
    if let TableFactor::Table { name, alias, .. } = factor {
        let table = object_name(name);
        if let Some(alias) = alias {
            aliases.insert(alias.name.value.to_ascii_lowercase(), table.clone());
        }
        out.push(table);
    }
}

fn object_name(name: &ObjectName) -> String {
    // Logical tables are addressed unqualified; keep the last segment.
    name.0
        .last()
        .map(|ident| ident.value.clone())
        .unwrap_or_default()
}

// === SELECT merge context ===

fn select_context(select: &Select, query: &Query) -> Result<SelectContext> {
    let projection_width = select.projection.len();
    let mut aggregations = Vec::new();
    let mut names: Vec<String> = Vec::with_capacity(projection_width);

    for (index, item) in select.projection.iter().enumerate() {
        let (expr, alias) = match item {
            SelectItem::UnnamedExpr(expr) => (Some(expr), None),
            SelectItem::ExprWithAlias { expr, alias } => (Some(expr), Some(alias.value.clone())),
            _ => (None, None),
        };
        names.push(projection_name(expr, alias.as_deref()));
        if let Some(expr) = expr {
            if let Some(aggregation) = aggregation_of(expr, index) {
                aggregations.push(aggregation);
            }
        }
    }

    // Derived AVG columns land after the logical projection, two per AVG,
    // in aggregation order. The rewrite appends them with matching aliases.
    let mut next_derived = projection_width;
    for aggregation in &mut aggregations {
        if aggregation.kind == AggregationKind::Avg {
            aggregation.derived_count_index = Some(next_derived);
            aggregation.derived_sum_index = Some(next_derived + 1);
            next_derived += 2;
        }
    }

    let group_by = match &select.group_by {
        GroupByExpr::Expressions(exprs) => exprs
            .iter()
            .map(|expr| {
                let name = expr_name(expr);
                GroupByItem {
                    index: resolve_index(&name, &names),
                    name,
                }
            })
            .collect(),
        GroupByExpr::All => {
            return Err(QuiltError::new(
                ErrorCode::UnsupportedStatement,
                "GROUP BY ALL is not supported",
            ))
        }
    };

    let order_by = query
        .order_by
        .iter()
        .map(|OrderByExpr { expr, asc, .. }| {
            let name = expr_name(expr);
            OrderItem {
                index: resolve_index(&name, &names),
                name,
                desc: !asc.unwrap_or(true),
            }
        })
        .collect();

    let limit = limit_of(query)?;

    Ok(SelectContext {
        projection_width,
        distinct: select.distinct.is_some(),
        aggregations,
        group_by,
        order_by,
        limit,
    })
}

fn projection_name(expr: Option<&Expr>, alias: Option<&str>) -> String {
    if let Some(alias) = alias {
        return alias.to_string();
    }
    expr.map(expr_name).unwrap_or_default()
}

fn expr_name(expr: &Expr) -> String {
    match expr {
        Expr::Identifier(ident) => ident.value.clone(),
        Expr::CompoundIdentifier(idents) => idents
            .last()
            .map(|ident| ident.value.clone())
            .unwrap_or_default(),
        other => other.to_string(),
    }
}

/// Resolves a GROUP BY / ORDER BY item to a projection index: positional
/// (`ORDER BY 2`) or by name/alias, case-insensitively.
fn resolve_index(name: &str, projection_names: &[String]) -> Option<usize> {
    if let Ok(position) = name.parse::<usize>() {
        if position >= 1 && position <= projection_names.len() {
            return Some(position - 1);
        }
        return None;
    }
    projection_names
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(name))
}

fn aggregation_of(expr: &Expr, index: usize) -> Option<AggregationItem> {
    let function = match expr {
        Expr::Function(function) => function,
        _ => return None,
    };
    if function.name.0.len() != 1 {
        return None;
    }
    let kind = match function.name.0[0].value.to_ascii_uppercase().as_str() {
        "COUNT" => AggregationKind::Count,
        "SUM" => AggregationKind::Sum,
        "AVG" => AggregationKind::Avg,
        "MAX" => AggregationKind::Max,
        "MIN" => AggregationKind::Min,
        _ => return None,
    };

    let (arg, distinct_arg) = match &function.args {
        FunctionArguments::List(list) => {
            let arg = list
                .args
                .iter()
                .map(|arg| match arg {
                    FunctionArg::Unnamed(FunctionArgExpr::Wildcard) => "*".to_string(),
                    FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) => expr.to_string(),
                    other => other.to_string(),
                })
                .collect::<Vec<_>>()
                .join(", ");
            (arg, list.duplicate_treatment.is_some())
        }
        _ => ("*".to_string(), false),
    };

    Some(AggregationItem {
        kind,
        index,
        arg,
        distinct_arg,
        derived_count_index: None,
        derived_sum_index: None,
    })
}

fn limit_of(query: &Query) -> Result<Option<Limit>> {
    let row_count = match &query.limit {
        None => None,
        Some(expr) => Some(literal_u64(expr).ok_or_else(|| {
            QuiltError::new(
                ErrorCode::UnsupportedStatement,
                "LIMIT must be a literal integer",
            )
        })?),
    };
    let offset = match &query.offset {
        None => 0,
        Some(Offset { value, .. }) => literal_u64(value).ok_or_else(|| {
            QuiltError::new(
                ErrorCode::UnsupportedStatement,
                "OFFSET must be a literal integer",
            )
        })?,
    };
    if row_count.is_none() && offset == 0 {
        return Ok(None);
    }
    Ok(Some(Limit { offset, row_count }))
}

fn literal_u64(expr: &Expr) -> Option<u64> {
    match expr {
        Expr::Value(ast::Value::Number(text, _)) => text.parse().ok(),
        _ => None,
    }
}

// === conditions ===

/// Walks expressions in syntactic order, assigning `?` ordinals and lifting
/// AND-connected `=` / `IN` / `BETWEEN` conjuncts into conditions. OR
/// subtrees contribute nothing (the router over-approximates instead).
#[derive(Default)]
struct ConditionExtractor {
    next_placeholder: usize,
    conditions: Vec<Condition>,
    /// Lowercased alias to table name.
    aliases: HashMap<String, String>,
}

impl ConditionExtractor {
    fn with_aliases(aliases: HashMap<String, String>) -> Self {
        ConditionExtractor {
            aliases,
            ..Default::default()
        }
    }

    fn extract(&mut self, expr: &Expr) {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOperator::And,
                right,
            } => {
                self.extract(left);
                self.extract(right);
            }
            Expr::Nested(inner) => self.extract(inner),
            Expr::BinaryOp {
                left,
                op: BinaryOperator::Eq,
                right,
            } => self.try_condition(left, ShardingOperator::Equal, &[right]),
            Expr::InList {
                expr,
                list,
                negated: false,
            } => {
                let values: Vec<&Expr> = list.iter().collect();
                self.try_condition_ref(expr, ShardingOperator::In, &values);
            }
            Expr::Between {
                expr,
                negated: false,
                low,
                high,
            } => self.try_condition(expr, ShardingOperator::Between, &[low, high]),
            other => self.count_placeholders(other),
        }
    }

    /// INSERT: pair the column list with each VALUES row. Multi-row inserts
    /// collapse to one IN-condition per column.
    fn extract_insert_values(&mut self, columns: &[String], rows: &[Vec<Expr>], table: &str) {
        let mut per_column: Vec<Vec<ConditionValue>> = vec![Vec::new(); columns.len()];
        for row in rows {
            for (position, expr) in row.iter().enumerate() {
                let value = self.condition_value(expr);
                if position < per_column.len() {
                    if let Some(value) = value {
                        per_column[position].push(value);
                    }
                }
            }
        }
        for (column, values) in columns.iter().zip(per_column) {
            if values.is_empty() {
                continue;
            }
            let operator = if values.len() == 1 {
                ShardingOperator::Equal
            } else {
                ShardingOperator::In
            };
            self.conditions.push(Condition {
                table: Some(table.to_string()),
                column: column.clone(),
                operator,
                values,
            });
        }
    }

    fn try_condition(&mut self, column: &Expr, operator: ShardingOperator, values: &[&Expr]) {
        self.try_condition_ref(column, operator, values)
    }

    fn try_condition_ref(&mut self, column: &Expr, operator: ShardingOperator, values: &[&Expr]) {
        let (table, column) = match column_ref(column) {
            Some((qualifier, column)) => {
                // Alias qualifiers resolve to their table; unknown qualifiers
                // are kept verbatim (schema-qualified references).
                let table = qualifier.map(|q| {
                    self.aliases
                        .get(&q.to_ascii_lowercase())
                        .cloned()
                        .unwrap_or(q)
                });
                (table, column)
            }
            None => {
                // Not a plain column: keep ordinals aligned, contribute nothing.
                self.count_placeholders(column);
                for value in values {
                    self.count_placeholders(value);
                }
                return;
            }
        };
        let mut resolved = Vec::with_capacity(values.len());
        let mut all_simple = true;
        for value in values {
            match self.condition_value(value) {
                Some(value) => resolved.push(value),
                None => all_simple = false,
            }
        }
        if all_simple && !resolved.is_empty() {
            self.conditions.push(Condition {
                table,
                column,
                operator,
                values: resolved,
            });
        }
    }

    /// A literal or placeholder; anything else counts placeholders and
    /// returns `None`, dropping the conjunct.
    fn condition_value(&mut self, expr: &Expr) -> Option<ConditionValue> {
        match expr {
            Expr::Value(ast::Value::Placeholder(_)) => {
                let ordinal = self.next_placeholder;
                self.next_placeholder += 1;
                Some(ConditionValue::Placeholder(ordinal))
            }
            Expr::Value(value) => literal(value).map(ConditionValue::Literal),
            Expr::UnaryOp {
                op: ast::UnaryOperator::Minus,
                expr,
            } => match self.condition_value(expr) {
                Some(ConditionValue::Literal(Value::Int(v))) => {
                    Some(ConditionValue::Literal(Value::Int(-v)))
                }
                Some(ConditionValue::Literal(Value::Float(v))) => {
                    Some(ConditionValue::Literal(Value::Float(-v)))
                }
                _ => None,
            },
            other => {
                self.count_placeholders(other);
                None
            }
        }
    }

    /// Counts `?` occurrences without extracting conditions, keeping
    /// ordinals aligned with textual order.
    fn count_placeholders(&mut self, expr: &Expr) {
        match expr {
            Expr::Value(ast::Value::Placeholder(_)) => self.next_placeholder += 1,
            Expr::BinaryOp { left, right, .. } => {
                self.count_placeholders(left);
                self.count_placeholders(right);
            }
            Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => self.count_placeholders(expr),
            Expr::InList { expr, list, .. } => {
                self.count_placeholders(expr);
                for item in list {
                    self.count_placeholders(item);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.count_placeholders(expr);
                self.count_placeholders(low);
                self.count_placeholders(high);
            }
            Expr::Function(function) => {
                if let FunctionArguments::List(list) = &function.args {
                    for arg in &list.args {
                        if let FunctionArg::Unnamed(FunctionArgExpr::Expr(expr)) = arg {
                            self.count_placeholders(expr);
                        }
                    }
                }
            }
            Expr::IsNull(expr) | Expr::IsNotNull(expr) => self.count_placeholders(expr),
            Expr::Like { expr, pattern, .. } | Expr::ILike { expr, pattern, .. } => {
                self.count_placeholders(expr);
                self.count_placeholders(pattern);
            }
            _ => {}
        }
    }
}

fn column_ref(expr: &Expr) -> Option<(Option<String>, String)> {
    match expr {
        Expr::Identifier(ident) => Some((None, ident.value.clone())),
        Expr::CompoundIdentifier(idents) if idents.len() >= 2 => {
            let column = idents.last()?.value.clone();
            let table = idents[idents.len() - 2].value.clone();
            Some((Some(table), column))
        }
        _ => None,
    }
}

fn literal(value: &ast::Value) -> Option<Value> {
    match value {
        ast::Value::Number(text, _) => {
            if let Ok(v) = text.parse::<i64>() {
                Some(Value::Int(v))
            } else {
                text.parse::<f64>().ok().map(Value::Float)
            }
        }
        ast::Value::SingleQuotedString(s) | ast::Value::DoubleQuotedString(s) => {
            Some(Value::Text(s.clone()))
        }
        ast::Value::Boolean(b) => Some(Value::Bool(*b)),
        ast::Value::Null => Some(Value::Null),
        _ => None,
    }
}
