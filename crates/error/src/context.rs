//! # Error Contexts
//!
//! Structured metadata for errors to enable programmatic analysis.

use serde::{Deserialize, Serialize};

/// Structured context attached to a [`crate::QuiltError`].
///
/// Each variant provides specific fields relevant to that error type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ErrorContext {
    /// Context for QUILT-2002 (NoTableRule)
    TableRule {
        logic_table: String,
        known_tables: Vec<String>,
    },

    /// Context for QUILT-2003 (InvalidRouteTarget)
    RouteTarget {
        logic_table: String,
        target: String,
        available: Vec<String>,
    },

    /// Context for QUILT-3002/3003 (datasource / data-node config errors)
    DataNode {
        expression: String,
        datasource: Option<String>,
    },

    /// Context for QUILT-1001 (TaskFailed)
    Execution {
        datasource: String,
        sql: String,
    },

    /// Context for QUILT-4001/4002 (merge errors)
    Merge {
        reason: String,
        column: Option<String>,
    },

    /// Generic key-value context for extensibility
    Generic {
        #[serde(flatten)]
        data: std::collections::HashMap<String, serde_json::Value>,
    },
}

impl ErrorContext {
    /// Builds a [`ErrorContext::Generic`] from key-value pairs.
    pub fn generic<K, V, I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<serde_json::Value>,
    {
        ErrorContext::Generic {
            data: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
