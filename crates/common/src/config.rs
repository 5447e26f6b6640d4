//! Configuration surface for the sharding middleware.
//!
//! Two layers, mirroring how a sharding datasource is assembled:
//! - [`ShardingSettings`]: runtime tunables (worker-pool size, SQL debug log).
//! - [`ShardingRuleConfig`]: the declarative rule topology that the runtime
//!   builds an immutable `ShardingRule` from.
//!
//! Both load from a file plus `QUILT`-prefixed environment overrides
//! (e.g. `QUILT_SETTINGS__SQL_SHOW=true` maps to `settings.sql_show`).

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_SQL_SHOW: bool = false;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ShardingSettings {
    /// Worker-pool size; `None` means one worker per host core.
    #[serde(default)]
    pub executor_size: Option<usize>,

    /// Log every routed execution unit at INFO (target: "sql").
    #[serde(default = "default_sql_show")]
    pub sql_show: bool,
}

fn default_sql_show() -> bool {
    DEFAULT_SQL_SHOW
}

impl ShardingSettings {
    /// The effective pool size: the configured value, else the host core count.
    pub fn effective_executor_size(&self) -> usize {
        self.executor_size.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Reference to a sharding strategy: a registry key plus the columns it reads.
#[derive(Debug, Deserialize, Clone)]
pub struct StrategyConfig {
    /// Key into the strategy registry (e.g. "modulo", "none").
    pub algorithm: String,

    #[serde(default)]
    pub sharding_columns: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TableRuleConfig {
    pub logic_table: String,

    /// Inline node expressions (e.g. `ds_${0..1}.t_order_${0..1}`). Empty
    /// means one node per known datasource, keeping the logical table name.
    #[serde(default)]
    pub actual_data_nodes: Vec<String>,

    #[serde(default)]
    pub database_strategy: Option<StrategyConfig>,

    #[serde(default)]
    pub table_strategy: Option<StrategyConfig>,

    /// Column filled from a key generator when absent from an INSERT.
    #[serde(default)]
    pub generate_key_column: Option<String>,

    /// Key into the key-generator registry; `None` falls back to the rule
    /// default.
    #[serde(default)]
    pub key_generator: Option<String>,

    #[serde(default)]
    pub logic_index: Option<String>,
}

/// One master/replica group folded into a single logical datasource name.
#[derive(Debug, Deserialize, Clone)]
pub struct MasterSlaveConfig {
    pub name: String,
    pub master: String,
    #[serde(default)]
    pub slaves: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ShardingRuleConfig {
    /// Target for unrouted/administrative statements and ruleless tables.
    #[serde(default)]
    pub default_data_source: Option<String>,

    #[serde(default)]
    pub tables: Vec<TableRuleConfig>,

    /// Groups of logical tables guaranteed to shard identically.
    #[serde(default)]
    pub binding_tables: Vec<Vec<String>>,

    #[serde(default)]
    pub default_database_strategy: Option<StrategyConfig>,

    #[serde(default)]
    pub default_table_strategy: Option<StrategyConfig>,

    /// Registry key for the default key generator ("snowflake" if omitted).
    #[serde(default)]
    pub default_key_generator: Option<String>,

    #[serde(default)]
    pub master_slave: Vec<MasterSlaveConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: ShardingSettings,
    #[serde(default)]
    pub rule: ShardingRuleConfig,
}

impl AppConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let builder = config::Config::builder();

        let builder = if std::path::Path::new(path).exists() {
            builder.add_source(config::File::with_name(path))
        } else {
            builder
        };

        // Map QUILT_SETTINGS__SQL_SHOW to settings.sql_show, etc.
        let builder = builder.add_source(
            config::Environment::with_prefix("QUILT")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().context("Failed to build configuration")?;

        let app_config: AppConfig = cfg
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        Ok(app_config)
    }
}
