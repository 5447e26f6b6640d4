//! End-to-end tests through the datasource facade, against scripted
//! in-memory backends.

use anyhow::Result;
use quilt_common::{ShardingSettings, Value};
use quilt_runtime::keygen::KeyGeneratorRegistry;
use quilt_runtime::strategy::StrategyRegistry;
use quilt_runtime::test_support::{sharded_order_config, MemoryDatasource};
use quilt_runtime::{
    build_sharding_rule, Datasource, ExceptionPolicy, MergedRows, ShardingDataSource, ShardingRule,
};
use std::collections::BTreeMap;
use std::sync::Arc;

struct Fixture {
    ds_0: Arc<MemoryDatasource>,
    ds_1: Arc<MemoryDatasource>,
    datasource: ShardingDataSource,
}

fn fixture() -> Fixture {
    let ds_0 = Arc::new(MemoryDatasource::new("ds_0"));
    let ds_1 = Arc::new(MemoryDatasource::new("ds_1"));
    let mut sources: BTreeMap<String, Arc<dyn Datasource>> = BTreeMap::new();
    sources.insert("ds_0".to_string(), ds_0.clone());
    sources.insert("ds_1".to_string(), ds_1.clone());

    let rule: ShardingRule = build_sharding_rule(
        &sharded_order_config(),
        sources,
        &StrategyRegistry::with_defaults(),
        &KeyGeneratorRegistry::with_defaults(),
    )
    .unwrap();

    let settings = ShardingSettings {
        executor_size: Some(2),
        sql_show: false,
    };
    Fixture {
        ds_0,
        ds_1,
        datasource: ShardingDataSource::new(rule, &settings),
    }
}

fn drain_first_column(mut rows: Box<dyn MergedRows>) -> Result<Vec<Value>> {
    let mut out = Vec::new();
    while rows.next()? {
        out.push(rows.get(0)?);
    }
    Ok(out)
}

#[test]
fn test_sorted_query_across_all_shards() -> Result<()> {
    let fixture = fixture();
    let sql = "SELECT order_id FROM t_order ORDER BY order_id";
    fixture.ds_0.script_query(
        "SELECT order_id FROM t_order_0 ORDER BY order_id",
        vec![vec![Value::Int(1)], vec![Value::Int(5)]],
    );
    fixture.ds_0.script_query(
        "SELECT order_id FROM t_order_1 ORDER BY order_id",
        vec![vec![Value::Int(3)]],
    );
    fixture.ds_1.script_query(
        "SELECT order_id FROM t_order_0 ORDER BY order_id",
        vec![vec![Value::Int(2)], vec![Value::Int(6)]],
    );
    fixture.ds_1.script_query(
        "SELECT order_id FROM t_order_1 ORDER BY order_id",
        vec![vec![Value::Int(4)]],
    );

    let connection = fixture.datasource.connection();
    let mut statement = connection.prepare(sql)?;
    let rows = statement.execute_query(&[])?;
    assert_eq!(
        drain_first_column(rows)?,
        (1..=6).map(Value::Int).collect::<Vec<_>>()
    );
    Ok(())
}

#[test]
fn test_count_merges_to_total() -> Result<()> {
    let fixture = fixture();
    for ds in [&fixture.ds_0, &fixture.ds_1] {
        ds.script_query("SELECT COUNT(*) FROM t_order_0", vec![vec![Value::Int(2)]]);
        ds.script_query("SELECT COUNT(*) FROM t_order_1", vec![vec![Value::Int(1)]]);
    }

    let connection = fixture.datasource.connection();
    let mut statement = connection.prepare("SELECT COUNT(*) FROM t_order")?;
    let rows = statement.execute_query(&[])?;
    assert_eq!(drain_first_column(rows)?, vec![Value::Int(6)]);
    Ok(())
}

#[test]
fn test_single_shard_query_hits_one_node() -> Result<()> {
    let fixture = fixture();
    fixture.ds_1.script_query(
        "SELECT status FROM t_order_1 WHERE user_id = ? AND order_id = ?",
        vec![vec![Value::Text("init".into())]],
    );

    let connection = fixture.datasource.connection();
    let mut statement =
        connection.prepare("SELECT status FROM t_order WHERE user_id = ? AND order_id = ?")?;
    let rows = statement.execute_query(&[Value::Int(1), Value::Int(3)])?;
    assert_eq!(drain_first_column(rows)?, vec![Value::Text("init".into())]);
    assert!(fixture.ds_0.executed().is_empty());
    assert_eq!(fixture.ds_1.executed().len(), 1);
    Ok(())
}

#[test]
fn test_update_counts_summed_across_shards() -> Result<()> {
    let fixture = fixture();
    let rewritten_0 = "UPDATE t_order_0 SET status = 'done' WHERE user_id = 0";
    let rewritten_1 = "UPDATE t_order_1 SET status = 'done' WHERE user_id = 0";
    fixture.ds_0.script_update(rewritten_0, 2);
    fixture.ds_0.script_update(rewritten_1, 3);

    let connection = fixture.datasource.connection();
    let mut statement =
        connection.prepare("UPDATE t_order SET status = 'done' WHERE user_id = 0")?;
    let count = statement.execute_update(&[])?;
    assert_eq!(count, 5);
    assert!(fixture.ds_1.executed().is_empty());
    Ok(())
}

#[test]
fn test_insert_reports_generated_key() -> Result<()> {
    let fixture = fixture();
    let connection = fixture.datasource.connection();
    let mut statement =
        connection.prepare("INSERT INTO t_order (user_id, status) VALUES (1, 'init')")?;
    let count = statement.execute_update(&[])?;
    assert_eq!(count, 1);
    assert_eq!(statement.generated_keys().len(), 1);

    // The key literal is appended to the SQL that reached the shard.
    let executed = fixture.ds_1.executed();
    assert_eq!(executed.len(), 1);
    let key = statement.generated_keys()[0].as_i64().unwrap();
    assert!(executed[0].contains(&key.to_string()));
    assert!(fixture.ds_0.executed().is_empty());
    Ok(())
}

#[test]
fn test_insert_missing_sharding_value_writes_nowhere() {
    let fixture = fixture();
    let connection = fixture.datasource.connection();
    // No user_id: the generated key pins a table but not a datasource, so
    // the row has no single home and nothing may be written.
    let mut statement = connection
        .prepare("INSERT INTO t_order (status) VALUES ('init')")
        .unwrap();
    let err = statement.execute_update(&[]).unwrap_err();
    assert_eq!(err.code, quilt_error::ErrorCode::AmbiguousInsertRoute);
    assert!(fixture.ds_0.executed().is_empty());
    assert!(fixture.ds_1.executed().is_empty());
}

#[test]
fn test_multi_row_insert_spanning_shards_writes_nowhere() {
    let fixture = fixture();
    let connection = fixture.datasource.connection();
    let mut statement = connection
        .prepare("INSERT INTO t_order (order_id, user_id) VALUES (0, 0), (1, 1)")
        .unwrap();
    let err = statement.execute_update(&[]).unwrap_err();
    assert_eq!(err.code, quilt_error::ErrorCode::AmbiguousInsertRoute);
    assert!(fixture.ds_0.executed().is_empty());
    assert!(fixture.ds_1.executed().is_empty());
}

#[test]
fn test_suppress_policy_turns_failures_into_empty_results() -> Result<()> {
    let fixture = fixture();
    for ds in [&fixture.ds_0, &fixture.ds_1] {
        ds.script_query("SELECT COUNT(*) FROM t_order_0", vec![vec![Value::Int(2)]]);
        ds.script_query("SELECT COUNT(*) FROM t_order_1", vec![vec![Value::Int(2)]]);
    }
    fixture.ds_1.fail_on("SELECT COUNT(*) FROM t_order_1");

    let connection = fixture.datasource.connection();
    let mut statement = connection.prepare("SELECT COUNT(*) FROM t_order")?;

    statement.set_exception_policy(ExceptionPolicy::Suppress);
    let rows = statement.execute_query(&[])?;
    // The failed shard contributes nothing; three shards of 2 remain.
    assert_eq!(drain_first_column(rows)?, vec![Value::Int(6)]);

    statement.set_exception_policy(ExceptionPolicy::Propagate);
    let err = statement.execute_query(&[]).unwrap_err();
    assert_eq!(err.code, quilt_error::ErrorCode::TaskFailed);
    Ok(())
}

#[test]
fn test_batch_counts_follow_add_batch_order() -> Result<()> {
    let fixture = fixture();
    let connection = fixture.datasource.connection();
    let mut statement =
        connection.prepare("INSERT INTO t_order (order_id, user_id) VALUES (?, ?)")?;

    // Batches 0 and 2 land on ds_0 (different tables), batch 1 on ds_1.
    statement.add_batch(&[Value::Int(0), Value::Int(0)])?;
    statement.add_batch(&[Value::Int(1), Value::Int(1)])?;
    statement.add_batch(&[Value::Int(3), Value::Int(0)])?;

    let counts = statement.execute_batch()?;
    assert_eq!(counts, vec![1, 1, 1]);
    // ds_0 got two parameter sets on two tables, ds_1 one.
    assert_eq!(fixture.ds_0.executed().len(), 2);
    assert_eq!(fixture.ds_1.executed().len(), 1);
    Ok(())
}

#[test]
fn test_ddl_broadcasts_to_every_node() -> Result<()> {
    let fixture = fixture();
    let connection = fixture.datasource.connection();
    let mut statement = connection.prepare("CREATE TABLE t_order (order_id INT, user_id INT)")?;
    let is_result_set = statement.execute(&[])?;
    assert!(!is_result_set);
    assert_eq!(fixture.ds_0.executed().len(), 2);
    assert_eq!(fixture.ds_1.executed().len(), 2);
    assert!(fixture.ds_0.executed()[0].contains("t_order_0"));
    assert!(fixture.ds_0.executed()[1].contains("t_order_1"));
    Ok(())
}

#[test]
fn test_ruleless_statement_uses_default_datasource() -> Result<()> {
    let fixture = fixture();
    fixture.ds_0.script_query(
        "SELECT name FROM t_config",
        vec![vec![Value::Text("quilt".into())]],
    );
    let connection = fixture.datasource.connection();
    let mut statement = connection.prepare("SELECT name FROM t_config")?;
    let rows = statement.execute_query(&[])?;
    assert_eq!(drain_first_column(rows)?, vec![Value::Text("quilt".into())]);
    assert!(fixture.ds_1.executed().is_empty());
    Ok(())
}
