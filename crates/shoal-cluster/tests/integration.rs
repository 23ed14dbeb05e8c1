//! Integration tests for shoal-cluster
//!
//! These tests verify whole-cluster behavior through the public API:
//! - Fan-out invocation and demotion of divergent replicas
//! - Crash recovery through the redb durability log
//! - Distributed locks and state across dispatch-group members

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use shoal_cluster::{
    ClusterConfig, ClusterError, CommandDispatcher, Database, DatabaseCluster, DatabaseConfig,
    InvocationEvent, InvocationStrategy, Invoker, InvokerEvent, LocalGroup, LockConfig, Phase,
    SqlError, StateManager, StateStoreKind,
};

/// Invoker returning a scripted outcome per database id (unlisted ids
/// succeed with `b"ok"`)
struct ScriptedInvoker {
    outcomes: HashMap<String, Result<Bytes, SqlError>>,
}

impl ScriptedInvoker {
    fn new(entries: Vec<(&str, Result<Bytes, SqlError>)>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: entries
                .into_iter()
                .map(|(id, outcome)| (id.to_string(), outcome))
                .collect(),
        })
    }
}

#[async_trait]
impl Invoker for ScriptedInvoker {
    async fn invoke(&self, database: &Database) -> Result<Bytes, SqlError> {
        self.outcomes
            .get(&database.id)
            .cloned()
            .unwrap_or_else(|| Ok(Bytes::from_static(b"ok")))
    }
}

fn connection_error() -> SqlError {
    SqlError::new(0, Some("08001"), "connection refused")
}

/// Create a test cluster configuration (in-memory store, short lock waits)
fn test_config(ids: &[&str]) -> ClusterConfig {
    let mut builder = ClusterConfig::builder("orders").lock(LockConfig {
        acquire_timeout: Duration::from_millis(100),
        retry_interval: Duration::from_millis(10),
    });
    for id in ids {
        builder = builder.database(DatabaseConfig::new(*id, format!("postgres://{}/orders", id)));
    }
    builder.build().unwrap()
}

async fn test_cluster(group: &Arc<LocalGroup>, member: &str, ids: &[&str]) -> DatabaseCluster {
    let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(group.dispatcher(member));
    let cluster = DatabaseCluster::new(test_config(ids), dispatcher).unwrap();
    cluster.start().await.unwrap();
    cluster
}

#[tokio::test]
async fn test_fan_out_demotes_divergent_replica() {
    let group = LocalGroup::new();
    let cluster = test_cluster(&group, "node-1", &["db1", "db2", "db3"]).await;

    // db2 violates a constraint the others accept
    let invoker = ScriptedInvoker::new(vec![(
        "db2",
        Err(SqlError::new(0, Some("23505"), "duplicate key")),
    )]);
    let results = cluster
        .invoke(InvocationStrategy::InvokeOnAll, invoker, Phase::Prepare)
        .await
        .unwrap();

    // The consensus result stands; the dissenter is out of the cluster
    assert_eq!(results.len(), 2);
    assert!(results.contains_key("db1"));
    assert!(results.contains_key("db3"));

    let health = cluster.health().await.unwrap();
    assert_eq!(health.active_databases, vec!["db1", "db3"]);

    // Completion cleared the durability log
    assert!(cluster.state().recover().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unanimous_failure_is_rethrown_without_demotion() {
    let group = LocalGroup::new();
    let cluster = test_cluster(&group, "node-1", &["db1", "db2"]).await;

    let invoker = ScriptedInvoker::new(vec![
        ("db1", Err(connection_error())),
        ("db2", Err(connection_error())),
    ]);
    let outcome = cluster
        .invoke(InvocationStrategy::InvokeOnAll, invoker, Phase::Prepare)
        .await;

    match outcome {
        Err(ClusterError::Sql(e)) => assert_eq!(e, connection_error()),
        other => panic!("expected the unanimous error, got {:?}", other),
    }
    // Nothing was deactivated; there would be nothing left to serve
    assert_eq!(cluster.health().await.unwrap().active_databases.len(), 2);
}

#[tokio::test]
async fn test_single_replica_read_retries_past_failure() {
    let group = LocalGroup::new();
    let cluster = test_cluster(&group, "node-1", &["db1", "db2"]).await;

    let invoker = ScriptedInvoker::new(vec![
        ("db1", Err(connection_error())),
        ("db2", Ok(Bytes::from_static(b"rows"))),
    ]);
    let results = cluster
        .invoke(InvocationStrategy::InvokeOnPrimary, invoker, Phase::Prepare)
        .await
        .unwrap();

    assert_eq!(results["db2"], Bytes::from_static(b"rows"));
    assert_eq!(cluster.health().await.unwrap().active_databases, vec!["db2"]);
}

#[tokio::test]
async fn test_redb_recovery_across_restart() {
    let data_dir = TempDir::new().unwrap();
    let make_config = || {
        ClusterConfig::builder("orders")
            .database(DatabaseConfig::new("db1", "postgres://host1/orders"))
            .database(DatabaseConfig::new("db2", "postgres://host2/orders"))
            .store(StateStoreKind::Redb)
            .data_dir(data_dir.path())
            .build()
            .unwrap()
    };

    let tx = uuid::Uuid::new_v4();
    {
        let group = LocalGroup::new();
        let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(group.dispatcher("node-1"));
        let cluster = DatabaseCluster::new(make_config(), dispatcher).unwrap();
        assert!(cluster.start().await.unwrap().is_empty());

        // Crash mid-fan-out: the invocation and one replica attempt hit the
        // log, but the operation never completes
        let event = InvocationEvent::new(tx, Phase::Commit, Default::default());
        cluster.state().before_invocation(&event).await.unwrap();
        cluster
            .state()
            .before_invoker(&InvokerEvent::new(tx, Phase::Commit, "db1".to_string()))
            .await
            .unwrap();

        // No after_invocation: simulate the crash by stopping cold
        cluster.stop().await;
    }

    let group = LocalGroup::new();
    let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(group.dispatcher("node-1"));
    let cluster = DatabaseCluster::new(make_config(), dispatcher).unwrap();

    let recovered = cluster.start().await.unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].invocation.tx_id, tx);
    assert_eq!(recovered[0].invocation.phase, Phase::Commit);
    assert_eq!(recovered[0].invokers.len(), 1);
    assert_eq!(recovered[0].invokers[0].database_id, "db1");
    assert!(recovered[0].invokers[0].outcome.is_none());

    // The embedding layer resolves it and clears the log
    cluster.state().after_invocation(tx, Phase::Commit).await.unwrap();
    cluster.stop().await;
}

#[tokio::test]
async fn test_active_set_survives_restart() {
    let data_dir = TempDir::new().unwrap();
    let make_config = || {
        ClusterConfig::builder("orders")
            .database(DatabaseConfig::new("db1", "postgres://host1/orders"))
            .database(DatabaseConfig::new("db2", "postgres://host2/orders"))
            .store(StateStoreKind::Redb)
            .data_dir(data_dir.path())
            .build()
            .unwrap()
    };

    {
        let group = LocalGroup::new();
        let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(group.dispatcher("node-1"));
        let cluster = DatabaseCluster::new(make_config(), dispatcher).unwrap();
        cluster.start().await.unwrap();
        cluster.deactivate(&"db2".to_string()).await.unwrap();
        cluster.stop().await;
    }

    let group = LocalGroup::new();
    let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(group.dispatcher("node-1"));
    let cluster = DatabaseCluster::new(make_config(), dispatcher).unwrap();
    cluster.start().await.unwrap();

    // db2 stays out until explicitly reactivated
    assert_eq!(cluster.health().await.unwrap().active_databases, vec!["db1"]);
    cluster.stop().await;
}

#[tokio::test]
async fn test_global_lock_is_mutually_exclusive_between_members() {
    let group = LocalGroup::new();
    let m1 = test_cluster(&group, "node-1", &["db1"]).await;
    let m2 = test_cluster(&group, "node-2", &["db1"]).await;

    m1.try_lock_global(Duration::from_millis(50)).await.unwrap();
    assert!(m2.try_lock_global(Duration::from_millis(50)).await.is_err());

    m1.unlock_global().await.unwrap();
    m2.try_lock_global(Duration::from_millis(50)).await.unwrap();
    m2.unlock_global().await.unwrap();
}

#[tokio::test]
async fn test_departed_member_locks_are_force_released() {
    let group = LocalGroup::new();
    let m1 = test_cluster(&group, "node-1", &["db1"]).await;
    let m2 = test_cluster(&group, "node-2", &["db1"]).await;

    m2.try_lock_global(Duration::from_millis(50)).await.unwrap();
    assert!(m1.try_lock_global(Duration::from_millis(50)).await.is_err());

    // node-2 departs without releasing
    m2.stop().await;
    m1.try_lock_global(Duration::from_millis(100)).await.unwrap();
}

#[tokio::test]
async fn test_deactivation_propagates_across_the_group() {
    let group = LocalGroup::new();
    let m1 = test_cluster(&group, "node-1", &["db1", "db2"]).await;
    let m2 = test_cluster(&group, "node-2", &["db1", "db2"]).await;

    m1.deactivate(&"db2".to_string()).await.unwrap();

    assert_eq!(m2.health().await.unwrap().active_databases, vec!["db1"]);
    assert_eq!(m2.state().active_databases().await.unwrap(), vec!["db1"]);
}

#[tokio::test]
async fn test_joining_member_adopts_group_state() {
    let group = LocalGroup::new();
    let m1 = test_cluster(&group, "node-1", &["db1", "db2"]).await;
    m1.deactivate(&"db2".to_string()).await.unwrap();

    // node-2 boots after the deactivation and converges via state transfer
    let m2 = test_cluster(&group, "node-2", &["db1", "db2"]).await;

    assert_eq!(m2.health().await.unwrap().active_databases, vec!["db1"]);

    let health = m2.health().await.unwrap();
    assert_eq!(health.coordinator, "node-1");
    assert_eq!(health.members, vec!["node-1", "node-2"]);
}
