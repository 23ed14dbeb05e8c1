//! Cluster context
//!
//! [`DatabaseCluster`] wires the components together and owns their
//! lifecycle: the balancer over the active set, the dialect, the durable
//! state manager (distributed decorator over the configured store), the
//! distributed lock manager, and the invocation engine. One instance per
//! middleware process per cluster.
//!
//! `start` restores the persisted active set (first boot activates every
//! configured database), joins the dispatch group, and surfaces whatever
//! the durability log still holds from the previous run so the embedding
//! layer can finish or roll back interrupted operations.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::balancer::{create_balancer, Balancer};
use crate::config::{ClusterConfig, StateStoreKind};
use crate::coordination::{CoordinationHandler, DistributedLockManager, DistributedStateManager};
use crate::database::{Database, DatabaseId};
use crate::dialect::{dialect_for, Dialect};
use crate::dispatch::{CommandDispatcher, Member};
use crate::error::{ClusterError, Result};
use crate::invocation::{InvocationEngine, InvocationStrategy, Invoker, ResultMap};
use crate::lock::{LockGuard, GLOBAL_LOCK_RESOURCE};
use crate::state::redb_store::RedbStateManager;
use crate::state::{MemoryStateManager, Phase, RecoveredInvocation, StateManager};

/// Point-in-time view of the cluster from this member
#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub cluster_id: String,
    pub member: Member,
    pub coordinator: Member,
    pub members: Vec<Member>,
    pub active_databases: Vec<DatabaseId>,
    pub configured_databases: usize,
}

/// The cluster context: one per middleware process per replica set
pub struct DatabaseCluster {
    config: ClusterConfig,
    databases: Arc<DashMap<DatabaseId, Database>>,
    balancer: Arc<dyn Balancer>,
    dialect: Arc<dyn Dialect>,
    state: Arc<DistributedStateManager>,
    locks: Arc<DistributedLockManager>,
    engine: InvocationEngine,
    dispatcher: Arc<dyn CommandDispatcher>,
    started: AtomicBool,
}

impl DatabaseCluster {
    /// Build the cluster from its configuration and register its command
    /// handler on the (not yet started) dispatcher
    pub fn new(config: ClusterConfig, dispatcher: Arc<dyn CommandDispatcher>) -> Result<Self> {
        config.validate()?;

        let databases: Arc<DashMap<DatabaseId, Database>> = Arc::new(DashMap::new());
        for db_config in &config.databases {
            let mut db = Database::new(&db_config.id, &db_config.location)
                .with_weight(db_config.weight)
                .with_local(db_config.local);
            if let (Some(user), Some(password)) = (&db_config.user, &db_config.password) {
                db = db.with_credentials(user, password);
            }
            databases.insert(db.id.clone(), db);
        }

        let balancer = create_balancer(config.balancer);
        let dialect = dialect_for(config.dialect);

        let store: Arc<dyn StateManager> = match config.store {
            StateStoreKind::Memory => Arc::new(MemoryStateManager::new()),
            StateStoreKind::Redb => Arc::new(RedbStateManager::new(
                config.data_dir.join(&config.cluster_id),
                config.clear_local_state,
            )?),
        };

        let state = DistributedStateManager::new(
            store,
            dispatcher.clone(),
            balancer.clone(),
            databases.clone(),
        );
        let locks = DistributedLockManager::new(dispatcher.clone(), config.lock.clone());
        dispatcher.register(CoordinationHandler::new(locks.clone(), state.clone()));

        let engine = InvocationEngine::new(balancer.clone(), dialect.clone(), state.clone());

        Ok(Self {
            config,
            databases,
            balancer,
            dialect,
            state,
            locks,
            engine,
            dispatcher,
            started: AtomicBool::new(false),
        })
    }

    /// Start the cluster: open the durability log, join the dispatch group
    /// (importing the group's state snapshot), restore the active set, and
    /// return every invocation the log still holds from the previous run.
    ///
    /// The embedding layer decides per recovered invocation whether to
    /// replay, skip, or roll back, then clears it with
    /// [`StateManager::after_invocation`].
    pub async fn start(&self) -> Result<Vec<RecoveredInvocation>> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(Vec::new());
        }

        self.state.start().await?;
        self.dispatcher.start().await?;

        let persisted = self.state.active_databases().await?;
        if persisted.is_empty() {
            // First boot (or cleared state): every configured database
            // starts active
            let mut ids: Vec<DatabaseId> =
                self.databases.iter().map(|e| e.key().clone()).collect();
            ids.sort();
            for id in ids {
                self.activate(&id).await?;
            }
        } else {
            for id in persisted {
                match self.databases.get(&id) {
                    Some(db) => {
                        self.balancer.add(db.value().clone());
                    }
                    None => {
                        warn!(database = %id, "persisted active database is not configured, skipping")
                    }
                }
            }
        }

        let recovered = self.state.recover().await?;
        info!(
            cluster = %self.config.cluster_id,
            member = %self.dispatcher.local(),
            active = self.balancer.all().len(),
            recovered = recovered.len(),
            "cluster started"
        );
        Ok(recovered)
    }

    /// Stop the cluster: leave the dispatch group and close the durability
    /// log. Best-effort, never fails.
    pub async fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.dispatcher.stop().await;
        self.state.stop().await;
        info!(cluster = %self.config.cluster_id, "cluster stopped");
    }

    /// Execute one operation with the given strategy. See
    /// [`InvocationEngine::invoke`].
    pub async fn invoke(
        &self,
        strategy: InvocationStrategy,
        invoker: Arc<dyn Invoker>,
        phase: Phase,
    ) -> Result<ResultMap> {
        self.ensure_started()?;
        self.engine.invoke(strategy, invoker, phase).await
    }

    /// Return a configured database to the active set, persisting and
    /// propagating the change. Returns false if it was already active.
    pub async fn activate(&self, id: &DatabaseId) -> Result<bool> {
        let db = self
            .databases
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| ClusterError::UnknownDatabase(id.clone()))?;
        if !self.balancer.add(db) {
            return Ok(false);
        }
        self.state.activated(id).await?;
        info!(database = %id, "database activated");
        Ok(true)
    }

    /// Remove a database from the active set, persisting and propagating
    /// the change. Returns false if it was not active.
    pub async fn deactivate(&self, id: &DatabaseId) -> Result<bool> {
        if !self.databases.contains_key(id) {
            return Err(ClusterError::UnknownDatabase(id.clone()));
        }
        if !self.balancer.remove(id) {
            return Ok(false);
        }
        self.state.deactivated(id).await?;
        warn!(database = %id, "database deactivated");
        Ok(true)
    }

    /// Change a database's routing weight. Takes effect on the next
    /// balancer snapshot; an inactive database picks the weight up when it
    /// is re-activated.
    pub fn set_weight(&self, id: &DatabaseId, weight: u64) -> Result<()> {
        let updated = {
            let mut entry = self
                .databases
                .get_mut(id)
                .ok_or_else(|| ClusterError::UnknownDatabase(id.clone()))?;
            entry.weight = weight;
            entry.value().clone()
        };
        if self.balancer.remove(id) {
            self.balancer.add(updated);
        }
        info!(database = %id, weight, "database weight updated");
        Ok(())
    }

    /// Acquire the cluster-wide global write lock, blocking until granted.
    /// Serializes schema-altering operations across every member.
    pub async fn lock_global(&self) -> Result<()> {
        self.ensure_started()?;
        self.locks.lock_write(GLOBAL_LOCK_RESOURCE).await;
        Ok(())
    }

    /// Attempt the cluster-wide global write lock, refusing after `wait`
    pub async fn try_lock_global(&self, wait: Duration) -> Result<()> {
        self.ensure_started()?;
        self.locks.try_lock_write(GLOBAL_LOCK_RESOURCE, wait).await
    }

    /// Release the cluster-wide global write lock
    pub async fn unlock_global(&self) -> Result<()> {
        self.ensure_started()?;
        self.locks.unlock_write(GLOBAL_LOCK_RESOURCE).await
    }

    /// Process-local read lock on a resource (remote writers exclude local
    /// readers through this member's own lock table)
    pub async fn read_lock(&self, resource: &str) -> LockGuard {
        self.locks.read_lock(resource).await
    }

    /// Point-in-time cluster view from this member
    pub async fn health(&self) -> Result<ClusterHealth> {
        Ok(ClusterHealth {
            cluster_id: self.config.cluster_id.clone(),
            member: self.dispatcher.local(),
            coordinator: self.dispatcher.coordinator(),
            members: self.dispatcher.members(),
            active_databases: self
                .balancer
                .all()
                .iter()
                .map(|db| db.id.clone())
                .collect(),
            configured_databases: self.databases.len(),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn balancer(&self) -> &Arc<dyn Balancer> {
        &self.balancer
    }

    pub fn dialect(&self) -> &Arc<dyn Dialect> {
        &self.dialect
    }

    pub fn state(&self) -> &Arc<DistributedStateManager> {
        &self.state
    }

    pub fn dispatcher(&self) -> &Arc<dyn CommandDispatcher> {
        &self.dispatcher
    }

    fn ensure_started(&self) -> Result<()> {
        if self.started.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ClusterError::NotStarted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseConfig, LockConfig};
    use crate::dialect::SqlError;
    use crate::dispatch::LocalGroup;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;

    struct ScriptedInvoker {
        outcomes: HashMap<DatabaseId, std::result::Result<Bytes, SqlError>>,
    }

    impl ScriptedInvoker {
        fn new(entries: Vec<(&str, std::result::Result<Bytes, SqlError>)>) -> Arc<Self> {
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
        async fn invoke(&self, database: &Database) -> std::result::Result<Bytes, SqlError> {
            self.outcomes
                .get(&database.id)
                .cloned()
                .unwrap_or_else(|| Ok(Bytes::from_static(b"ok")))
        }
    }

    fn config(cluster_id: &str, ids: &[&str]) -> ClusterConfig {
        let mut builder = ClusterConfig::builder(cluster_id).lock(LockConfig {
            acquire_timeout: Duration::from_millis(100),
            retry_interval: Duration::from_millis(10),
        });
        for id in ids {
            builder = builder.database(DatabaseConfig::new(*id, format!("postgres://{}/app", id)));
        }
        builder.build().unwrap()
    }

    async fn cluster(group: &Arc<LocalGroup>, member: &str, ids: &[&str]) -> DatabaseCluster {
        let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(group.dispatcher(member));
        let cluster = DatabaseCluster::new(config("test", ids), dispatcher).unwrap();
        cluster.start().await.unwrap();
        cluster
    }

    #[tokio::test]
    async fn test_first_boot_activates_all_configured() {
        let group = LocalGroup::new();
        let cluster = cluster(&group, "m1", &["db1", "db2"]).await;

        let health = cluster.health().await.unwrap();
        assert_eq!(health.active_databases, vec!["db1", "db2"]);
        assert_eq!(health.coordinator, "m1");
        assert_eq!(cluster.state.active_databases().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invoke_before_start_is_refused() {
        let group = LocalGroup::new();
        let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(group.dispatcher("m1"));
        let cluster = DatabaseCluster::new(config("test", &["db1"]), dispatcher).unwrap();

        let outcome = cluster
            .invoke(
                InvocationStrategy::InvokeOnNext,
                ScriptedInvoker::new(vec![]),
                Phase::Prepare,
            )
            .await;
        assert!(matches!(outcome, Err(ClusterError::NotStarted)));
    }

    #[tokio::test]
    async fn test_fan_out_through_cluster_demotes_divergent_replica() {
        let group = LocalGroup::new();
        let cluster = cluster(&group, "m1", &["db1", "db2"]).await;
        let invoker = ScriptedInvoker::new(vec![(
            "db2",
            Err(SqlError::new(0, Some("23505"), "duplicate key")),
        )]);

        let results = cluster
            .invoke(InvocationStrategy::InvokeOnAll, invoker, Phase::Prepare)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results.contains_key("db1"));
        assert_eq!(
            cluster.state.active_databases().await.unwrap(),
            vec!["db1"]
        );
    }

    #[tokio::test]
    async fn test_deactivate_and_activate_round_trip() {
        let group = LocalGroup::new();
        let cluster = cluster(&group, "m1", &["db1", "db2"]).await;

        assert!(cluster.deactivate(&"db2".to_string()).await.unwrap());
        assert!(!cluster.deactivate(&"db2".to_string()).await.unwrap());
        assert_eq!(
            cluster.health().await.unwrap().active_databases,
            vec!["db1"]
        );

        assert!(cluster.activate(&"db2".to_string()).await.unwrap());
        assert!(!cluster.activate(&"db2".to_string()).await.unwrap());
        assert_eq!(
            cluster.health().await.unwrap().active_databases,
            vec!["db1", "db2"]
        );
    }

    #[tokio::test]
    async fn test_activate_unknown_database_is_an_error() {
        let group = LocalGroup::new();
        let cluster = cluster(&group, "m1", &["db1"]).await;

        let outcome = cluster.activate(&"nope".to_string()).await;
        assert!(matches!(outcome, Err(ClusterError::UnknownDatabase(_))));
    }

    #[tokio::test]
    async fn test_deactivation_propagates_between_members() {
        let group = LocalGroup::new();
        let m1 = cluster(&group, "m1", &["db1", "db2"]).await;
        let m2 = cluster(&group, "m2", &["db1", "db2"]).await;

        m1.deactivate(&"db2".to_string()).await.unwrap();

        assert_eq!(m2.health().await.unwrap().active_databases, vec!["db1"]);
        assert_eq!(m2.state.active_databases().await.unwrap(), vec!["db1"]);
    }

    #[tokio::test]
    async fn test_set_weight_reshapes_routing() {
        let group = LocalGroup::new();
        let cluster = cluster(&group, "m1", &["db1", "db2"]).await;

        fn weight_of(cluster: &DatabaseCluster, id: &str) -> u64 {
            cluster
                .balancer()
                .all()
                .iter()
                .find(|db| db.id == id)
                .unwrap()
                .weight
        }

        cluster.set_weight(&"db2".to_string(), 3).unwrap();
        assert_eq!(weight_of(&cluster, "db2"), 3);

        // An inactive database keeps the new weight for its next activation
        cluster.deactivate(&"db1".to_string()).await.unwrap();
        cluster.set_weight(&"db1".to_string(), 5).unwrap();
        cluster.activate(&"db1".to_string()).await.unwrap();
        assert_eq!(weight_of(&cluster, "db1"), 5);

        let outcome = cluster.set_weight(&"nope".to_string(), 2);
        assert!(matches!(outcome, Err(ClusterError::UnknownDatabase(_))));
    }

    #[tokio::test]
    async fn test_global_lock_excludes_other_members() {
        let group = LocalGroup::new();
        let m1 = cluster(&group, "m1", &["db1"]).await;
        let m2 = cluster(&group, "m2", &["db1"]).await;

        m1.try_lock_global(Duration::from_millis(50)).await.unwrap();
        assert!(m2.try_lock_global(Duration::from_millis(50)).await.is_err());

        m1.unlock_global().await.unwrap();
        m2.try_lock_global(Duration::from_millis(50)).await.unwrap();
        m2.unlock_global().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let group = LocalGroup::new();
        let cluster = cluster(&group, "m1", &["db1"]).await;

        assert!(cluster.start().await.unwrap().is_empty());
        assert_eq!(cluster.health().await.unwrap().active_databases, vec!["db1"]);
    }

    #[tokio::test]
    async fn test_joining_member_adopts_active_set() {
        let group = LocalGroup::new();
        let m1 = cluster(&group, "m1", &["db1", "db2"]).await;
        m1.deactivate(&"db2".to_string()).await.unwrap();

        // m2 boots later; the snapshot import marks db1 active before its
        // own first-boot seeding runs, so db2 stays out
        let m2 = cluster(&group, "m2", &["db1", "db2"]).await;

        assert_eq!(m2.state.active_databases().await.unwrap(), vec!["db1"]);
        assert_eq!(m2.health().await.unwrap().active_databases, vec!["db1"]);
    }
}
