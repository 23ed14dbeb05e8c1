//! # Shoal Cluster
//!
//! Replica coordination for database-clustering middleware:
//! - **Balancer**: read routing over the active replica set (simple,
//!   random, round-robin, load)
//! - **Invocation Engine**: single- or multi-replica execution with
//!   deterministic outcome reconciliation and automatic demotion of
//!   divergent replicas
//! - **Durability Log**: redb-backed record of in-flight multi-replica
//!   invocations for crash recovery
//! - **Distributed Coordination**: cluster-wide locks and state
//!   propagation over a pluggable command-dispatch boundary
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     DatabaseCluster                         │
//! ├──────────────┬──────────────┬───────────────────────────────┤
//! │   Balancer   │  Invocation  │      Coordination             │
//! │  Active set  │    Engine    │      (distributed)            │
//! ├──────────────┼──────────────┼───────────────────────────────┤
//! │ • Policies   │ • Strategies │ • Lock manager                │
//! │ • COW set    │ • Reconcile  │ • State propagation           │
//! │ • Primary    │ • Demotion   │ • Join state transfer         │
//! ├──────────────┴──────────────┴───────────────────────────────┤
//! │          StateManager (memory / redb durability log)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │        CommandDispatcher (LocalGroup / external group)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Deployment Modes
//!
//! - **Standalone**: single process over a [`LocalGroup`] dispatcher
//! - **Group**: multiple middleware processes fronting the same replica
//!   set, coordinating through an external group-communication service
//!   implementing [`CommandDispatcher`]
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use shoal_cluster::{
//!     ClusterConfig, DatabaseCluster, DatabaseConfig, InvocationStrategy, LocalGroup, Phase,
//! };
//!
//! let config = ClusterConfig::builder("accounts")
//!     .database(DatabaseConfig::new("db1", "postgres://host1/app"))
//!     .database(DatabaseConfig::new("db2", "postgres://host2/app"))
//!     .build()?;
//!
//! let group = LocalGroup::new();
//! let cluster = DatabaseCluster::new(config, Arc::new(group.dispatcher("node-1")))?;
//!
//! // Recovered invocations are whatever the last run left in flight
//! let recovered = cluster.start().await?;
//!
//! // Writes fan out to every active replica; reads hit one
//! let results = cluster
//!     .invoke(InvocationStrategy::InvokeOnAll, invoker, Phase::Prepare)
//!     .await?;
//! ```

pub mod balancer;
pub mod cluster;
pub mod config;
pub mod coordination;
pub mod database;
pub mod dialect;
pub mod dispatch;
pub mod error;
pub mod invocation;
pub mod lock;
pub mod state;

// Re-export main types
pub use balancer::{
    create_balancer, Balancer, LoadBalancer, RandomBalancer, RoundRobinBalancer, SimpleBalancer,
};
pub use cluster::{ClusterHealth, DatabaseCluster};
pub use config::{
    BalancerPolicy, ClusterConfig, ClusterConfigBuilder, DatabaseConfig, DialectKind, LockConfig,
    StateStoreKind,
};
pub use coordination::{CoordinationHandler, DistributedLockManager, DistributedStateManager};
pub use database::{Credentials, Database, DatabaseId};
pub use dialect::{
    dialect_for, Dialect, GenericDialect, MySqlDialect, PostgresDialect, SqlError,
};
pub use dispatch::{
    Command, CommandDispatcher, CommandHandler, CommandResponse, LocalDispatcher, LocalGroup,
    Member,
};
pub use error::{ClusterError, Result};
pub use invocation::{InvocationEngine, InvocationStrategy, Invoker, ResultMap};
pub use lock::{LockDescriptor, LockGuard, LockManager, LockMode, GLOBAL_LOCK_RESOURCE};
pub use state::redb_store::RedbStateManager;
pub use state::{
    ExceptionKind, InvocationEvent, InvokerEvent, InvokerOutcome, MemoryStateManager, Phase,
    RecoveredInvocation, StateManager, TransactionId,
};

/// Re-export common types
pub mod prelude {
    pub use crate::cluster::*;
    pub use crate::config::*;
    pub use crate::database::*;
    pub use crate::dialect::SqlError;
    pub use crate::dispatch::{CommandDispatcher, LocalGroup};
    pub use crate::error::*;
    pub use crate::invocation::{InvocationStrategy, Invoker, ResultMap};
    pub use crate::state::{Phase, RecoveredInvocation};
}
