//! Cluster configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ClusterError, Result};

/// Balancer routing policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BalancerPolicy {
    /// Always route to the highest-weight active database
    Simple,
    /// Weighted random selection
    Random,
    /// Weighted circular queue (default)
    #[default]
    RoundRobin,
    /// Route to the database minimizing in-flight load / weight
    Load,
}

/// SQL dialect used to classify replica exceptions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    /// SQLSTATE class 08 only (conservative fallback)
    #[default]
    Generic,
    Postgres,
    MySql,
}

/// Backing store for the durability log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateStoreKind {
    /// In-memory log; recovery does not survive a process restart.
    /// Intended for tests and ephemeral deployments.
    Memory,
    /// redb-backed embedded store (default)
    #[default]
    Redb,
}

/// Distributed lock tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long a single acquisition attempt may wait before it is refused
    pub acquire_timeout: Duration,

    /// Pause between attempts when blocking in `lock()`
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Configuration for one backing database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Unique identifier
    pub id: String,

    /// Routing weight
    pub weight: u64,

    /// Whether the database is co-located with this process
    pub local: bool,

    /// Opaque connection source
    pub location: String,

    /// Optional credentials
    pub user: Option<String>,
    pub password: Option<String>,
}

impl DatabaseConfig {
    pub fn new(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            weight: 1,
            local: false,
            location: location.into(),
            user: None,
            password: None,
        }
    }

    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster identifier (shared by every middleware process fronting the
    /// same physical replica set)
    pub cluster_id: String,

    /// Backing databases, created at start and never destroyed
    pub databases: Vec<DatabaseConfig>,

    /// Read-routing policy
    pub balancer: BalancerPolicy,

    /// Exception classification dialect
    pub dialect: DialectKind,

    /// Durability log backend
    pub store: StateStoreKind,

    /// Data directory for the durability log
    pub data_dir: PathBuf,

    /// Discard any persisted active-set and in-flight invocation state at
    /// start instead of restoring it
    pub clear_local_state: bool,

    /// Distributed lock tuning
    pub lock: LockConfig,
}

impl ClusterConfig {
    /// Create a minimal in-memory configuration (tests, ephemeral use)
    pub fn standalone(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            databases: vec![],
            balancer: BalancerPolicy::default(),
            dialect: DialectKind::default(),
            store: StateStoreKind::Memory,
            data_dir: PathBuf::from("./data"),
            clear_local_state: false,
            lock: LockConfig::default(),
        }
    }

    /// Create a configuration builder
    pub fn builder(cluster_id: impl Into<String>) -> ClusterConfigBuilder {
        ClusterConfigBuilder {
            config: Self::standalone(cluster_id),
        }
    }

    /// Validate invariants that cannot be expressed in the type system
    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.is_empty() {
            return Err(ClusterError::InvalidConfig("empty cluster id".into()));
        }
        if self.databases.is_empty() {
            return Err(ClusterError::InvalidConfig("no databases configured".into()));
        }
        for (i, db) in self.databases.iter().enumerate() {
            if db.id.is_empty() {
                return Err(ClusterError::InvalidConfig(format!(
                    "database #{} has an empty id",
                    i
                )));
            }
            if self.databases[..i].iter().any(|other| other.id == db.id) {
                return Err(ClusterError::InvalidConfig(format!(
                    "duplicate database id: {}",
                    db.id
                )));
            }
        }
        Ok(())
    }
}

/// Builder for cluster configuration
#[derive(Debug)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    pub fn database(mut self, db: DatabaseConfig) -> Self {
        self.config.databases.push(db);
        self
    }

    pub fn balancer(mut self, policy: BalancerPolicy) -> Self {
        self.config.balancer = policy;
        self
    }

    pub fn dialect(mut self, dialect: DialectKind) -> Self {
        self.config.dialect = dialect;
        self
    }

    pub fn store(mut self, store: StateStoreKind) -> Self {
        self.config.store = store;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn clear_local_state(mut self, clear: bool) -> Self {
        self.config.clear_local_state = clear;
        self
    }

    pub fn lock(mut self, lock: LockConfig) -> Self {
        self.config.lock = lock;
        self
    }

    pub fn build(self) -> Result<ClusterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_validates_duplicates() {
        let result = ClusterConfig::builder("test")
            .database(DatabaseConfig::new("db1", "h1"))
            .database(DatabaseConfig::new("db1", "h2"))
            .build();

        assert!(matches!(result, Err(ClusterError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_requires_databases() {
        let result = ClusterConfig::builder("test").build();
        assert!(matches!(result, Err(ClusterError::InvalidConfig(_))));
    }

    #[test]
    fn test_builder_ok() {
        let config = ClusterConfig::builder("test")
            .database(DatabaseConfig::new("db1", "h1").with_weight(2))
            .database(DatabaseConfig::new("db2", "h2"))
            .balancer(BalancerPolicy::Load)
            .build()
            .unwrap();

        assert_eq!(config.databases.len(), 2);
        assert_eq!(config.balancer, BalancerPolicy::Load);
        assert_eq!(config.store, StateStoreKind::Memory);
    }
}
