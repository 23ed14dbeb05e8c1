//! Cluster error types

use crate::dialect::SqlError;
use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Configuration Errors ====================
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    // ==================== Routing Errors ====================
    #[error("no active databases")]
    NoActiveDatabases,

    // ==================== SQL Errors ====================
    /// An application-level SQL error classified as "not a replica
    /// failure". Propagated to the caller unchanged; no deactivation.
    #[error(transparent)]
    Sql(#[from] SqlError),

    // ==================== Coordination Errors ====================
    #[error("lock on '{resource}' not acquired within {timeout_ms}ms")]
    LockTimeout { resource: String, timeout_ms: u64 },

    #[error("lock on '{resource}' denied: {reason}")]
    LockDenied { resource: String, reason: String },

    #[error("command dispatch failed: {0}")]
    Dispatch(String),

    #[error("not started")]
    NotStarted,

    // ==================== Durability Errors ====================
    #[error("state storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    /// Whether this error is a coordination failure (lock contention or an
    /// exhausted active set) rather than a SQL-level outcome. Coordination
    /// failures are safe to retry once the cluster recovers.
    pub fn is_coordination(&self) -> bool {
        matches!(
            self,
            ClusterError::NoActiveDatabases
                | ClusterError::LockTimeout { .. }
                | ClusterError::LockDenied { .. }
                | ClusterError::Dispatch(_)
        )
    }
}
