//! SQL exception classification
//!
//! The reconciliation algorithm needs two judgements about an exception
//! observed on a replica:
//!
//! - does it indicate the *replica* failed (connection refused, server gone
//!   away), as opposed to a normal SQL error the application caused?
//! - are two exceptions the "same" outcome, so that replicas which raised
//!   them agree with each other?
//!
//! Both judgements are vendor-specific, so they live behind the [`Dialect`]
//! trait with one implementation per supported vendor plus a conservative
//! generic fallback. Implementations must be deterministic and
//! side-effect-free; `same_outcome` must be a true equivalence relation.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::DialectKind;

/// A SQL-level error observed on one replica.
///
/// Carried as a value (not a trait object) so it can be compared, persisted
/// in the durability log, and shipped between middleware processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("sql error [code {code}, state {}]: {message}", .state.as_deref().unwrap_or("-"))]
pub struct SqlError {
    /// Vendor error code
    pub code: i32,
    /// SQLSTATE, when the driver reports one
    pub state: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl SqlError {
    pub fn new(code: i32, state: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code,
            state: state.map(str::to_string),
            message: message.into(),
        }
    }

    /// SQLSTATE class (first two characters), if any
    pub fn state_class(&self) -> Option<&str> {
        self.state.as_deref().and_then(|s| s.get(..2))
    }
}

/// Vendor-specific exception classifier
pub trait Dialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Whether the error indicates the replica itself failed. Failures
    /// trigger deactivation; anything else is propagated to the caller.
    fn indicates_failure(&self, error: &SqlError) -> bool;

    /// Whether two errors represent the same outcome. Replicas that raised
    /// equivalent errors agree with each other during reconciliation.
    fn same_outcome(&self, a: &SqlError, b: &SqlError) -> bool {
        a.code == b.code && a.state == b.state
    }

    /// Wrap an out-of-band cause (lost task, cancelled call) as a SqlError
    fn from_cause(&self, message: &str) -> SqlError;
}

/// Get the dialect implementation for a configured kind
pub fn dialect_for(kind: DialectKind) -> Arc<dyn Dialect> {
    match kind {
        DialectKind::Generic => Arc::new(GenericDialect),
        DialectKind::Postgres => Arc::new(PostgresDialect),
        DialectKind::MySql => Arc::new(MySqlDialect),
    }
}

// ===========================================================================
// Generic — SQLSTATE class 08 (connection exception) only
// ===========================================================================

/// Conservative fallback dialect: only standard connection-exception
/// SQLSTATEs count as replica failures.
#[derive(Debug, Clone, Default)]
pub struct GenericDialect;

impl Dialect for GenericDialect {
    fn name(&self) -> &'static str {
        "Generic"
    }

    fn indicates_failure(&self, error: &SqlError) -> bool {
        error.state_class() == Some("08")
    }

    fn from_cause(&self, message: &str) -> SqlError {
        SqlError::new(0, Some("08000"), message)
    }
}

// ===========================================================================
// PostgreSQL
// ===========================================================================

/// PostgreSQL dialect
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

/// SQLSTATEs beyond class 08 that mean the server is unusable:
/// insufficient resources, admin/crash shutdown, storage I/O failure.
const PG_FAILURE_STATES: &[&str] = &["53300", "57P01", "57P02", "57P03", "58030"];

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn indicates_failure(&self, error: &SqlError) -> bool {
        if error.state_class() == Some("08") {
            return true;
        }
        match error.state.as_deref() {
            Some(state) => PG_FAILURE_STATES.contains(&state),
            None => false,
        }
    }

    fn same_outcome(&self, a: &SqlError, b: &SqlError) -> bool {
        // Postgres drivers report outcomes by SQLSTATE; the numeric code is
        // usually zero and carries no signal.
        a.state == b.state
    }

    fn from_cause(&self, message: &str) -> SqlError {
        SqlError::new(0, Some("08006"), message)
    }
}

// ===========================================================================
// MySQL
// ===========================================================================

/// MySQL dialect
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

/// Server-side connection/availability error codes (1040 too many
/// connections, 1042/1043 bad handshake, 1053 shutdown in progress) and
/// client-side loss codes (2002/2003 cannot connect, 2006 server gone away,
/// 2013 lost connection during query).
const MYSQL_FAILURE_CODES: &[i32] = &[1040, 1042, 1043, 1053, 2002, 2003, 2006, 2013];

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "MySQL"
    }

    fn indicates_failure(&self, error: &SqlError) -> bool {
        error.state_class() == Some("08") || MYSQL_FAILURE_CODES.contains(&error.code)
    }

    fn from_cause(&self, message: &str) -> SqlError {
        SqlError::new(2013, Some("08S01"), message)
    }
}
