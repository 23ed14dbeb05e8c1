//! Database descriptors

use serde::{Deserialize, Serialize};

/// Unique database identifier. Identifiers are totally ordered; ascending
/// order is the deterministic tie-break used during reconciliation.
pub type DatabaseId = String;

/// Credentials for authenticating against a backing database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

/// One independent backing database participating in the cluster.
///
/// Descriptors are created from configuration at cluster start and never
/// destroyed; a misbehaving database is deactivated (removed from the
/// balancer's active set), not dropped. Identity is immutable, weight may
/// be updated to re-shape routing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    /// Unique identifier, globally ordered across the cluster
    pub id: DatabaseId,

    /// Routing weight. A database with weight `w` occupies `w` slots in
    /// weighted balancer policies; weight 0 excludes it from weighted
    /// selection without deactivating it.
    pub weight: u64,

    /// Whether this database is co-located with the middleware process
    pub local: bool,

    /// Opaque connection source (URL, JNDI-style name, DSN). The proxy
    /// layer resolves it; this core only routes.
    pub location: String,

    /// Optional credentials
    pub credentials: Option<Credentials>,
}

impl Database {
    /// Create a new database descriptor with weight 1
    pub fn new(id: impl Into<DatabaseId>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            weight: 1,
            local: false,
            location: location.into(),
            credentials: None,
        }
    }

    /// Set the routing weight
    pub fn with_weight(mut self, weight: u64) -> Self {
        self.weight = weight;
        self
    }

    /// Mark the database as local to this process
    pub fn with_local(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Set credentials
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            user: user.into(),
            password: password.into(),
        });
        self
    }
}
