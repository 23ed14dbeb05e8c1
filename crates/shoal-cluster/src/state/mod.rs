//! Durable cluster state
//!
//! The state manager is an append/delete log of in-flight multi-replica
//! invocations plus a table of currently-active database ids. The invocation
//! engine fires a durability event at every transition (before/after the
//! whole invocation, before/after each per-replica attempt) *before* the
//! call proceeds, so a crash mid-fan-out is always recoverable:
//!
//! - `before_invocation` inserts an invocation row
//! - `before_invoker` / `after_invoker` insert / complete a per-replica row
//! - `after_invocation` deletes every row for the (transaction, phase) —
//!   successful completion clears the log
//!
//! `recover()` at startup returns whatever is still on disk: each entry is
//! an operation that was in flight when the process last stopped, with the
//! per-replica rows telling exactly which replicas finished their local
//! effect.
//!
//! Storage is pluggable behind the [`StateManager`] contract:
//! [`MemoryStateManager`] here and the redb-backed store in
//! [`redb_store`](crate::state::redb_store). The log schema is identical
//! across implementations.

pub mod redb_store;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::database::DatabaseId;
use crate::dialect::SqlError;
use crate::error::Result;

/// Identifier of one logical distributed operation. Unique per operation
/// spanning replicas non-atomically.
pub type TransactionId = Uuid;

/// Durability phase of a distributed operation
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Prepare,
    Commit,
    Rollback,
    Forget,
}

impl Phase {
    /// Stable storage encoding
    pub(crate) fn code(self) -> u8 {
        match self {
            Phase::Prepare => 0,
            Phase::Commit => 1,
            Phase::Rollback => 2,
            Phase::Forget => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Phase::Prepare),
            1 => Some(Phase::Commit),
            2 => Some(Phase::Rollback),
            3 => Some(Phase::Forget),
            _ => None,
        }
    }
}

/// Kind of exception an invocation surfaces when it fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionKind {
    /// SQL-level outcome, reconciled by the dialect
    #[default]
    Sql,
    /// Coordination-level failure (locks, dispatch)
    Cluster,
}

/// Durable record of one logical distributed operation.
///
/// Created when fan-out begins; removed only when the operation reaches a
/// terminal, fully-reconciled outcome (or is explicitly abandoned during
/// recovery).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationEvent {
    pub tx_id: TransactionId,
    pub phase: Phase,
    pub exception_kind: ExceptionKind,
}

impl InvocationEvent {
    pub fn new(tx_id: TransactionId, phase: Phase, exception_kind: ExceptionKind) -> Self {
        Self {
            tx_id,
            phase,
            exception_kind,
        }
    }
}

/// Terminal outcome of one replica's attempt, persisted as the invoker
/// row's payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvokerOutcome {
    /// Opaque result bytes returned by the invoker
    Success(Vec<u8>),
    /// The SQL error the replica raised
    Error(SqlError),
}

/// Durable record of one replica's attempt within an invocation.
///
/// Created before the per-replica call (`outcome` empty), completed after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokerEvent {
    pub tx_id: TransactionId,
    pub phase: Phase,
    pub database_id: DatabaseId,
    pub outcome: Option<InvokerOutcome>,
}

impl InvokerEvent {
    pub fn new(tx_id: TransactionId, phase: Phase, database_id: DatabaseId) -> Self {
        Self {
            tx_id,
            phase,
            database_id,
            outcome: None,
        }
    }
}

/// One dangling invocation returned by `recover()`: the invocation row plus
/// every per-replica row recorded for it. The durability subsystem decides,
/// per database, whether to replay, skip, or roll back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredInvocation {
    pub invocation: InvocationEvent,
    pub invokers: Vec<InvokerEvent>,
}

/// Durable log of the active-replica set and in-flight invocations.
///
/// Every mutating operation executes inside one local transaction per call;
/// callers must not assume atomicity across calls. A failed commit is
/// reported as an error, never silently dropped.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Open storage and create missing tables. Idempotent; never clobbers
    /// existing rows unless the implementation was configured to clear
    /// local state.
    async fn start(&self) -> Result<()>;

    /// Release storage. Best-effort, never fails.
    async fn stop(&self);

    /// Ids currently persisted as active
    async fn active_databases(&self) -> Result<Vec<DatabaseId>>;

    /// Record a database activation
    async fn activated(&self, id: &DatabaseId) -> Result<()>;

    /// Record a database deactivation
    async fn deactivated(&self, id: &DatabaseId) -> Result<()>;

    /// Insert the invocation row before fan-out starts. Re-recording the
    /// same (transaction, phase) updates the exception kind and leaves the
    /// invoker rows untouched.
    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()>;

    /// Delete the invocation row and any remaining invoker rows for the
    /// (transaction, phase)
    async fn after_invocation(&self, tx_id: TransactionId, phase: Phase) -> Result<()>;

    /// Insert a per-replica row before the replica call
    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()>;

    /// Complete a per-replica row with its terminal outcome
    async fn after_invoker(
        &self,
        tx_id: TransactionId,
        phase: Phase,
        database_id: &DatabaseId,
        outcome: &InvokerOutcome,
    ) -> Result<()>;

    /// Load every invocation still on disk together with its invoker rows.
    /// Called once at startup.
    async fn recover(&self) -> Result<Vec<RecoveredInvocation>>;
}

// ===========================================================================
// In-memory implementation
// ===========================================================================

struct InvocationRecord {
    event: InvocationEvent,
    invokers: BTreeMap<DatabaseId, InvokerEvent>,
}

/// In-memory state manager. Recovery does not survive a process restart;
/// intended for tests and ephemeral deployments.
#[derive(Default)]
pub struct MemoryStateManager {
    active: RwLock<BTreeSet<DatabaseId>>,
    invocations: RwLock<BTreeMap<(TransactionId, Phase), InvocationRecord>>,
}

impl MemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateManager for MemoryStateManager {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn active_databases(&self) -> Result<Vec<DatabaseId>> {
        Ok(self.active.read().iter().cloned().collect())
    }

    async fn activated(&self, id: &DatabaseId) -> Result<()> {
        self.active.write().insert(id.clone());
        Ok(())
    }

    async fn deactivated(&self, id: &DatabaseId) -> Result<()> {
        self.active.write().remove(id);
        Ok(())
    }

    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()> {
        match self.invocations.write().entry((event.tx_id, event.phase)) {
            std::collections::btree_map::Entry::Occupied(mut occupied) => {
                occupied.get_mut().event = event.clone();
            }
            std::collections::btree_map::Entry::Vacant(vacant) => {
                vacant.insert(InvocationRecord {
                    event: event.clone(),
                    invokers: BTreeMap::new(),
                });
            }
        }
        Ok(())
    }

    async fn after_invocation(&self, tx_id: TransactionId, phase: Phase) -> Result<()> {
        self.invocations.write().remove(&(tx_id, phase));
        Ok(())
    }

    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()> {
        if let Some(record) = self
            .invocations
            .write()
            .get_mut(&(event.tx_id, event.phase))
        {
            record
                .invokers
                .insert(event.database_id.clone(), event.clone());
        }
        Ok(())
    }

    async fn after_invoker(
        &self,
        tx_id: TransactionId,
        phase: Phase,
        database_id: &DatabaseId,
        outcome: &InvokerOutcome,
    ) -> Result<()> {
        if let Some(record) = self.invocations.write().get_mut(&(tx_id, phase)) {
            if let Some(invoker) = record.invokers.get_mut(database_id) {
                invoker.outcome = Some(outcome.clone());
            }
        }
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<RecoveredInvocation>> {
        Ok(self
            .invocations
            .read()
            .values()
            .map(|record| RecoveredInvocation {
                invocation: record.event.clone(),
                invokers: record.invokers.values().cloned().collect(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_active_set_round_trip() {
        let state = MemoryStateManager::new();

        state.activated(&"db1".to_string()).await.unwrap();
        state.activated(&"db2".to_string()).await.unwrap();
        state.deactivated(&"db1".to_string()).await.unwrap();

        assert_eq!(state.active_databases().await.unwrap(), vec!["db2"]);
    }

    #[tokio::test]
    async fn test_invocation_log_round_trip() {
        let state = MemoryStateManager::new();
        let tx = Uuid::new_v4();

        let invocation = InvocationEvent::new(tx, Phase::Prepare, ExceptionKind::Sql);
        state.before_invocation(&invocation).await.unwrap();

        let invoker = InvokerEvent::new(tx, Phase::Prepare, "db1".to_string());
        state.before_invoker(&invoker).await.unwrap();
        state
            .after_invoker(
                tx,
                Phase::Prepare,
                &"db1".to_string(),
                &InvokerOutcome::Success(b"ok".to_vec()),
            )
            .await
            .unwrap();

        let recovered = state.recover().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].invocation, invocation);
        assert_eq!(recovered[0].invokers.len(), 1);
        assert_eq!(
            recovered[0].invokers[0].outcome,
            Some(InvokerOutcome::Success(b"ok".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_rerecording_updates_kind_and_keeps_invoker_rows() {
        let state = MemoryStateManager::new();
        let tx = Uuid::new_v4();

        state
            .before_invocation(&InvocationEvent::new(tx, Phase::Prepare, ExceptionKind::Sql))
            .await
            .unwrap();
        state
            .before_invoker(&InvokerEvent::new(tx, Phase::Prepare, "db1".to_string()))
            .await
            .unwrap();

        state
            .before_invocation(&InvocationEvent::new(
                tx,
                Phase::Prepare,
                ExceptionKind::Cluster,
            ))
            .await
            .unwrap();

        let recovered = state.recover().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].invocation.exception_kind, ExceptionKind::Cluster);
        assert_eq!(recovered[0].invokers.len(), 1);
    }

    #[tokio::test]
    async fn test_after_invocation_clears_all_rows() {
        let state = MemoryStateManager::new();
        let tx = Uuid::new_v4();

        state
            .before_invocation(&InvocationEvent::new(tx, Phase::Prepare, ExceptionKind::Sql))
            .await
            .unwrap();
        state
            .before_invoker(&InvokerEvent::new(tx, Phase::Prepare, "db1".to_string()))
            .await
            .unwrap();

        state.after_invocation(tx, Phase::Prepare).await.unwrap();

        assert!(state.recover().await.unwrap().is_empty());
    }

    #[test]
    fn test_phase_codes_round_trip() {
        for phase in [Phase::Prepare, Phase::Commit, Phase::Rollback, Phase::Forget] {
            assert_eq!(Phase::from_code(phase.code()), Some(phase));
        }
        assert_eq!(Phase::from_code(9), None);
    }
}
