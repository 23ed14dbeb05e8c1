//! redb-based durability log
//!
//! Pure Rust implementation using redb - zero C dependencies, compiles
//! cleanly for all targets including musl.
//!
//! Schema (identical to the in-memory implementation's logical model):
//! - `cluster_state(database_id)` — active database ids
//! - `cluster_invocation((tx, phase) -> exception kind)` — in-flight
//!   invocations
//! - `cluster_invoker((tx, phase, database_id) -> outcome)` — per-replica
//!   attempts; the outcome payload is empty until the replica call
//!   completes
//!
//! Every mutating call runs in one redb write transaction. Commit failures
//! surface as [`ClusterError::Storage`] so the invocation engine can log
//! them without dropping the in-flight operation.

use async_trait::async_trait;
use redb::{Database as RedbDatabase, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::database::DatabaseId;
use crate::error::{ClusterError, Result};
use crate::state::{
    ExceptionKind, InvocationEvent, InvokerEvent, InvokerOutcome, Phase, RecoveredInvocation,
    StateManager, TransactionId,
};

/// Table of active database ids (key: database id, value: empty)
const STATE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_state");

/// Table of in-flight invocations (key: (tx, phase), value: serialized
/// exception kind)
const INVOCATION_TABLE: TableDefinition<(u128, u8), &[u8]> =
    TableDefinition::new("cluster_invocation");

/// Table of per-replica attempts (key: (tx, phase, database id), value:
/// serialized outcome, empty until the call completes)
const INVOKER_TABLE: TableDefinition<(u128, u8, &str), &[u8]> =
    TableDefinition::new("cluster_invoker");

fn storage_err(e: impl std::fmt::Display) -> ClusterError {
    ClusterError::Storage(e.to_string())
}

/// redb-backed state manager
pub struct RedbStateManager {
    db: RedbDatabase,
    path: PathBuf,
    /// Discard persisted rows on first start
    clear_on_start: bool,
    started: AtomicBool,
}

impl RedbStateManager {
    /// Open (or create) the durability log at `data_dir`.
    ///
    /// Creates the directory if it doesn't exist. Tables are created by
    /// [`StateManager::start`], which never clobbers existing rows unless
    /// `clear_on_start` is set.
    pub fn new(data_dir: impl AsRef<Path>, clear_on_start: bool) -> Result<Self> {
        let dir = data_dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| ClusterError::Storage(format!("failed to create {:?}: {}", dir, e)))?;

        let path = dir.join("cluster-state.redb");
        let db = RedbDatabase::create(&path)
            .map_err(|e| ClusterError::Storage(format!("failed to open {:?}: {}", path, e)))?;

        Ok(Self {
            db,
            path,
            clear_on_start,
            started: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl StateManager for RedbStateManager {
    async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let txn = self.db.begin_write().map_err(storage_err)?;
        if self.clear_on_start {
            info!(path = ?self.path, "clearing persisted cluster state");
            txn.delete_table(STATE_TABLE).map_err(storage_err)?;
            txn.delete_table(INVOCATION_TABLE).map_err(storage_err)?;
            txn.delete_table(INVOKER_TABLE).map_err(storage_err)?;
        }
        // open_table creates missing tables without touching existing rows
        txn.open_table(STATE_TABLE).map_err(storage_err)?;
        txn.open_table(INVOCATION_TABLE).map_err(storage_err)?;
        txn.open_table(INVOKER_TABLE).map_err(storage_err)?;
        txn.commit().map_err(storage_err)?;

        debug!(path = ?self.path, "durability log ready");
        Ok(())
    }

    async fn stop(&self) {
        // redb flushes on drop; nothing to tear down
        debug!(path = ?self.path, "durability log closed");
    }

    async fn active_databases(&self) -> Result<Vec<DatabaseId>> {
        let txn = self.db.begin_read().map_err(storage_err)?;
        let table = match txn.open_table(STATE_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(vec![]),
            Err(e) => return Err(storage_err(e)),
        };

        let mut ids = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (key, _) = entry.map_err(storage_err)?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }

    async fn activated(&self, id: &DatabaseId) -> Result<()> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(STATE_TABLE).map_err(storage_err)?;
            table
                .insert(id.as_str(), [].as_slice())
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)
    }

    async fn deactivated(&self, id: &DatabaseId) -> Result<()> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(STATE_TABLE).map_err(storage_err)?;
            table.remove(id.as_str()).map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)
    }

    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()> {
        let value = serde_json::to_vec(&event.exception_kind)?;
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(INVOCATION_TABLE).map_err(storage_err)?;
            table
                .insert(
                    (event.tx_id.as_u128(), event.phase.code()),
                    value.as_slice(),
                )
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)
    }

    async fn after_invocation(&self, tx_id: TransactionId, phase: Phase) -> Result<()> {
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut invocations = txn.open_table(INVOCATION_TABLE).map_err(storage_err)?;
            invocations
                .remove((tx_id.as_u128(), phase.code()))
                .map_err(storage_err)?;

            let mut invokers = txn.open_table(INVOKER_TABLE).map_err(storage_err)?;
            // The table only ever holds in-flight operations, so a full scan
            // is a handful of rows
            let mut stale: Vec<(u128, u8, String)> = Vec::new();
            for entry in invokers.iter().map_err(storage_err)? {
                let (key, _) = entry.map_err(storage_err)?;
                let (tx, phase_code, database_id) = key.value();
                if tx == tx_id.as_u128() && phase_code == phase.code() {
                    stale.push((tx, phase_code, database_id.to_string()));
                }
            }
            for (tx, phase_code, database_id) in stale {
                invokers
                    .remove((tx, phase_code, database_id.as_str()))
                    .map_err(storage_err)?;
            }
        }
        txn.commit().map_err(storage_err)
    }

    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()> {
        let value = serde_json::to_vec(&event.outcome)?;
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(INVOKER_TABLE).map_err(storage_err)?;
            table
                .insert(
                    (
                        event.tx_id.as_u128(),
                        event.phase.code(),
                        event.database_id.as_str(),
                    ),
                    value.as_slice(),
                )
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)
    }

    async fn after_invoker(
        &self,
        tx_id: TransactionId,
        phase: Phase,
        database_id: &DatabaseId,
        outcome: &InvokerOutcome,
    ) -> Result<()> {
        let value = serde_json::to_vec(&Some(outcome.clone()))?;
        let txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut table = txn.open_table(INVOKER_TABLE).map_err(storage_err)?;
            table
                .insert(
                    (tx_id.as_u128(), phase.code(), database_id.as_str()),
                    value.as_slice(),
                )
                .map_err(storage_err)?;
        }
        txn.commit().map_err(storage_err)
    }

    async fn recover(&self) -> Result<Vec<RecoveredInvocation>> {
        let txn = self.db.begin_read().map_err(storage_err)?;

        let invocations = match txn.open_table(INVOCATION_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(vec![]),
            Err(e) => return Err(storage_err(e)),
        };

        let mut recovered: BTreeMap<(u128, u8), RecoveredInvocation> = BTreeMap::new();
        for entry in invocations.iter().map_err(storage_err)? {
            let (key, value) = entry.map_err(storage_err)?;
            let (tx, phase_code) = key.value();
            let Some(phase) = Phase::from_code(phase_code) else {
                warn!(tx = %Uuid::from_u128(tx), phase_code, "skipping invocation row with unknown phase");
                continue;
            };
            let exception_kind: ExceptionKind = serde_json::from_slice(value.value())?;
            recovered.insert(
                (tx, phase_code),
                RecoveredInvocation {
                    invocation: InvocationEvent::new(Uuid::from_u128(tx), phase, exception_kind),
                    invokers: Vec::new(),
                },
            );
        }

        let invokers = match txn.open_table(INVOKER_TABLE) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => {
                return Ok(recovered.into_values().collect())
            }
            Err(e) => return Err(storage_err(e)),
        };

        for entry in invokers.iter().map_err(storage_err)? {
            let (key, value) = entry.map_err(storage_err)?;
            let (tx, phase_code, database_id) = key.value();
            let Some(record) = recovered.get_mut(&(tx, phase_code)) else {
                // Invoker rows are only written under an invocation row;
                // anything else is debris from a failed cleanup
                warn!(tx = %Uuid::from_u128(tx), database_id, "orphaned invoker row");
                continue;
            };
            let outcome: Option<InvokerOutcome> = serde_json::from_slice(value.value())?;
            record.invokers.push(InvokerEvent {
                tx_id: Uuid::from_u128(tx),
                phase: record.invocation.phase,
                database_id: database_id.to_string(),
                outcome,
            });
        }

        Ok(recovered.into_values().collect())
    }
}
