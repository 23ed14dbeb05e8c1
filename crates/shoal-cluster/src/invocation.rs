//! Invocation strategies and outcome reconciliation
//!
//! The engine executes an [`Invoker`] callback against one or many replicas
//! and returns exactly one outcome to the caller: a per-database result map,
//! or a single exception. Replicas whose outcome disagrees with the
//! reconciled one are deactivated, never surfaced to the caller.
//!
//! Single-target strategies (reads) retry against surviving replicas when
//! the dialect classifies an exception as a replica failure. The
//! multi-target strategy (writes, all-replica reads) fans out in parallel
//! and reconciles divergent outcomes deterministically: decisions are keyed
//! by database id, never by completion order, so every cluster member
//! reaches the same verdict without extra coordination. The lowest-id
//! database with an exception is the "primary" tie-break.
//!
//! Multi-target invocations bracket every transition with a durability
//! event ([`StateManager`]) so a crash mid-fan-out is recoverable.
//! Single-target reads leave no durable footprint: a crashed read needs no
//! recovery. Durability-log write failures are logged at error level and do
//! not block the in-flight operation.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::balancer::Balancer;
use crate::database::{Database, DatabaseId};
use crate::dialect::{Dialect, SqlError};
use crate::error::{ClusterError, Result};
use crate::state::{
    ExceptionKind, InvocationEvent, InvokerEvent, InvokerOutcome, Phase, StateManager,
};

/// Per-database results of one invocation, keyed by database id
pub type ResultMap = BTreeMap<DatabaseId, Bytes>;

/// Externally supplied callback: apply one operation to a replica's
/// underlying connection object. This core never constructs that object,
/// only routes to it.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, database: &Database) -> std::result::Result<Bytes, SqlError>;
}

/// Closed set of invocation strategies, selected by the caller per
/// operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationStrategy {
    /// Single replica chosen by the balancer's policy; retry on failure
    InvokeOnNext,
    /// The lowest-id active replica; retry on failure
    InvokeOnPrimary,
    /// Every active replica in parallel, outcomes reconciled
    InvokeOnAll,
}

/// Why a replica is being demoted out of the active set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DemotionReason {
    /// The dialect classified its exception as a replica failure
    Failure,
    /// Its outcome disagrees with the reconciled authoritative outcome
    Inconsistent,
}

/// Reconciliation verdict: either the result map stands, or the primary's
/// exception is authoritative; either way some replicas may be demoted.
pub(crate) struct Reconciliation {
    pub(crate) authoritative: Option<SqlError>,
    pub(crate) demote: Vec<(DatabaseId, DemotionReason)>,
}

/// Turn per-replica results/exceptions into one authoritative outcome.
///
/// Deterministic given the same map contents, independent of arrival order:
/// both maps are keyed (and iterated) by database id.
pub(crate) fn reconcile(
    dialect: &dyn Dialect,
    results: &ResultMap,
    mut exceptions: BTreeMap<DatabaseId, SqlError>,
) -> Reconciliation {
    let mut demote = Vec::new();

    // Step 1: demote classified replica failures, unless *every* targeted
    // replica failed and no results exist (deactivating the whole cluster
    // through this path would leave nothing to serve the retry).
    if !exceptions.is_empty() {
        let failures: Vec<DatabaseId> = exceptions
            .iter()
            .filter(|(_, e)| dialect.indicates_failure(e))
            .map(|(id, _)| id.clone())
            .collect();
        if !results.is_empty() || failures.len() < exceptions.len() {
            for id in failures {
                exceptions.remove(&id);
                demote.push((id, DemotionReason::Failure));
            }
        }
    }

    // Step 2: if an exception remains on the primary (the lowest id still
    // holding an exception, ordered before every success), it is the
    // authoritative outcome; anything that disagrees with it is demoted.
    if let Some((primary_id, primary_error)) = exceptions
        .iter()
        .next()
        .map(|(id, e)| (id.clone(), e.clone()))
    {
        let primary_failed = match results.keys().next() {
            None => true,
            Some(first_success) => primary_id < *first_success,
        };

        if primary_failed {
            for (id, e) in &exceptions {
                if *id != primary_id && !dialect.same_outcome(&primary_error, e) {
                    demote.push((id.clone(), DemotionReason::Inconsistent));
                }
            }
            for id in results.keys() {
                demote.push((id.clone(), DemotionReason::Inconsistent));
            }
            return Reconciliation {
                authoritative: Some(primary_error),
                demote,
            };
        }

        // Step 3: the primary succeeded; every remaining exception dissents
        // from the consensus result.
        for id in exceptions.keys() {
            demote.push((id.clone(), DemotionReason::Inconsistent));
        }
    }

    Reconciliation {
        authoritative: None,
        demote,
    }
}

/// Executes invokers across the active set and keeps it consistent.
///
/// Holds only leaf components (balancer, dialect, state manager); the
/// cluster context wires it and owns the only back-references.
pub struct InvocationEngine {
    balancer: Arc<dyn Balancer>,
    dialect: Arc<dyn Dialect>,
    state: Arc<dyn StateManager>,
}

impl InvocationEngine {
    pub fn new(
        balancer: Arc<dyn Balancer>,
        dialect: Arc<dyn Dialect>,
        state: Arc<dyn StateManager>,
    ) -> Self {
        Self {
            balancer,
            dialect,
            state,
        }
    }

    /// Execute one operation with the given strategy. Returns exactly one
    /// outcome: the per-database result map, or one error. Partial results
    /// are never exposed.
    pub async fn invoke(
        &self,
        strategy: InvocationStrategy,
        invoker: Arc<dyn Invoker>,
        phase: Phase,
    ) -> Result<ResultMap> {
        match strategy {
            InvocationStrategy::InvokeOnNext | InvocationStrategy::InvokeOnPrimary => {
                self.invoke_on_one(strategy, invoker.as_ref()).await
            }
            InvocationStrategy::InvokeOnAll => self.invoke_on_all(invoker, phase).await,
        }
    }

    /// Demote a replica out of the active set. Always best-effort: a failed
    /// state write is logged and never blocks returning the operation's
    /// outcome.
    pub(crate) async fn demote(&self, id: &DatabaseId, reason: DemotionReason) {
        if !self.balancer.remove(id) {
            return;
        }
        match reason {
            DemotionReason::Failure => {
                warn!(database = %id, "deactivating failed database");
            }
            DemotionReason::Inconsistent => {
                error!(
                    database = %id,
                    "deactivating database: outcome disagrees with reconciled primary outcome"
                );
            }
        }
        if let Err(e) = self.state.deactivated(id).await {
            error!(database = %id, error = %e, "failed to record deactivation");
        }
    }

    async fn invoke_on_one(
        &self,
        strategy: InvocationStrategy,
        invoker: &dyn Invoker,
    ) -> Result<ResultMap> {
        loop {
            let db = match strategy {
                InvocationStrategy::InvokeOnPrimary => self.balancer.primary()?,
                _ => self.balancer.next()?,
            };

            self.balancer.before_invoke(&db.id);
            let outcome = invoker.invoke(&db).await;
            self.balancer.after_invoke(&db.id);

            match outcome {
                Ok(payload) => {
                    let mut results = ResultMap::new();
                    results.insert(db.id, payload);
                    return Ok(results);
                }
                Err(e) if self.dialect.indicates_failure(&e) => {
                    self.demote(&db.id, DemotionReason::Failure).await;
                    // Loop: select a new target among the survivors
                }
                Err(e) => return Err(ClusterError::Sql(e)),
            }
        }
    }

    async fn invoke_on_all(&self, invoker: Arc<dyn Invoker>, phase: Phase) -> Result<ResultMap> {
        let targets = self.balancer.all();
        if targets.is_empty() {
            return Err(ClusterError::NoActiveDatabases);
        }

        let tx_id = Uuid::new_v4();
        let event = InvocationEvent::new(tx_id, phase, ExceptionKind::Sql);
        if let Err(e) = self.state.before_invocation(&event).await {
            error!(tx = %tx_id, error = %e, "durability log write failed (before invocation)");
        }

        let mut pending: BTreeSet<DatabaseId> = targets.iter().map(|db| db.id.clone()).collect();
        let mut tasks: JoinSet<(DatabaseId, std::result::Result<Bytes, SqlError>)> =
            JoinSet::new();

        for db in targets.iter().cloned() {
            let invoker = invoker.clone();
            let balancer = self.balancer.clone();
            let state = self.state.clone();
            tasks.spawn(async move {
                let invoker_event = InvokerEvent::new(tx_id, phase, db.id.clone());
                if let Err(e) = state.before_invoker(&invoker_event).await {
                    error!(tx = %tx_id, database = %db.id, error = %e,
                        "durability log write failed (before invoker)");
                }

                balancer.before_invoke(&db.id);
                let outcome = invoker.invoke(&db).await;
                balancer.after_invoke(&db.id);

                let payload = match &outcome {
                    Ok(bytes) => InvokerOutcome::Success(bytes.to_vec()),
                    Err(e) => InvokerOutcome::Error(e.clone()),
                };
                if let Err(e) = state.after_invoker(tx_id, phase, &db.id, &payload).await {
                    error!(tx = %tx_id, database = %db.id, error = %e,
                        "durability log write failed (after invoker)");
                }

                (db.id, outcome)
            });
        }

        let mut results = ResultMap::new();
        let mut exceptions: BTreeMap<DatabaseId, SqlError> = BTreeMap::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Ok(payload))) => {
                    pending.remove(&id);
                    results.insert(id, payload);
                }
                Ok((id, Err(e))) => {
                    pending.remove(&id);
                    exceptions.insert(id, e);
                }
                Err(e) => {
                    // The replica responsible is whichever id never reports;
                    // accounted for below
                    error!(tx = %tx_id, error = %e, "replica call aborted");
                }
            }
        }

        // Every targeted database appears in exactly one of the two maps
        let lost_call = !pending.is_empty();
        let aborted_error = self.dialect.from_cause("replica call aborted");
        for id in pending {
            exceptions.insert(id, aborted_error.clone());
        }

        let verdict = reconcile(self.dialect.as_ref(), &results, exceptions);
        for (id, reason) in &verdict.demote {
            self.demote(id, *reason).await;
        }

        // A lost replica call that ends up as the authoritative outcome is a
        // cluster-level failure, not an application one; re-record the
        // invocation row so recovery surfaces it under the right kind
        if lost_call && verdict.authoritative.as_ref() == Some(&aborted_error) {
            let event = InvocationEvent::new(tx_id, phase, ExceptionKind::Cluster);
            if let Err(e) = self.state.before_invocation(&event).await {
                error!(tx = %tx_id, error = %e, "durability log write failed (exception kind)");
            }
        }

        if let Err(e) = self.state.after_invocation(tx_id, phase).await {
            error!(tx = %tx_id, error = %e, "durability log write failed (after invocation)");
        }

        match verdict.authoritative {
            Some(error) => {
                debug!(tx = %tx_id, error = %error, "re-throwing primary outcome");
                Err(ClusterError::Sql(error))
            }
            None => Ok(results),
        }
    }
}
