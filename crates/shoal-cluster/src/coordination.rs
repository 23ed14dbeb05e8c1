//! Distributed lock and state coordination
//!
//! Wraps the local lock and state managers and propagates their events
//! across middleware processes through the [`CommandDispatcher`] boundary.
//!
//! Lock protocol: one group member is the coordinator. A coordinator caller
//! acquires its local lock, then broadcasts the acquire to every other
//! member and requires all of them to grant; any refusal rolls back the
//! local lock and every granted member lock, and the attempt fails (the
//! caller retries). A non-coordinator caller delegates the whole sequence
//! to the coordinator with a timeout. Unlock mirrors acquire. Locks held on
//! a departed member's behalf are force-released, and coordinator hand-off
//! transfers the outstanding lock table via the group's state snapshot.
//!
//! State protocol: activation/deactivation and durability events apply
//! locally first, then broadcast best-effort. Remote members mirror
//! active-set changes into their balancer and track peers' in-flight
//! invocations in a per-member pending map.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::balancer::Balancer;
use crate::config::LockConfig;
use crate::database::{Database, DatabaseId};
use crate::dispatch::{Command, CommandDispatcher, CommandHandler, CommandResponse, Member};
use crate::error::{ClusterError, Result};
use crate::lock::{LockDescriptor, LockGuard, LockManager, LockMode};
use crate::state::{
    InvocationEvent, InvokerEvent, InvokerOutcome, Phase, RecoveredInvocation, StateManager,
    TransactionId,
};

/// Extra slack on member-to-coordinator RPCs so the coordinator's own
/// lock wait can expire first and produce a proper refusal
const RPC_GRACE: Duration = Duration::from_millis(250);

// ===========================================================================
// Distributed lock manager
// ===========================================================================

/// Cluster-wide mutual exclusion over the dispatch group.
///
/// Read locks stay process-local: a distributed write lock acquires the
/// local write lock on *every* member, so remote writers already exclude
/// local readers through the member's own lock.
pub struct DistributedLockManager {
    dispatcher: Arc<dyn CommandDispatcher>,
    local: LockManager,
    /// Guards held in this process, keyed by (owner, resource). The owner
    /// is the member the lock was granted for - this process for its own
    /// acquisitions, a peer for broadcast grants.
    held: DashMap<(Member, String), LockGuard>,
    config: LockConfig,
}

impl DistributedLockManager {
    pub fn new(dispatcher: Arc<dyn CommandDispatcher>, config: LockConfig) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            local: LockManager::new(),
            held: DashMap::new(),
            config,
        })
    }

    /// Acquire the cluster-wide write lock on `resource`, retrying
    /// indefinitely with a yield between attempts
    pub async fn lock_write(&self, resource: &str) {
        loop {
            match self.try_lock_write(resource, self.config.acquire_timeout).await {
                Ok(()) => return,
                Err(e) => {
                    debug!(resource, error = %e, "lock attempt failed, retrying");
                    tokio::task::yield_now().await;
                    tokio::time::sleep(self.config.retry_interval).await;
                }
            }
        }
    }

    /// Attempt the cluster-wide write lock on `resource`, refusing after
    /// `wait`
    pub async fn try_lock_write(&self, resource: &str, wait: Duration) -> Result<()> {
        let owner = self.dispatcher.local();
        if self.dispatcher.is_coordinator() {
            return self
                .coordinate_acquire(resource, LockMode::Write, owner, wait)
                .await;
        }
        let acquire = Command::AcquireLock {
            resource: resource.to_string(),
            mode: LockMode::Write,
            owner: owner.clone(),
            timeout_ms: wait.as_millis() as u64,
        };
        let response = match self
            .dispatcher
            .execute_coordinator(acquire, wait + RPC_GRACE)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // The coordinator may have taken its local lock (or granted
                // some members) after we stopped waiting; undo whatever it
                // did so a half-finished acquire cannot strand the resource
                self.rollback_delegated(resource, owner).await;
                return Err(e);
            }
        };
        match response {
            CommandResponse::Ok => Ok(()),
            CommandResponse::Denied { reason } => Err(ClusterError::LockDenied {
                resource: resource.to_string(),
                reason,
            }),
            CommandResponse::Error { message } => Err(ClusterError::Dispatch(message)),
        }
    }

    /// Best-effort release after a timed-out delegated acquisition. The
    /// coordinator drops anything it holds for us and re-broadcasts the
    /// release; members that never granted treat it as a no-op.
    async fn rollback_delegated(&self, resource: &str, owner: Member) {
        let release = Command::ReleaseLock {
            resource: resource.to_string(),
            mode: LockMode::Write,
            owner,
        };
        if let Err(e) = self.dispatcher.execute_coordinator(release, RPC_GRACE).await {
            warn!(resource, error = %e, "failed to roll back timed-out lock acquisition");
        }
    }

    /// Release the cluster-wide write lock on `resource`
    pub async fn unlock_write(&self, resource: &str) -> Result<()> {
        let owner = self.dispatcher.local();
        let command = Command::ReleaseLock {
            resource: resource.to_string(),
            mode: LockMode::Write,
            owner: owner.clone(),
        };
        if self.dispatcher.is_coordinator() {
            // Member locks first, then our own local lock
            if let Err(e) = self.dispatcher.execute_all(command).await {
                warn!(resource, error = %e, "lock release broadcast failed");
            }
            self.held.remove(&(owner, resource.to_string()));
            Ok(())
        } else {
            self.dispatcher
                .execute_coordinator(command, self.config.acquire_timeout + RPC_GRACE)
                .await?;
            Ok(())
        }
    }

    /// Process-local read lock on `resource`
    pub async fn read_lock(&self, resource: &str) -> LockGuard {
        self.local.read_lock(resource).await
    }

    /// Local-then-broadcast acquisition, run by the coordinator either for
    /// itself or on a delegating member's behalf
    async fn coordinate_acquire(
        &self,
        resource: &str,
        mode: LockMode,
        owner: Member,
        wait: Duration,
    ) -> Result<()> {
        let guard = self.local.try_lock(resource, mode, wait).await?;
        self.held
            .insert((owner.clone(), resource.to_string()), guard);

        let acquire = Command::AcquireLock {
            resource: resource.to_string(),
            mode,
            owner: owner.clone(),
            timeout_ms: wait.as_millis() as u64,
        };
        let refused: Option<String> = match self.dispatcher.execute_all(acquire).await {
            Ok(responses) => responses
                .iter()
                .find(|(_, r)| !r.is_ok())
                .map(|(member, r)| format!("{}: {:?}", member, r)),
            Err(e) => Some(e.to_string()),
        };

        match refused {
            None => Ok(()),
            Some(reason) => {
                // Roll back: release every granted member lock, then ours.
                // Members that refused treat the release as a no-op.
                let release = Command::ReleaseLock {
                    resource: resource.to_string(),
                    mode,
                    owner: owner.clone(),
                };
                if let Err(e) = self.dispatcher.execute_all(release).await {
                    warn!(resource, error = %e, "lock rollback broadcast failed");
                }
                self.held.remove(&(owner, resource.to_string()));
                Err(ClusterError::LockDenied {
                    resource: resource.to_string(),
                    reason,
                })
            }
        }
    }

    /// Apply a lock command received from a peer
    async fn handle_lock(&self, from: &Member, command: Command) -> CommandResponse {
        match command {
            Command::AcquireLock {
                resource,
                mode,
                owner,
                timeout_ms,
            } => {
                let wait = Duration::from_millis(timeout_ms);
                if self.dispatcher.is_coordinator() && *from == owner {
                    // A member delegated its acquisition to us
                    match self.coordinate_acquire(&resource, mode, owner, wait).await {
                        Ok(()) => CommandResponse::Ok,
                        Err(e) => CommandResponse::denied(e.to_string()),
                    }
                } else {
                    // Broadcast from the coordinator: grant our local lock
                    match self.local.try_lock(&resource, mode, wait).await {
                        Ok(guard) => {
                            self.held.insert((owner, resource), guard);
                            CommandResponse::Ok
                        }
                        Err(e) => CommandResponse::denied(e.to_string()),
                    }
                }
            }
            Command::ReleaseLock {
                resource,
                mode,
                owner,
            } => {
                self.held.remove(&(owner.clone(), resource.clone()));
                if self.dispatcher.is_coordinator() && *from == owner {
                    // Delegated release: member locks everywhere, then ours
                    // (already dropped above)
                    let release = Command::ReleaseLock {
                        resource,
                        mode,
                        owner,
                    };
                    if let Err(e) = self.dispatcher.execute_all(release).await {
                        warn!(error = %e, "delegated lock release broadcast failed");
                    }
                }
                CommandResponse::Ok
            }
            other => CommandResponse::error(format!("not a lock command: {:?}", other)),
        }
    }

    /// Force-release everything held on a departed member's behalf
    async fn member_left(&self, member: &Member) {
        let stale: Vec<(Member, String)> = self
            .held
            .iter()
            .filter(|entry| entry.key().0 == *member)
            .map(|entry| entry.key().clone())
            .collect();
        for key in stale {
            warn!(member = %key.0, resource = %key.1, "force-releasing lock of departed member");
            self.held.remove(&key);
        }
    }

    /// Outstanding lock table for the group state snapshot
    fn export_descriptors(&self) -> Vec<LockDescriptor> {
        self.held
            .iter()
            .map(|entry| LockDescriptor {
                resource: entry.key().1.clone(),
                mode: entry.value().mode(),
                owner: entry.key().0.clone(),
            })
            .collect()
    }

    /// Re-acquire each snapshotted lock locally (state import on join /
    /// coordinator hand-off)
    async fn import_descriptors(&self, descriptors: Vec<LockDescriptor>) -> Result<()> {
        for descriptor in descriptors {
            let guard = self
                .local
                .try_lock(
                    &descriptor.resource,
                    descriptor.mode,
                    self.config.acquire_timeout,
                )
                .await?;
            self.held
                .insert((descriptor.owner, descriptor.resource), guard);
        }
        Ok(())
    }
}

// ===========================================================================
// Distributed state manager
// ===========================================================================

struct PendingInvocation {
    event: InvocationEvent,
    invokers: BTreeMap<DatabaseId, InvokerEvent>,
}

/// State manager decorator that mirrors every event to the rest of the
/// group. Local persistence always happens first; broadcast is best-effort
/// (a partitioned peer re-syncs through the join snapshot).
pub struct DistributedStateManager {
    local: Arc<dyn StateManager>,
    dispatcher: Arc<dyn CommandDispatcher>,
    balancer: Arc<dyn Balancer>,
    databases: Arc<DashMap<DatabaseId, Database>>,
    /// Peers' in-flight invocations, synchronized per member
    remote: DashMap<Member, BTreeMap<(TransactionId, Phase), PendingInvocation>>,
}

impl DistributedStateManager {
    pub fn new(
        local: Arc<dyn StateManager>,
        dispatcher: Arc<dyn CommandDispatcher>,
        balancer: Arc<dyn Balancer>,
        databases: Arc<DashMap<DatabaseId, Database>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local,
            dispatcher,
            balancer,
            databases,
            remote: DashMap::new(),
        })
    }

    /// A peer's tracked in-flight invocations
    pub fn pending(&self, member: &Member) -> Vec<RecoveredInvocation> {
        self.remote
            .get(member)
            .map(|entry| {
                entry
                    .values()
                    .map(|pending| RecoveredInvocation {
                        invocation: pending.event.clone(),
                        invokers: pending.invokers.values().cloned().collect(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn broadcast(&self, command: Command) {
        match self.dispatcher.execute_all(command).await {
            Ok(responses) => {
                for (member, response) in responses {
                    if !response.is_ok() {
                        warn!(member = %member, ?response, "peer rejected state command");
                    }
                }
            }
            Err(e) => warn!(error = %e, "state broadcast failed"),
        }
    }

    /// Apply a state command received from a peer
    async fn handle_state(&self, from: &Member, command: Command) -> CommandResponse {
        match command {
            Command::Activated { database_id } => match self.apply_activation(&database_id).await {
                Ok(()) => CommandResponse::Ok,
                Err(e) => CommandResponse::error(e.to_string()),
            },
            Command::Deactivated { database_id } => {
                self.balancer.remove(&database_id);
                match self.local.deactivated(&database_id).await {
                    Ok(()) => CommandResponse::Ok,
                    Err(e) => CommandResponse::error(e.to_string()),
                }
            }
            Command::BeforeInvocation { event } => {
                self.remote.entry(from.clone()).or_default().insert(
                    (event.tx_id, event.phase),
                    PendingInvocation {
                        event,
                        invokers: BTreeMap::new(),
                    },
                );
                CommandResponse::Ok
            }
            Command::AfterInvocation { tx_id, phase } => {
                if let Some(mut entry) = self.remote.get_mut(from) {
                    entry.remove(&(tx_id, phase));
                }
                CommandResponse::Ok
            }
            Command::BeforeInvoker { event } => {
                if let Some(mut entry) = self.remote.get_mut(from) {
                    if let Some(pending) = entry.get_mut(&(event.tx_id, event.phase)) {
                        pending.invokers.insert(event.database_id.clone(), event);
                    }
                }
                CommandResponse::Ok
            }
            Command::AfterInvoker {
                tx_id,
                phase,
                database_id,
                outcome,
            } => {
                if let Some(mut entry) = self.remote.get_mut(from) {
                    if let Some(pending) = entry.get_mut(&(tx_id, phase)) {
                        if let Some(invoker) = pending.invokers.get_mut(&database_id) {
                            invoker.outcome = Some(outcome);
                        }
                    }
                }
                CommandResponse::Ok
            }
            other => CommandResponse::error(format!("not a state command: {:?}", other)),
        }
    }

    async fn apply_activation(&self, id: &DatabaseId) -> Result<()> {
        // Clone out of the map; a shard guard must never cross the await
        let db = self
            .databases
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ClusterError::UnknownDatabase(id.clone()))?;
        self.balancer.add(db);
        self.local.activated(id).await
    }

    /// Active-set snapshot for the group state snapshot
    async fn export_active(&self) -> Result<Vec<DatabaseId>> {
        self.local.active_databases().await
    }

    /// Converge the persisted active set onto the snapshot. The balancer is
    /// seeded from the active set when the cluster starts, after this runs.
    async fn import_active(&self, ids: Vec<DatabaseId>) -> Result<()> {
        for stale in self.local.active_databases().await? {
            if !ids.contains(&stale) {
                self.balancer.remove(&stale);
                self.local.deactivated(&stale).await?;
            }
        }
        for id in ids {
            self.apply_activation(&id).await?;
        }
        Ok(())
    }

    async fn member_left(&self, member: &Member) {
        if let Some((_, pending)) = self.remote.remove(member) {
            if !pending.is_empty() {
                warn!(
                    member = %member,
                    invocations = pending.len(),
                    "member departed with invocations in flight; its restart will recover them"
                );
            }
        }
    }
}

#[async_trait]
impl StateManager for DistributedStateManager {
    async fn start(&self) -> Result<()> {
        self.local.start().await
    }

    async fn stop(&self) {
        self.local.stop().await
    }

    async fn active_databases(&self) -> Result<Vec<DatabaseId>> {
        self.local.active_databases().await
    }

    async fn activated(&self, id: &DatabaseId) -> Result<()> {
        self.local.activated(id).await?;
        self.broadcast(Command::Activated {
            database_id: id.clone(),
        })
        .await;
        Ok(())
    }

    async fn deactivated(&self, id: &DatabaseId) -> Result<()> {
        self.local.deactivated(id).await?;
        self.broadcast(Command::Deactivated {
            database_id: id.clone(),
        })
        .await;
        Ok(())
    }

    async fn before_invocation(&self, event: &InvocationEvent) -> Result<()> {
        self.local.before_invocation(event).await?;
        self.broadcast(Command::BeforeInvocation {
            event: event.clone(),
        })
        .await;
        Ok(())
    }

    async fn after_invocation(&self, tx_id: TransactionId, phase: Phase) -> Result<()> {
        self.local.after_invocation(tx_id, phase).await?;
        self.broadcast(Command::AfterInvocation { tx_id, phase }).await;
        Ok(())
    }

    async fn before_invoker(&self, event: &InvokerEvent) -> Result<()> {
        self.local.before_invoker(event).await?;
        self.broadcast(Command::BeforeInvoker {
            event: event.clone(),
        })
        .await;
        Ok(())
    }

    async fn after_invoker(
        &self,
        tx_id: TransactionId,
        phase: Phase,
        database_id: &DatabaseId,
        outcome: &InvokerOutcome,
    ) -> Result<()> {
        self.local
            .after_invoker(tx_id, phase, database_id, outcome)
            .await?;
        self.broadcast(Command::AfterInvoker {
            tx_id,
            phase,
            database_id: database_id.clone(),
            outcome: outcome.clone(),
        })
        .await;
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<RecoveredInvocation>> {
        self.local.recover().await
    }
}

// ===========================================================================
// Group command handler
// ===========================================================================

/// Everything a joining member needs to converge with the group
#[derive(Debug, Serialize, Deserialize)]
struct GroupSnapshot {
    locks: Vec<LockDescriptor>,
    active: Vec<DatabaseId>,
}

/// Routes incoming group commands to the distributed managers and carries
/// the state-transfer and membership hooks. One per process, registered on
/// the dispatcher before it starts.
pub struct CoordinationHandler {
    locks: Arc<DistributedLockManager>,
    state: Arc<DistributedStateManager>,
}

impl CoordinationHandler {
    pub fn new(
        locks: Arc<DistributedLockManager>,
        state: Arc<DistributedStateManager>,
    ) -> Arc<Self> {
        Arc::new(Self { locks, state })
    }
}

#[async_trait]
impl CommandHandler for CoordinationHandler {
    async fn handle(&self, from: &Member, command: Command) -> CommandResponse {
        match command {
            Command::AcquireLock { .. } | Command::ReleaseLock { .. } => {
                self.locks.handle_lock(from, command).await
            }
            _ => self.state.handle_state(from, command).await,
        }
    }

    async fn export_state(&self) -> Result<Vec<u8>> {
        let snapshot = GroupSnapshot {
            locks: self.locks.export_descriptors(),
            active: self.state.export_active().await?,
        };
        Ok(serde_json::to_vec(&snapshot)?)
    }

    async fn import_state(&self, state: &[u8]) -> Result<()> {
        if state.is_empty() {
            return Ok(());
        }
        let snapshot: GroupSnapshot = serde_json::from_slice(state)?;
        info!(
            locks = snapshot.locks.len(),
            active = snapshot.active.len(),
            "importing group state snapshot"
        );
        self.locks.import_descriptors(snapshot.locks).await?;
        self.state.import_active(snapshot.active).await
    }

    async fn member_joined(&self, member: &Member) {
        debug!(member = %member, "member joined");
    }

    async fn member_left(&self, member: &Member) {
        info!(member = %member, "member left");
        self.locks.member_left(member).await;
        self.state.member_left(member).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::RoundRobinBalancer;
    use crate::config::LockConfig;
    use crate::dispatch::LocalGroup;
    use crate::state::MemoryStateManager;

    struct TestMember {
        dispatcher: Arc<dyn CommandDispatcher>,
        locks: Arc<DistributedLockManager>,
        state: Arc<DistributedStateManager>,
        balancer: Arc<RoundRobinBalancer>,
    }

    async fn member(group: &Arc<LocalGroup>, name: &str, ids: &[&str]) -> TestMember {
        let dispatcher: Arc<dyn CommandDispatcher> = Arc::new(group.dispatcher(name));
        let balancer = Arc::new(RoundRobinBalancer::new());
        let databases: Arc<DashMap<DatabaseId, Database>> = Arc::new(DashMap::new());
        for id in ids {
            let db = Database::new(*id, format!("postgres://{}/app", id));
            databases.insert(db.id.clone(), db.clone());
            balancer.add(db);
        }

        let config = LockConfig {
            acquire_timeout: Duration::from_millis(100),
            retry_interval: Duration::from_millis(10),
        };
        let locks = DistributedLockManager::new(dispatcher.clone(), config);
        let state = DistributedStateManager::new(
            Arc::new(MemoryStateManager::new()),
            dispatcher.clone(),
            balancer.clone(),
            databases,
        );
        dispatcher.register(CoordinationHandler::new(locks.clone(), state.clone()));
        dispatcher.start().await.unwrap();

        TestMember {
            dispatcher,
            locks,
            state,
            balancer,
        }
    }

    #[tokio::test]
    async fn test_write_lock_is_mutually_exclusive_across_members() {
        let group = LocalGroup::new();
        let m1 = member(&group, "m1", &[]).await;
        let m2 = member(&group, "m2", &[]).await;

        m1.locks.try_lock_write("global", Duration::from_millis(50)).await.unwrap();

        // Holder established; the other member must be refused
        let refused = m2.locks.try_lock_write("global", Duration::from_millis(50)).await;
        assert!(refused.is_err());

        // Release on one allows the other to proceed
        m1.locks.unlock_write("global").await.unwrap();
        m2.locks.try_lock_write("global", Duration::from_millis(50)).await.unwrap();
        m2.locks.unlock_write("global").await.unwrap();
    }

    #[tokio::test]
    async fn test_member_acquisition_is_delegated_to_coordinator() {
        let group = LocalGroup::new();
        let m1 = member(&group, "m1", &[]).await;
        let m2 = member(&group, "m2", &[]).await;
        assert!(m1.dispatcher.is_coordinator());

        // The non-coordinator acquires through the coordinator
        m2.locks.try_lock_write("global", Duration::from_millis(50)).await.unwrap();

        // ...and the coordinator is now excluded
        let refused = m1.locks.try_lock_write("global", Duration::from_millis(50)).await;
        assert!(refused.is_err());

        m2.locks.unlock_write("global").await.unwrap();
        m1.locks.try_lock_write("global", Duration::from_millis(50)).await.unwrap();
    }

    /// Member that acknowledges lock grants only after a delay, long enough
    /// to outlast a requester's RPC patience
    struct SlowGrant {
        delay: Duration,
    }

    #[async_trait]
    impl CommandHandler for SlowGrant {
        async fn handle(&self, _from: &Member, command: Command) -> CommandResponse {
            if matches!(command, Command::AcquireLock { .. }) {
                tokio::time::sleep(self.delay).await;
            }
            CommandResponse::Ok
        }
    }

    #[tokio::test]
    async fn test_timed_out_delegated_acquire_rolls_back() {
        let group = LocalGroup::new();
        let m1 = member(&group, "m1", &[]).await;
        let m2 = member(&group, "m2", &[]).await;

        // m3's grant outlasts the requester's RPC window, so the delegated
        // acquire stalls mid-broadcast after the coordinator already holds
        // its local lock
        let slow = group.dispatcher("m3");
        slow.register(Arc::new(SlowGrant {
            delay: Duration::from_millis(600),
        }));
        slow.start().await.unwrap();

        let refused = m2.locks.try_lock_write("global", Duration::from_millis(50)).await;
        assert!(refused.is_err());

        // The requester's rollback reached the coordinator: once the slow
        // member is gone, nobody is stranded and both survivors can lock
        slow.stop().await;
        m1.locks.try_lock_write("global", Duration::from_millis(100)).await.unwrap();
        m1.locks.unlock_write("global").await.unwrap();
        m2.locks.try_lock_write("global", Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_coordinator_departure_hands_off_outstanding_locks() {
        let group = LocalGroup::new();
        let m1 = member(&group, "m1", &[]).await;
        let m2 = member(&group, "m2", &[]).await;
        let m3 = member(&group, "m3", &[]).await;

        // m2 acquires through coordinator m1, then m1 departs
        m2.locks.try_lock_write("global", Duration::from_millis(50)).await.unwrap();
        m1.dispatcher.stop().await;
        assert!(m2.dispatcher.is_coordinator());

        // The lock survives the hand-off: the new coordinator's own grant
        // still excludes everyone else
        let refused = m3.locks.try_lock_write("global", Duration::from_millis(50)).await;
        assert!(refused.is_err());

        // The holder releases as the new coordinator and m3 proceeds
        m2.locks.unlock_write("global").await.unwrap();
        m3.locks.try_lock_write("global", Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_departed_member_locks_are_force_released() {
        let group = LocalGroup::new();
        let m1 = member(&group, "m1", &[]).await;
        let m2 = member(&group, "m2", &[]).await;

        m2.locks.try_lock_write("global", Duration::from_millis(50)).await.unwrap();
        assert!(m1
            .locks
            .try_lock_write("global", Duration::from_millis(50))
            .await
            .is_err());

        // m2 departs without releasing; its locks are forced open
        m2.dispatcher.stop().await;
        m1.locks.try_lock_write("global", Duration::from_millis(100)).await.unwrap();
    }

    #[tokio::test]
    async fn test_deactivation_propagates_to_peers() {
        let group = LocalGroup::new();
        let m1 = member(&group, "m1", &["db1", "db2"]).await;
        let m2 = member(&group, "m2", &["db1", "db2"]).await;

        m1.state.deactivated(&"db2".to_string()).await.unwrap();

        // m2 mirrored the change into its balancer
        let survivors: Vec<_> = m2.balancer.all().iter().map(|db| db.id.clone()).collect();
        assert_eq!(survivors, vec!["db1"]);
        assert!(m1.state.active_databases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_activation_propagates_to_peers() {
        let group = LocalGroup::new();
        let m1 = member(&group, "m1", &["db1", "db2"]).await;
        let m2 = member(&group, "m2", &["db1", "db2"]).await;
        m2.balancer.remove("db2");

        m1.state.activated(&"db2".to_string()).await.unwrap();

        assert_eq!(m2.balancer.all().len(), 2);
        assert_eq!(m2.state.active_databases().await.unwrap(), vec!["db2"]);
    }

    #[tokio::test]
    async fn test_peer_invocations_are_tracked_and_cleared() {
        let group = LocalGroup::new();
        let m1 = member(&group, "m1", &["db1"]).await;
        let m2 = member(&group, "m2", &["db1"]).await;

        let tx = uuid::Uuid::new_v4();
        let event = InvocationEvent::new(tx, Phase::Prepare, crate::state::ExceptionKind::Sql);
        m1.state.before_invocation(&event).await.unwrap();
        m1.state
            .before_invoker(&InvokerEvent::new(tx, Phase::Prepare, "db1".to_string()))
            .await
            .unwrap();

        let pending = m2.state.pending(&"m1".to_string());
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].invocation, event);
        assert_eq!(pending[0].invokers.len(), 1);

        m1.state.after_invocation(tx, Phase::Prepare).await.unwrap();
        assert!(m2.state.pending(&"m1".to_string()).is_empty());
    }

    #[tokio::test]
    async fn test_join_snapshot_transfers_active_set_and_locks() {
        let group = LocalGroup::new();
        let m1 = member(&group, "m1", &["db1", "db2"]).await;
        m1.state.activated(&"db1".to_string()).await.unwrap();
        m1.state.deactivated(&"db2".to_string()).await.unwrap();
        m1.locks.try_lock_write("global", Duration::from_millis(50)).await.unwrap();

        // m2 joins late and converges through the coordinator's snapshot
        let m2 = member(&group, "m2", &["db1", "db2"]).await;

        assert_eq!(m2.state.active_databases().await.unwrap(), vec!["db1"]);
        // The outstanding lock was re-acquired locally on import
        assert!(m2
            .locks
            .local
            .try_lock("global", LockMode::Write, Duration::from_millis(20))
            .await
            .is_err());
    }
}
