//! Command dispatch across middleware processes
//!
//! Middleware processes fronting the same replica set coordinate through a
//! group-communication service (broadcast plus coordinator election). That
//! service is an external collaborator; this module specifies its boundary:
//! the [`Command`] wire enum, the [`CommandDispatcher`] the distributed
//! managers drive, and the [`CommandHandler`] they implement to receive
//! commands from peers.
//!
//! [`LocalGroup`] is the in-process implementation used for standalone
//! deployments and multi-member tests. Its coordinator is the lowest member
//! id - deterministic, like the reconciliation tie-break - and is re-elected
//! on departure.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::database::DatabaseId;
use crate::error::{ClusterError, Result};
use crate::lock::LockMode;
use crate::state::{InvocationEvent, InvokerEvent, InvokerOutcome, Phase, TransactionId};

/// Opaque identity of one middleware process within the distributed group
pub type Member = String;

/// Commands exchanged between middleware processes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Command {
    // ==================== Lock Coordination ====================
    AcquireLock {
        resource: String,
        mode: LockMode,
        owner: Member,
        timeout_ms: u64,
    },
    ReleaseLock {
        resource: String,
        mode: LockMode,
        owner: Member,
    },

    // ==================== Active-Set Propagation ====================
    Activated {
        database_id: DatabaseId,
    },
    Deactivated {
        database_id: DatabaseId,
    },

    // ==================== Durability Eventing ====================
    BeforeInvocation {
        event: InvocationEvent,
    },
    AfterInvocation {
        tx_id: TransactionId,
        phase: Phase,
    },
    BeforeInvoker {
        event: InvokerEvent,
    },
    AfterInvoker {
        tx_id: TransactionId,
        phase: Phase,
        database_id: DatabaseId,
        outcome: InvokerOutcome,
    },
}

/// Outcome of handling one command on one member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResponse {
    /// Command applied
    Ok,
    /// Command refused (e.g. lock contention); the caller may retry
    Denied { reason: String },
    /// Command failed
    Error { message: String },
}

impl CommandResponse {
    pub fn is_ok(&self) -> bool {
        matches!(self, CommandResponse::Ok)
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        CommandResponse::Denied {
            reason: reason.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        CommandResponse::Error {
            message: message.into(),
        }
    }
}

/// Receiver side of the dispatch boundary, implemented by the distributed
/// managers. `export_state`/`import_state` are the state-transfer hooks the
/// group invokes when a new member joins; `member_joined`/`member_left`
/// mirror the membership events of the group service.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Apply one command received from `from`
    async fn handle(&self, from: &Member, command: Command) -> CommandResponse;

    /// Serialize state for a joining member
    async fn export_state(&self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    /// Install state exported by the coordinator
    async fn import_state(&self, _state: &[u8]) -> Result<()> {
        Ok(())
    }

    /// A member joined the group
    async fn member_joined(&self, _member: &Member) {}

    /// A member left the group (gracefully or by failure detection)
    async fn member_left(&self, _member: &Member) {}
}

/// Sender side of the dispatch boundary
#[async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Join the group. The registered handler starts receiving commands and
    /// membership events; state transfer from the coordinator happens here.
    async fn start(&self) -> Result<()>;

    /// Leave the group. Best-effort, never fails.
    async fn stop(&self);

    /// Register the command handler. Must be called before `start`.
    fn register(&self, handler: Arc<dyn CommandHandler>);

    /// This process's member identity
    fn local(&self) -> Member;

    /// The current coordinator's identity
    fn coordinator(&self) -> Member;

    /// Whether this process is the coordinator
    fn is_coordinator(&self) -> bool {
        self.coordinator() == self.local()
    }

    /// Current group membership, including the local member
    fn members(&self) -> Vec<Member>;

    /// Deliver a command to every *other* member (the caller applies its
    /// own local effect directly) and collect each member's response
    async fn execute_all(&self, command: Command) -> Result<HashMap<Member, CommandResponse>>;

    /// Deliver a command to the coordinator and await its response within
    /// `wait`
    async fn execute_coordinator(&self, command: Command, wait: Duration)
        -> Result<CommandResponse>;
}

// ===========================================================================
// In-process group
// ===========================================================================

/// An in-process dispatch group. Every member is a [`LocalDispatcher`]
/// created from the same group instance.
#[derive(Default)]
pub struct LocalGroup {
    members: DashMap<Member, Arc<dyn CommandHandler>>,
}

impl LocalGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a dispatcher handle for a member of this group
    pub fn dispatcher(self: &Arc<Self>, member: impl Into<Member>) -> LocalDispatcher {
        LocalDispatcher {
            group: self.clone(),
            member: member.into(),
            handler: RwLock::new(None),
        }
    }

    fn coordinator(&self) -> Option<Member> {
        self.members.iter().map(|e| e.key().clone()).min()
    }

    fn handler_of(&self, member: &Member) -> Option<Arc<dyn CommandHandler>> {
        // Clone the Arc out; a shard guard must never be held across await
        self.members.get(member).map(|e| e.value().clone())
    }

    fn others(&self, member: &Member) -> Vec<(Member, Arc<dyn CommandHandler>)> {
        self.members
            .iter()
            .filter(|e| e.key() != member)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

/// One member's handle on a [`LocalGroup`]
pub struct LocalDispatcher {
    group: Arc<LocalGroup>,
    member: Member,
    handler: RwLock<Option<Arc<dyn CommandHandler>>>,
}

impl LocalDispatcher {
    fn registered(&self) -> Result<Arc<dyn CommandHandler>> {
        self.handler
            .read()
            .clone()
            .ok_or_else(|| ClusterError::Dispatch("no handler registered".into()))
    }
}

#[async_trait]
impl CommandDispatcher for LocalDispatcher {
    async fn start(&self) -> Result<()> {
        let handler = self.registered()?;

        // State transfer from the incumbent coordinator, if any
        if let Some(coordinator) = self.group.coordinator() {
            if let Some(source) = self.group.handler_of(&coordinator) {
                let snapshot = source.export_state().await?;
                handler.import_state(&snapshot).await?;
            }
        }

        self.group.members.insert(self.member.clone(), handler);
        info!(member = %self.member, "joined dispatch group");

        for (_, peer) in self.group.others(&self.member) {
            peer.member_joined(&self.member).await;
        }
        Ok(())
    }

    async fn stop(&self) {
        // Release the handler reference: the managers behind it hold this
        // dispatcher, and a stopped member must let that graph drop
        *self.handler.write() = None;
        if self.group.members.remove(&self.member).is_none() {
            return;
        }
        debug!(member = %self.member, "left dispatch group");
        for (_, peer) in self.group.others(&self.member) {
            peer.member_left(&self.member).await;
        }
    }

    fn register(&self, handler: Arc<dyn CommandHandler>) {
        *self.handler.write() = Some(handler);
    }

    fn local(&self) -> Member {
        self.member.clone()
    }

    fn coordinator(&self) -> Member {
        self.group.coordinator().unwrap_or_else(|| self.member.clone())
    }

    fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.group.members.iter().map(|e| e.key().clone()).collect();
        members.sort();
        members
    }

    async fn execute_all(&self, command: Command) -> Result<HashMap<Member, CommandResponse>> {
        let mut responses = HashMap::new();
        for (member, handler) in self.group.others(&self.member) {
            let response = handler.handle(&self.member, command.clone()).await;
            responses.insert(member, response);
        }
        Ok(responses)
    }

    async fn execute_coordinator(
        &self,
        command: Command,
        wait: Duration,
    ) -> Result<CommandResponse> {
        let coordinator = self.coordinator();
        if coordinator == self.member {
            return Err(ClusterError::Dispatch(
                "local member is the coordinator; apply the command directly".into(),
            ));
        }
        let handler = self
            .group
            .handler_of(&coordinator)
            .ok_or_else(|| ClusterError::Dispatch(format!("coordinator {} not found", coordinator)))?;

        tokio::time::timeout(wait, handler.handle(&self.member, command))
            .await
            .map_err(|_| {
                ClusterError::Dispatch(format!("coordinator {} did not respond", coordinator))
            })
    }
}
