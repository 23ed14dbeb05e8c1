//! Read-routing balancer
//!
//! The balancer owns the cluster's *active* database set and a selection
//! policy for single-replica reads. Mutation is copy-on-write: `add` and
//! `remove` build a fresh snapshot and swap it under one lock, so concurrent
//! `all()` / `next()` readers never block and never observe a
//! partially-updated structure.
//!
//! Policies:
//! - [`SimpleBalancer`]: always the highest-weight active database
//! - [`RandomBalancer`]: weighted random (weight `w` = `w` slots)
//! - [`RoundRobinBalancer`]: weighted circular queue
//! - [`LoadBalancer`]: minimize in-flight load / weight

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::BalancerPolicy;
use crate::database::{Database, DatabaseId};
use crate::error::{ClusterError, Result};

/// Routing policy over the active database set.
///
/// `add`/`remove` are idempotent and report whether they changed anything;
/// `all()` is a non-blocking snapshot; `next()` selects a read target and
/// fails with [`ClusterError::NoActiveDatabases`] only when the set is
/// empty; `primary()` is the lowest-id active database.
pub trait Balancer: Send + Sync {
    /// Add a database to the active set. Returns false if already present.
    fn add(&self, db: Database) -> bool;

    /// Remove a database from the active set. Returns false if absent.
    fn remove(&self, id: &str) -> bool;

    /// Snapshot of the active set, sorted by id
    fn all(&self) -> Arc<[Database]>;

    /// Select a target for a single-replica read
    fn next(&self) -> Result<Database>;

    /// The distinguished lowest-id active database, for master-routed reads
    fn primary(&self) -> Result<Database> {
        // all() is id-sorted
        self.all()
            .first()
            .cloned()
            .ok_or(ClusterError::NoActiveDatabases)
    }

    /// Hook fired before an invocation against `id` starts
    fn before_invoke(&self, _id: &str) {}

    /// Hook fired after an invocation against `id` completes
    fn after_invoke(&self, _id: &str) {}
}

/// Create the balancer implementation for a configured policy
pub fn create_balancer(policy: BalancerPolicy) -> Arc<dyn Balancer> {
    match policy {
        BalancerPolicy::Simple => Arc::new(SimpleBalancer::new()),
        BalancerPolicy::Random => Arc::new(RandomBalancer::new()),
        BalancerPolicy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        BalancerPolicy::Load => Arc::new(LoadBalancer::new()),
    }
}

// ===========================================================================
// Shared copy-on-write active set
// ===========================================================================

/// Immutable, id-sorted snapshot swapped under a single lock on mutation
struct ActiveSet {
    snapshot: RwLock<Arc<[Database]>>,
}

impl ActiveSet {
    fn new() -> Self {
        Self {
            snapshot: RwLock::new(Arc::from(Vec::new())),
        }
    }

    fn add(&self, db: Database) -> bool {
        let mut guard = self.snapshot.write();
        if guard.iter().any(|d| d.id == db.id) {
            return false;
        }
        let mut next: Vec<Database> = guard.to_vec();
        next.push(db);
        next.sort_by(|a, b| a.id.cmp(&b.id));
        *guard = Arc::from(next);
        true
    }

    fn remove(&self, id: &str) -> bool {
        let mut guard = self.snapshot.write();
        if !guard.iter().any(|d| d.id == id) {
            return false;
        }
        let next: Vec<Database> = guard.iter().filter(|d| d.id != id).cloned().collect();
        *guard = Arc::from(next);
        true
    }

    fn get(&self) -> Arc<[Database]> {
        self.snapshot.read().clone()
    }

    /// Lowest-id member, used as the fallback when no weighted slot exists
    /// (every active database has weight 0)
    fn first(&self) -> Result<Database> {
        self.get()
            .first()
            .cloned()
            .ok_or(ClusterError::NoActiveDatabases)
    }
}

// ===========================================================================
// Simple — highest weight wins
// ===========================================================================

/// Routes every read to the highest-weight active database, recomputed on
/// every add/remove. Ties break toward the lowest id.
pub struct SimpleBalancer {
    set: ActiveSet,
}

impl SimpleBalancer {
    pub fn new() -> Self {
        Self {
            set: ActiveSet::new(),
        }
    }
}

impl Default for SimpleBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for SimpleBalancer {
    fn add(&self, db: Database) -> bool {
        self.set.add(db)
    }

    fn remove(&self, id: &str) -> bool {
        self.set.remove(id)
    }

    fn all(&self) -> Arc<[Database]> {
        self.set.get()
    }

    fn next(&self) -> Result<Database> {
        // Snapshot is id-sorted, so max_by_key on weight keeps the lowest
        // id among equals (max_by_key returns the last maximum; reverse id
        // ordering inside the key is avoided by scanning manually)
        let snapshot = self.set.get();
        snapshot
            .iter()
            .fold(None::<&Database>, |best, db| match best {
                Some(b) if b.weight >= db.weight => Some(b),
                _ => Some(db),
            })
            .cloned()
            .ok_or(ClusterError::NoActiveDatabases)
    }
}

// ===========================================================================
// Random — weighted random slot
// ===========================================================================

/// Weighted random selection: a database with weight `w` occupies `w` slots
/// in a flattened selection list rebuilt on every add/remove.
pub struct RandomBalancer {
    set: ActiveSet,
    slots: RwLock<Arc<[Database]>>,
}

impl RandomBalancer {
    pub fn new() -> Self {
        Self {
            set: ActiveSet::new(),
            slots: RwLock::new(Arc::from(Vec::new())),
        }
    }

    fn rebuild_slots(&self) {
        let snapshot = self.set.get();
        let mut slots = Vec::new();
        for db in snapshot.iter() {
            for _ in 0..db.weight {
                slots.push(db.clone());
            }
        }
        *self.slots.write() = Arc::from(slots);
    }
}

impl Default for RandomBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for RandomBalancer {
    fn add(&self, db: Database) -> bool {
        let changed = self.set.add(db);
        if changed {
            self.rebuild_slots();
        }
        changed
    }

    fn remove(&self, id: &str) -> bool {
        let changed = self.set.remove(id);
        if changed {
            self.rebuild_slots();
        }
        changed
    }

    fn all(&self) -> Arc<[Database]> {
        self.set.get()
    }

    fn next(&self) -> Result<Database> {
        let slots = self.slots.read().clone();
        if slots.is_empty() {
            // Non-empty set with all weights 0 still has to route somewhere
            return self.set.first();
        }
        let index = rand::thread_rng().gen_range(0..slots.len());
        Ok(slots[index].clone())
    }
}

// ===========================================================================
// Round-robin — weighted circular queue
// ===========================================================================

/// Weighted circular queue: `add` enqueues `weight` slots for the database,
/// `next()` dequeues a slot and requeues it at the back.
pub struct RoundRobinBalancer {
    set: ActiveSet,
    queue: Mutex<VecDeque<DatabaseId>>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            set: ActiveSet::new(),
            queue: Mutex::new(VecDeque::new()),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for RoundRobinBalancer {
    fn add(&self, db: Database) -> bool {
        let weight = db.weight;
        let id = db.id.clone();
        let changed = self.set.add(db);
        if changed {
            let mut queue = self.queue.lock();
            for _ in 0..weight {
                queue.push_back(id.clone());
            }
        }
        changed
    }

    fn remove(&self, id: &str) -> bool {
        let changed = self.set.remove(id);
        if changed {
            self.queue.lock().retain(|queued| queued != id);
        }
        changed
    }

    fn all(&self) -> Arc<[Database]> {
        self.set.get()
    }

    fn next(&self) -> Result<Database> {
        let snapshot = self.set.get();
        if snapshot.is_empty() {
            return Err(ClusterError::NoActiveDatabases);
        }
        let mut queue = self.queue.lock();
        // A slot can be stale if its database was removed between the
        // snapshot read and taking the queue lock; drop stale slots instead
        // of requeueing them.
        while let Some(id) = queue.pop_front() {
            if let Some(db) = snapshot.iter().find(|d| d.id == id) {
                queue.push_back(id);
                return Ok(db.clone());
            }
        }
        // Every active database has weight 0
        drop(queue);
        self.set.first()
    }
}

// ===========================================================================
// Load — minimize in-flight load / weight
// ===========================================================================

/// Tracks an in-flight call counter per database (incremented in
/// `before_invoke`, decremented in `after_invoke`) and routes to the
/// database minimizing `load / weight`. Weight 0 costs infinity; ties break
/// by raw load, then by id.
pub struct LoadBalancer {
    set: ActiveSet,
    load: DashMap<DatabaseId, Arc<AtomicU64>>,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            set: ActiveSet::new(),
            load: DashMap::new(),
        }
    }

    fn load_of(&self, id: &str) -> u64 {
        self.load
            .get(id)
            .map(|counter| counter.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for LoadBalancer {
    fn add(&self, db: Database) -> bool {
        let id = db.id.clone();
        let changed = self.set.add(db);
        if changed {
            self.load.entry(id).or_insert_with(|| Arc::new(AtomicU64::new(0)));
        }
        changed
    }

    fn remove(&self, id: &str) -> bool {
        let changed = self.set.remove(id);
        if changed {
            self.load.remove(id);
        }
        changed
    }

    fn all(&self) -> Arc<[Database]> {
        self.set.get()
    }

    fn next(&self) -> Result<Database> {
        let snapshot = self.set.get();
        let mut best: Option<(&Database, f64, u64)> = None;
        for db in snapshot.iter() {
            let load = self.load_of(&db.id);
            let cost = if db.weight == 0 {
                f64::INFINITY
            } else {
                load as f64 / db.weight as f64
            };
            let better = match best {
                None => true,
                Some((_, best_cost, best_load)) => {
                    cost < best_cost || (cost == best_cost && load < best_load)
                }
            };
            if better {
                best = Some((db, cost, load));
            }
        }
        best.map(|(db, _, _)| db.clone())
            .ok_or(ClusterError::NoActiveDatabases)
    }

    fn before_invoke(&self, id: &str) {
        if let Some(counter) = self.load.get(id) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn after_invoke(&self, id: &str) {
        if let Some(counter) = self.load.get(id) {
            // Saturating: a remove/re-add between the paired hooks must not
            // wrap the counter
            let _ = counter
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
    }
}
