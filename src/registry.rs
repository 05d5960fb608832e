//! Process-wide bookkeeping of live instances and the per-thread "currently executing" slot.

use std::cell::Cell;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);
static ACTIVE_INSTANCES: Mutex<BTreeSet<InstanceId>> = Mutex::new(BTreeSet::new());

thread_local! {
    static CURRENT_INSTANCE: Cell<Option<InstanceId>> = const { Cell::new(None) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn next() -> Self {
        Self(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Initialized instances that have neither errored nor been deinitialized.
pub fn active_instances() -> Vec<InstanceId> {
    ACTIVE_INSTANCES.lock().unwrap_or_else(PoisonError::into_inner).iter().copied().collect()
}

pub fn is_active(id: InstanceId) -> bool {
    ACTIVE_INSTANCES.lock().unwrap_or_else(PoisonError::into_inner).contains(&id)
}

pub(crate) fn insert(id: InstanceId) {
    ACTIVE_INSTANCES.lock().unwrap_or_else(PoisonError::into_inner).insert(id);
}

pub(crate) fn remove(id: InstanceId) -> bool {
    ACTIVE_INSTANCES.lock().unwrap_or_else(PoisonError::into_inner).remove(&id)
}

/// Instance executing script code on this thread, if any.
pub fn current_instance() -> Option<InstanceId> {
    CURRENT_INSTANCE.with(Cell::get)
}

/// Occupies the current-instance slot until dropped.
#[must_use = "the slot is released as soon as the guard is dropped"]
pub struct ExecutionGuard {
    id: InstanceId,
}

impl ExecutionGuard {
    pub fn id(&self) -> InstanceId {
        self.id
    }
}

/// Claims the current-instance slot for `id`. An occupied slot means host code re-entered
/// scripting synchronously, which is an integration bug.
pub(crate) fn enter(id: InstanceId) -> ExecutionGuard {
    CURRENT_INSTANCE.with(|cell| {
        if let Some(occupant) = cell.get() {
            panic!("instance {id} entered while instance {occupant} is still executing");
        }
        cell.set(Some(id));
    });
    ExecutionGuard { id }
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        CURRENT_INSTANCE.with(|cell| cell.set(None));
    }
}
