//! Worker pool allocator
//!
//! Tracks idle worker handles and the appeal each allocated handle is bound
//! to. A handle is either idle in the pool or bound to exactly one appeal,
//! never both. Allocation is FIFO over announcement order.
//!
//! State is in-memory only; after a restart it rebuilds from subsequent
//! `FREE_WORKER` announcements.

use crate::ids::{AppealKey, WorkerHandle};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Outcome of an availability announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Duplicate announcement for a handle already idle
    AlreadyIdle,
    /// The handle is bound to an unresolved appeal; the binding is kept
    RejectedBound(AppealKey),
}

/// Outcome of returning a handle after its appeal finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Was bound to the given appeal, now idle
    Released,
    /// Was not bound (e.g. bindings lost on restart), now idle
    Adopted,
    /// Already idle, nothing changed
    AlreadyIdle,
    /// Bound to a different appeal; left untouched
    BoundElsewhere(AppealKey),
}

#[derive(Debug, Default)]
struct PoolInner {
    idle: VecDeque<WorkerHandle>,
    bound: HashMap<WorkerHandle, AppealKey>,
}

impl PoolInner {
    fn is_idle(&self, handle: &WorkerHandle) -> bool {
        self.idle.iter().any(|h| h == handle)
    }
}

/// Process-wide pool of worker handles
#[derive(Debug, Default)]
pub struct WorkerPool {
    inner: Mutex<PoolInner>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a handle into the idle set. Duplicate announcements are no-ops.
    pub fn add_handle(&self, handle: WorkerHandle) -> AddOutcome {
        let mut inner = self.lock();
        if let Some(key) = inner.bound.get(&handle) {
            return AddOutcome::RejectedBound(*key);
        }
        if inner.is_idle(&handle) {
            return AddOutcome::AlreadyIdle;
        }
        inner.idle.push_back(handle);
        AddOutcome::Added
    }

    /// Take the oldest idle handle and bind it to `key`.
    ///
    /// Returns `None` when no worker is available; never waits.
    pub fn allocate(&self, key: AppealKey) -> Option<WorkerHandle> {
        let mut inner = self.lock();
        let handle = inner.idle.pop_front()?;
        inner.bound.insert(handle.clone(), key);
        Some(handle)
    }

    /// Return a handle to the idle set after its appeal reached a terminal
    /// state on the worker side.
    pub fn release(&self, handle: &WorkerHandle, key: AppealKey) -> ReleaseOutcome {
        let mut inner = self.lock();
        match inner.bound.get(handle).copied() {
            Some(bound) if bound != key => ReleaseOutcome::BoundElsewhere(bound),
            Some(_) => {
                inner.bound.remove(handle);
                inner.idle.push_back(handle.clone());
                ReleaseOutcome::Released
            }
            None if inner.is_idle(handle) => ReleaseOutcome::AlreadyIdle,
            None => {
                inner.idle.push_back(handle.clone());
                ReleaseOutcome::Adopted
            }
        }
    }

    /// Drop the binding without returning the handle to the pool.
    ///
    /// Used when an appeal is abandoned: the worker is only trusted again
    /// after it announces itself with `FREE_WORKER`.
    pub fn unbind(&self, handle: &WorkerHandle, key: AppealKey) -> bool {
        let mut inner = self.lock();
        if inner.bound.get(handle) == Some(&key) {
            inner.bound.remove(handle);
            true
        } else {
            false
        }
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    #[allow(dead_code)] // Used in tests
    pub fn binding_of(&self, handle: &WorkerHandle) -> Option<AppealKey> {
        self.lock().bound.get(handle).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn h(name: &str) -> WorkerHandle {
        WorkerHandle::new(name)
    }

    #[test]
    fn test_allocates_in_announcement_order_then_runs_dry() {
        let pool = WorkerPool::new();
        pool.add_handle(h("A"));
        pool.add_handle(h("B"));

        assert_eq!(pool.allocate(AppealKey::new(1, 1)), Some(h("A")));
        assert_eq!(pool.allocate(AppealKey::new(1, 2)), Some(h("B")));
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.allocate(AppealKey::new(1, 3)), None);
    }

    #[test]
    fn test_duplicate_announcement_is_noop() {
        let pool = WorkerPool::new();
        assert_eq!(pool.add_handle(h("A")), AddOutcome::Added);
        assert_eq!(pool.add_handle(h("A")), AddOutcome::AlreadyIdle);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_free_worker_for_bound_handle_is_rejected() {
        let pool = WorkerPool::new();
        pool.add_handle(h("A"));
        let key = AppealKey::new(42, 7);
        let handle = pool.allocate(key).unwrap();

        assert_eq!(pool.add_handle(handle.clone()), AddOutcome::RejectedBound(key));
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.binding_of(&handle), Some(key));
    }

    #[test]
    fn test_release_only_for_matching_binding() {
        let pool = WorkerPool::new();
        pool.add_handle(h("A"));
        let first = AppealKey::new(42, 7);
        let handle = pool.allocate(first).unwrap();

        let other = AppealKey::new(42, 9);
        assert_eq!(pool.release(&handle, other), ReleaseOutcome::BoundElsewhere(first));
        assert_eq!(pool.idle_count(), 0);

        assert_eq!(pool.release(&handle, first), ReleaseOutcome::Released);
        assert_eq!(pool.release(&handle, first), ReleaseOutcome::AlreadyIdle);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_release_adopts_unknown_handle() {
        let pool = WorkerPool::new();
        assert_eq!(
            pool.release(&h("X"), AppealKey::new(1, 1)),
            ReleaseOutcome::Adopted
        );
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn test_unbind_does_not_return_handle() {
        let pool = WorkerPool::new();
        pool.add_handle(h("A"));
        let key = AppealKey::new(42, 7);
        let handle = pool.allocate(key).unwrap();

        assert!(pool.unbind(&handle, key));
        assert!(!pool.unbind(&handle, key));
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.add_handle(handle), AddOutcome::Added);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations_never_share_a_handle() {
        let pool = Arc::new(WorkerPool::new());
        for i in 0..50 {
            pool.add_handle(h(&format!("w{i}")));
        }

        let mut tasks = Vec::new();
        for i in 0..100 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move { pool.allocate(AppealKey::new(i, i)) }));
        }

        let mut seen = HashSet::new();
        let mut granted = 0;
        for task in tasks {
            if let Some(handle) = task.await.unwrap() {
                assert!(seen.insert(handle), "handle handed out twice");
                granted += 1;
            }
        }
        assert_eq!(granted, 50);
        assert_eq!(pool.idle_count(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8),
        Allocate(u8),
        Release(u8, u8),
        Unbind(u8, u8),
    }

    fn arb_op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6).prop_map(Op::Add),
            (0u8..6).prop_map(Op::Allocate),
            (0u8..6, 0u8..6).prop_map(|(w, a)| Op::Release(w, a)),
            (0u8..6, 0u8..6).prop_map(|(w, a)| Op::Unbind(w, a)),
        ]
    }

    proptest! {
        // A handle is idle XOR bound, and never idle twice
        #[test]
        fn prop_idle_and_bound_are_disjoint(ops in proptest::collection::vec(arb_op(), 0..60)) {
            let pool = WorkerPool::new();
            for op in ops {
                match op {
                    Op::Add(w) => { pool.add_handle(h(&format!("w{w}"))); }
                    Op::Allocate(a) => { pool.allocate(AppealKey::new(1, i64::from(a))); }
                    Op::Release(w, a) => { pool.release(&h(&format!("w{w}")), AppealKey::new(1, i64::from(a))); }
                    Op::Unbind(w, a) => { pool.unbind(&h(&format!("w{w}")), AppealKey::new(1, i64::from(a))); }
                }

                let inner = pool.lock();
                let idle: HashSet<_> = inner.idle.iter().cloned().collect();
                prop_assert_eq!(idle.len(), inner.idle.len(), "duplicate idle handle");
                for handle in inner.bound.keys() {
                    prop_assert!(!idle.contains(handle), "{} both idle and bound", handle);
                }
            }
        }
    }
}
