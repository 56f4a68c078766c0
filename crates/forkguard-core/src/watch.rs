//! Watch list: lock-guarded resources inspected at every fork in addition to
//! the two standard streams.

use std::fmt;
use std::sync::Arc;

use crate::error::ForkGuardError;
use crate::streams::LockGuarded;

/// Resources the coordinator inspects at fork time, in insertion order.
///
/// Each entry keeps the resource alive. There is no unwatch; the list only
/// shrinks at teardown. Watching the same resource twice is a no-op.
#[derive(Default, Clone)]
pub struct WatchList {
    entries: Vec<Arc<dyn LockGuarded>>,
}

impl fmt::Debug for WatchList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchList")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl WatchList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `resource` to the list.
    ///
    /// Returns `Ok(false)` if the same resource (by identity) is already
    /// watched. Resources without a lock are rejected up front so that fixup
    /// never meets an unexpected shape.
    pub fn watch(&mut self, resource: Arc<dyn LockGuarded>) -> Result<bool, ForkGuardError> {
        if resource.fork_lock().is_none() {
            return Err(ForkGuardError::InvalidResource {
                reason: "resource does not expose a lock",
            });
        }
        if self.contains(&resource) {
            return Ok(false);
        }
        self.entries
            .try_reserve(1)
            .map_err(|_| ForkGuardError::OutOfMemory {
                what: "watched resource",
            })?;
        self.entries.push(resource);
        Ok(true)
    }

    #[must_use]
    pub fn contains(&self, resource: &Arc<dyn LockGuarded>) -> bool {
        self.entries
            .iter()
            .any(|entry| std::ptr::addr_eq(Arc::as_ptr(entry), Arc::as_ptr(resource)))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn LockGuarded>> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::lock::ForkLock;

    struct Lockless;

    impl LockGuarded for Lockless {
        fn fork_lock(&self) -> Option<&dyn ForkLock> {
            None
        }
    }

    #[test]
    fn rejects_resources_without_a_lock() {
        let mut list = WatchList::new();
        let err = list.watch(Arc::new(Lockless)).unwrap_err();
        assert!(matches!(err, ForkGuardError::InvalidResource { .. }));
        assert!(list.is_empty());
    }

    #[test]
    fn watches_in_insertion_order_without_duplicates() {
        let mut list = WatchList::new();
        let first: Arc<dyn LockGuarded> = Arc::new(Mutex::new(1_u8));
        let second: Arc<dyn LockGuarded> = Arc::new(Mutex::new(2_u8));

        assert!(list.watch(Arc::clone(&first)).unwrap());
        assert!(list.watch(Arc::clone(&second)).unwrap());
        assert!(!list.watch(Arc::clone(&first)).unwrap());

        assert_eq!(list.len(), 2);
        let order: Vec<bool> = list
            .iter()
            .map(|entry| std::ptr::addr_eq(Arc::as_ptr(entry), Arc::as_ptr(&first)))
            .collect();
        assert_eq!(order, vec![true, false]);
    }

    #[test]
    fn watched_resource_stays_alive() {
        let mut list = WatchList::new();
        let resource = Arc::new(Mutex::new(()));
        list.watch(resource.clone()).unwrap();
        assert_eq!(Arc::strong_count(&resource), 2);
        list.clear();
        assert_eq!(Arc::strong_count(&resource), 1);
    }
}
