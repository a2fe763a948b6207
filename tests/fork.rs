//! Child-after-fork behaviour, driven without an actual fork.
//!
//! Kept in its own binary: the handler bumps the process-wide fork epoch,
//! which would invalidate thread caches of unrelated tests running in the
//! same process.

use pgqlite::registry::Registry;
use pgqlite::statement::test_support::offline_record;

#[test]
fn child_reset_clears_thread_state_without_refcount_movement() {
    let registry = Registry::new();
    let record = offline_record("SELECT id FROM metadata_items");
    registry.register(0x4000, &record);
    registry.cache(0x4000, &record);
    assert_eq!(record.refcount(), 2);

    pgqlite::fork::child_after_fork();

    // The thread cache was dropped silently: the parent's refcount
    // bookkeeping does not apply in the child, so no release happened and
    // nothing was destroyed.
    assert_eq!(record.refcount(), 2);
    assert!(!record.is_destroyed());

    // The record is still reachable through the global view and can be
    // re-pinned; the cache unit is counted again.
    assert!(registry.lookup(0x4000).is_some());
    assert!(registry.lookup_cached(0x4000).is_some());
    assert_eq!(record.refcount(), 3);

    // A second reset clears the fresh pin the same way.
    pgqlite::fork::child_after_fork();
    assert_eq!(record.refcount(), 3);
    assert!(registry.lookup(0x4000).is_some());
}
