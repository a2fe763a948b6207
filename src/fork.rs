//! Fork lifecycle.
//!
//! The child inherits the parent's sockets, pool slots and thread-local
//! caches, none of which it may use. The child-after-fork handler swaps
//! the pool and rewriter cache innards, clears the calling thread's
//! locals, and bumps a process-wide epoch so any thread-local state that
//! somehow survives is discarded lazily on next touch.

use std::sync::atomic::{AtomicU64, Ordering};

static FORK_EPOCH: AtomicU64 = AtomicU64::new(0);

pub fn epoch() -> u64 {
    FORK_EPOCH.load(Ordering::Acquire)
}

fn bump_epoch() {
    FORK_EPOCH.fetch_add(1, Ordering::AcqRel);
}

unsafe extern "C" fn atfork_prepare() {}

unsafe extern "C" fn atfork_parent() {}

unsafe extern "C" fn atfork_child() {
    child_after_fork();
}

/// Reset engine state in the child. Public so tests can drive the same
/// path without an actual fork.
pub fn child_after_fork() {
    bump_epoch();
    if let Some(engine) = crate::try_engine() {
        engine.pool.reset_after_fork();
        engine.rewriter.reset_after_fork();
    }
    crate::registry::clear_thread_cache_after_fork();
    crate::statement::clear_thread_pins_after_fork();
    tracing::debug!("fork: child state reset, epoch {}", epoch());
}

pub fn install() {
    let rc = unsafe {
        libc::pthread_atfork(
            Some(atfork_prepare),
            Some(atfork_parent),
            Some(atfork_child),
        )
    };
    if rc != 0 {
        tracing::error!("fork: pthread_atfork failed rc={rc}");
    }
}
