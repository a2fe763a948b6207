//! Backend connection pool.
//!
//! Fixed-capacity slot arrays per logical database. Slot state is a single
//! atomic driven by CAS; the owning-thread field is only ever written by
//! the thread that won the Free→Claimed transition, so no lock is held
//! around backend I/O. Fork safety swaps the whole slot table out from
//! under the child without ever touching a socket the parent owns.

use std::cell::UnsafeCell;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::error::EngineError;

/// Opens one backend connection per call. A trait so the slot machinery is
/// exercisable without a live server.
pub trait Backend: Send + Sync + 'static {
    type Conn: Send;

    fn connect(&self, db_id: &str) -> Result<Self::Conn, EngineError>;
}

/// The production backend.
pub struct PgBackend {
    conninfo: String,
}

impl PgBackend {
    pub fn new(conninfo: String) -> PgBackend {
        PgBackend { conninfo }
    }
}

impl Backend for PgBackend {
    type Conn = postgres::Client;

    fn connect(&self, db_id: &str) -> Result<postgres::Client, EngineError> {
        tracing::info!("pool: opening backend connection for {db_id}");
        postgres::Client::connect(&self.conninfo, postgres::NoTls).map_err(|e| {
            EngineError::ConnectionLost {
                message: e.to_string(),
            }
        })
    }
}

pub const STATE_FREE: u8 = 0;
pub const STATE_CLAIMED: u8 = 1;
pub const STATE_IN_USE: u8 = 2;
pub const STATE_DYING: u8 = 3;

pub fn current_thread_id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub struct Slot<C> {
    state: AtomicU8,
    owner: AtomicU64,
    generation: AtomicU64,
    last_used: AtomicU64,
    // Only the thread that won the Free→Claimed CAS touches the cell.
    conn: UnsafeCell<Option<C>>,
}

unsafe impl<C: Send> Sync for Slot<C> {}

impl<C> Slot<C> {
    fn new() -> Slot<C> {
        Slot {
            state: AtomicU8::new(STATE_FREE),
            owner: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            last_used: AtomicU64::new(0),
            conn: UnsafeCell::new(None),
        }
    }

    pub fn state(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> u64 {
        self.owner.load(Ordering::Relaxed)
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Relaxed)
    }
}

pub struct Shard<C> {
    slots: Box<[Slot<C>]>,
}

impl<C> Shard<C> {
    fn new(capacity: usize) -> Shard<C> {
        Shard {
            slots: (0..capacity).map(|_| Slot::new()).collect(),
        }
    }

    pub fn slots(&self) -> &[Slot<C>] {
        &self.slots
    }
}

struct PoolInner<C> {
    shards: RwLock<FxHashMap<String, Arc<Shard<C>>>>,
}

impl<C> Default for PoolInner<C> {
    fn default() -> Self {
        PoolInner {
            shards: RwLock::new(FxHashMap::default()),
        }
    }
}

/// A claimed slot. Releasing returns it to the pool with the connection
/// kept warm; discarding drops the connection (slot recycles cold).
pub struct SlotGuard<C: Send + 'static> {
    shard: Arc<Shard<C>>,
    index: usize,
    done: bool,
}

impl<C: Send + 'static> std::fmt::Debug for SlotGuard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("index", &self.index)
            .field("done", &self.done)
            .finish()
    }
}

impl<C: Send + 'static> SlotGuard<C> {
    fn slot(&self) -> &Slot<C> {
        &self.shard.slots[self.index]
    }

    pub fn generation(&self) -> u64 {
        self.slot().generation()
    }

    pub fn conn_mut(&mut self) -> &mut C {
        // Invariant: InUse slots always carry a connection.
        unsafe { (*self.slot().conn.get()).as_mut().expect("claimed slot has a connection") }
    }

    /// Return the slot, keeping the backend connection for the next claim.
    pub fn release(mut self) {
        self.unlatch(false);
    }

    /// Drop the backend connection and free the slot cold. Used when the
    /// connection is known broken.
    pub fn discard(mut self) {
        self.unlatch(true);
    }

    fn unlatch(&mut self, drop_conn: bool) {
        if self.done {
            return;
        }
        self.done = true;
        let slot = &self.shard.slots[self.index];
        if drop_conn {
            unsafe {
                *slot.conn.get() = None;
            }
        }
        slot.owner.store(0, Ordering::Relaxed);
        slot.generation.fetch_add(1, Ordering::Relaxed);
        slot.last_used.store(unix_now(), Ordering::Relaxed);
        slot.state.store(STATE_FREE, Ordering::Release);
    }
}

impl<C: Send + 'static> Drop for SlotGuard<C> {
    fn drop(&mut self) {
        self.unlatch(false);
    }
}

thread_local! {
    // Slot index this thread last used per logical database; the
    // optimistic claim path tries it first and needs no lock.
    static AFFINITY: std::cell::RefCell<FxHashMap<String, usize>> =
        std::cell::RefCell::new(FxHashMap::default());
}

pub struct Pool<B: Backend> {
    backend: B,
    capacity: usize,
    claim_timeout: Duration,
    inner: ArcSwap<PoolInner<B::Conn>>,
}

impl<B: Backend> Pool<B> {
    pub fn new(backend: B, capacity: usize, claim_timeout: Duration) -> Pool<B> {
        Pool {
            backend,
            capacity,
            claim_timeout,
            inner: ArcSwap::from_pointee(PoolInner::default()),
        }
    }

    fn shard(&self, db_id: &str) -> Arc<Shard<B::Conn>> {
        let inner = self.inner.load();
        if let Some(shard) = inner.shards.read().get(db_id) {
            return Arc::clone(shard);
        }
        let mut shards = inner.shards.write();
        Arc::clone(
            shards
                .entry(db_id.to_string())
                .or_insert_with(|| Arc::new(Shard::new(self.capacity))),
        )
    }

    /// Claim a slot for the calling thread.
    pub fn claim(&self, db_id: &str) -> Result<SlotGuard<B::Conn>, EngineError> {
        let shard = self.shard(db_id);
        let me = current_thread_id();
        let started = Instant::now();
        let hint = AFFINITY.with(|a| a.borrow().get(db_id).copied());
        loop {
            let order = hint
                .into_iter()
                .chain(0..shard.slots.len())
                .take(shard.slots.len() + 1);
            for idx in order {
                let slot = &shard.slots[idx];
                if slot
                    .state
                    .compare_exchange(
                        STATE_FREE,
                        STATE_CLAIMED,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    )
                    .is_err()
                {
                    continue;
                }
                slot.owner.store(me, Ordering::Relaxed);
                slot.generation.fetch_add(1, Ordering::Relaxed);
                let conn = unsafe { &mut *slot.conn.get() };
                if conn.is_none() {
                    match self.backend.connect(db_id) {
                        Ok(c) => *conn = Some(c),
                        Err(e) => {
                            slot.owner.store(0, Ordering::Relaxed);
                            slot.state.store(STATE_FREE, Ordering::Release);
                            return Err(e);
                        }
                    }
                }
                slot.state.store(STATE_IN_USE, Ordering::Release);
                AFFINITY.with(|a| {
                    a.borrow_mut().insert(db_id.to_string(), idx);
                });
                return Ok(SlotGuard {
                    shard,
                    index: idx,
                    done: false,
                });
            }
            if started.elapsed() >= self.claim_timeout {
                return Err(EngineError::PoolExhausted {
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Shut the pool down, closing every backend connection. Nothing calls
    /// this on host exit (teardown is intentionally skipped); it exists for
    /// explicit shutdown paths and tests.
    pub fn close_all(&self) {
        self.inner.store(Arc::new(PoolInner::default()));
    }

    /// Child-side of fork. The slot table is replaced wholesale and the
    /// old one deliberately leaked: every inherited connection wraps a
    /// socket the parent still owns, and dropping a client would send a
    /// Terminate message down it.
    pub fn reset_after_fork(&self) {
        let fresh = Arc::new(PoolInner::default());
        let old = self.inner.swap(fresh);
        std::mem::forget(old);
        AFFINITY.with(|a| a.borrow_mut().clear());
    }

    /// Observe a shard's slots, for diagnostics and tests.
    pub fn inspect(&self, db_id: &str) -> Option<Arc<Shard<B::Conn>>> {
        self.inner.load().shards.read().get(db_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct TestBackend {
        connects: AtomicUsize,
        fail: bool,
    }

    impl TestBackend {
        fn new() -> TestBackend {
            TestBackend {
                connects: AtomicUsize::new(0),
                fail: false,
            }
        }
    }

    impl Backend for TestBackend {
        type Conn = usize;

        fn connect(&self, _db_id: &str) -> Result<usize, EngineError> {
            if self.fail {
                return Err(EngineError::ConnectionLost {
                    message: "refused".into(),
                });
            }
            Ok(self.connects.fetch_add(1, Ordering::SeqCst))
        }
    }

    fn pool(capacity: usize) -> Pool<TestBackend> {
        Pool::new(TestBackend::new(), capacity, Duration::from_millis(50))
    }

    #[test]
    fn claim_transitions_free_to_in_use() {
        let p = pool(2);
        let g = p.claim("db").unwrap();
        let shard = p.inspect("db").unwrap();
        assert_eq!(shard.slots()[0].state(), STATE_IN_USE);
        assert_eq!(shard.slots()[0].owner(), current_thread_id());
        assert_eq!(g.generation(), 1);
        g.release();
        assert_eq!(shard.slots()[0].state(), STATE_FREE);
        assert_eq!(shard.slots()[0].owner(), 0);
        assert_eq!(shard.slots()[0].generation(), 2);
    }

    #[test]
    fn release_keeps_the_connection_warm() {
        let p = pool(1);
        let mut g = p.claim("db").unwrap();
        assert_eq!(*g.conn_mut(), 0);
        g.release();
        let mut g = p.claim("db").unwrap();
        // Same connection object, no second connect.
        assert_eq!(*g.conn_mut(), 0);
        g.discard();
        let mut g = p.claim("db").unwrap();
        assert_eq!(*g.conn_mut(), 1);
    }

    #[test]
    fn affinity_prefers_the_last_slot() {
        let p = pool(4);
        let g = p.claim("db").unwrap();
        let first_idx_gen = g.generation();
        g.release();
        let g = p.claim("db").unwrap();
        // Generation keeps rising on the same slot: claim, release, claim.
        assert_eq!(g.generation(), first_idx_gen + 2);
    }

    #[test]
    fn exhausted_pool_times_out_busy() {
        let p = pool(1);
        let _held = p.claim("db").unwrap();
        let err = p.claim("db").unwrap_err();
        assert!(matches!(err, EngineError::PoolExhausted { .. }));
        assert_eq!(err.code(), sqlite_interpose::abi::SQLITE_BUSY);
    }

    #[test]
    fn blocked_claim_wakes_when_released() {
        let p = Arc::new(Pool::new(
            TestBackend::new(),
            1,
            Duration::from_millis(2000),
        ));
        let g = p.claim("db").unwrap();
        let p2 = Arc::clone(&p);
        let waiter = std::thread::spawn(move || p2.claim("db").map(|g| g.release()));
        std::thread::sleep(Duration::from_millis(20));
        g.release();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn shards_are_independent_per_database() {
        let p = pool(1);
        let _a = p.claim("db-a").unwrap();
        let b = p.claim("db-b").unwrap();
        b.release();
    }

    #[test]
    fn connect_failure_frees_the_slot() {
        let mut backend = TestBackend::new();
        backend.fail = true;
        let p = Pool::new(backend, 1, Duration::from_millis(50));
        assert!(p.claim("db").is_err());
        let shard = p.inspect("db").unwrap();
        assert_eq!(shard.slots()[0].state(), STATE_FREE);
    }

    #[test]
    fn fork_reset_leaves_every_slot_free_and_cold() {
        let p = pool(2);
        let g = p.claim("db").unwrap();
        // Simulate the child: the guard the parent thread held is dead.
        std::mem::forget(g);
        p.reset_after_fork();
        assert!(p.inspect("db").is_none());
        let g = p.claim("db").unwrap();
        // Fresh shard: first claim is generation 1 again.
        assert_eq!(g.generation(), 1);
    }

    #[test]
    fn guard_drop_releases() {
        let p = pool(1);
        {
            let _g = p.claim("db").unwrap();
        }
        let shard = p.inspect("db").unwrap();
        assert_eq!(shard.slots()[0].state(), STATE_FREE);
    }
}
