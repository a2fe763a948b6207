//! The per-statement state machine.
//!
//! Every intercepted handle the engine manages is backed by one
//! [`StatementRecord`]: the shadow statement carrying the host's pointer,
//! the rewritten backend text, the parameter table, and, once executed,
//! the fully materialised result the cursor walks. A record borrows a pool
//! slot only for the span of one execute call; while a transaction is open
//! the slot stays pinned to the thread instead.

use std::cell::RefCell;
use std::ffi::CString;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use libc::{c_char, c_int, c_uchar, c_void};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use sqlite_interpose::{abi, shadow, SqliteApi};

use crate::db::DbRecord;
use crate::error::EngineError;
use crate::guard;
use crate::pool::SlotGuard;
use crate::rewrite::{self, RewriteFlags, Rewritten, StatementKind};
use crate::value::{SqlValue, TaggedValue};
use crate::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StmtState {
    Fresh,
    Prepared,
    Bound,
    Executing,
    Rows,
    Done,
    Finalized,
}

pub struct Materialised {
    pub columns: Vec<CString>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl Materialised {
    pub fn empty() -> Materialised {
        Materialised {
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }
}

pub struct StmtInner {
    pub state: StmtState,
    pub params: Vec<SqlValue>,
    pub result: Option<Materialised>,
    /// −1 before the first row, `rows.len()` when exhausted.
    pub cursor: isize,
    /// `column_value` boxes handed to the host; valid until the next
    /// step/reset, like the original library's.
    values_out: Vec<Box<TaggedValue>>,
}

pub struct StatementRecord {
    shadow: *mut abi::sqlite3_stmt,
    db: *mut abi::sqlite3,
    pub db_record: Arc<DbRecord>,
    pub original_sql: CString,
    pub rewritten: Arc<Rewritten>,
    /// True when the host never steps the shadow and execution happens on
    /// the backend. False for shadow-resident statements (the rewriter's
    /// call): their shadow carries the real SQL and every API call on the
    /// handle forwards to the original library.
    pub is_backend_only: bool,
    api: Option<&'static SqliteApi>,
    refcount: AtomicI32,
    destroyed: AtomicBool,
    /// Creating thread, for diagnostics only.
    pub creator: u64,
    pub inner: Mutex<StmtInner>,
    /// Out-of-band column buffers for values too large for the ring;
    /// released when the record dies.
    oob: Mutex<Vec<Box<[u8]>>>,
}

unsafe impl Send for StatementRecord {}
unsafe impl Sync for StatementRecord {}

impl std::fmt::Debug for StatementRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementRecord")
            .field("shadow", &self.shadow)
            .field("db", &self.db)
            .field("is_backend_only", &self.is_backend_only)
            .field("refcount", &self.refcount)
            .field("destroyed", &self.destroyed)
            .field("creator", &self.creator)
            .finish()
    }
}

impl StatementRecord {
    fn new(
        shadow: *mut abi::sqlite3_stmt,
        db: *mut abi::sqlite3,
        db_record: Arc<DbRecord>,
        original_sql: &str,
        rewritten: Arc<Rewritten>,
        api: Option<&'static SqliteApi>,
        premade: Option<Materialised>,
    ) -> Arc<StatementRecord> {
        let param_count = rewritten.param_count;
        let is_backend_only = rewritten.is_backend_only;
        let has_premade = premade.is_some();
        Arc::new(StatementRecord {
            shadow,
            db,
            db_record,
            original_sql: CString::new(original_sql.replace('\0', " ")).unwrap_or_default(),
            rewritten,
            is_backend_only,
            api,
            refcount: AtomicI32::new(1),
            destroyed: AtomicBool::new(false),
            creator: crate::pool::current_thread_id(),
            inner: Mutex::new(StmtInner {
                state: if has_premade { StmtState::Rows } else { StmtState::Prepared },
                params: vec![SqlValue::Null; param_count],
                result: premade,
                cursor: -1,
                values_out: Vec::new(),
            }),
            oob: Mutex::new(Vec::new()),
        })
    }

    /// The host-visible handle. The shadow statement pointer when one
    /// exists; the record address itself in inert (test) mode.
    pub fn handle(&self) -> usize {
        if self.shadow.is_null() {
            self as *const StatementRecord as usize
        } else {
            self.shadow as usize
        }
    }

    pub fn shadow_ptr(&self) -> *mut abi::sqlite3_stmt {
        self.shadow
    }

    pub fn db_ptr(&self) -> *mut abi::sqlite3 {
        self.db
    }

    pub fn retain(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one protocol reference, returning the remaining count. An
    /// underflow is a diagnostic and a no-op, never a crash in the host.
    pub fn release_ref(&self) -> i32 {
        let prev = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if prev <= 0 {
            self.refcount.fetch_add(1, Ordering::AcqRel);
            tracing::error!(
                "statement: refcount underflow on {:#x} (creator {})",
                self.handle(),
                self.creator
            );
            return 0;
        }
        prev - 1
    }

    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Tear down at refcount zero: finalize the shadow statement and mark
    /// the record dead. Idempotent.
    pub fn destroy(&self) {
        if self
            .destroyed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let mut inner = self.inner.lock();
        inner.state = StmtState::Finalized;
        inner.result = None;
        inner.values_out.clear();
        drop(inner);
        if let Some(api) = self.api {
            unsafe { shadow::finalize(api, self.shadow) };
        }
    }

    /// Park an oversized column rendering and hand back a stable pointer.
    fn park_oob(&self, data: &[u8]) -> *const c_uchar {
        let mut buf = Vec::with_capacity(data.len() + 1);
        buf.extend_from_slice(data);
        buf.push(0);
        let boxed = buf.into_boxed_slice();
        let ptr = boxed.as_ptr();
        self.oob.lock().push(boxed);
        ptr
    }
}

thread_local! {
    // Connection pinned per logical database while a transaction is open
    // on this thread, plus the fork epoch the pins belong to.
    static PINS: RefCell<(u64, FxHashMap<String, SlotGuard<postgres::Client>>)> =
        RefCell::new((crate::fork::epoch(), FxHashMap::default()));
}

fn take_pin(db_id: &str) -> Option<SlotGuard<postgres::Client>> {
    PINS.with(|p| {
        let mut pins = p.borrow_mut();
        if pins.0 != crate::fork::epoch() {
            // Child of a fork: the pinned guards point into the leaked
            // parent pool; dropping them only flips leaked slot state.
            pins.1.clear();
            pins.0 = crate::fork::epoch();
        }
        pins.1.remove(db_id)
    })
}

fn put_pin(db_id: String, guard: SlotGuard<postgres::Client>) {
    PINS.with(|p| {
        let mut pins = p.borrow_mut();
        pins.0 = crate::fork::epoch();
        pins.1.insert(db_id, guard);
    });
}

/// Child-side of fork: drop every pinned guard.
pub fn clear_thread_pins_after_fork() {
    let _ = PINS.try_with(|p| {
        if let Ok(mut pins) = p.try_borrow_mut() {
            pins.1.clear();
            pins.0 = crate::fork::epoch();
        }
    });
}

/// Run one statement on a claimed connection and materialise the outcome.
fn run_on_conn(
    client: &mut postgres::Client,
    rewritten: &Rewritten,
    params: &[SqlValue],
    db: &DbRecord,
    in_txn: bool,
) -> Result<Materialised, EngineError> {
    let refs: Vec<&(dyn postgres::types::ToSql + Sync)> =
        params.iter().map(|p| p as &(dyn postgres::types::ToSql + Sync)).collect();
    match rewritten.kind {
        StatementKind::Query => {
            let stmt = client
                .prepare(&rewritten.sql)
                .map_err(|e| EngineError::from_backend(&e))?;
            let rows = client
                .query(&stmt, &refs)
                .map_err(|e| EngineError::from_backend(&e))?;
            let columns = stmt
                .columns()
                .iter()
                .map(|c| CString::new(c.name()).unwrap_or_default())
                .collect();
            let mut data = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut cells = Vec::with_capacity(row.len());
                for i in 0..row.len() {
                    cells.push(row.try_get::<_, SqlValue>(i).unwrap_or(SqlValue::Null));
                }
                data.push(cells);
            }
            Ok(Materialised {
                columns,
                rows: data,
            })
        }
        StatementKind::Insert | StatementKind::Write => {
            let affected = client
                .execute(&rewritten.sql, &refs)
                .map_err(|e| EngineError::from_backend(&e))? as i64;
            db.changes.store(affected, Ordering::Relaxed);
            if rewritten.kind == StatementKind::Insert {
                // lastval() raises until a sequence fires in this session;
                // inside a transaction that would poison it, so the probe
                // runs under a savepoint there.
                if in_txn {
                    let _ = client.batch_execute("SAVEPOINT pgqlite_lastval");
                }
                match client.query_one("SELECT lastval()", &[]) {
                    Ok(row) => {
                        if let Ok(v) = row.try_get::<_, SqlValue>(0) {
                            db.last_rowid.store(v.as_int(), Ordering::Relaxed);
                        }
                    }
                    Err(_) if in_txn => {
                        let _ = client.batch_execute("ROLLBACK TO SAVEPOINT pgqlite_lastval");
                    }
                    Err(_) => {}
                }
                if in_txn {
                    let _ = client.batch_execute("RELEASE SAVEPOINT pgqlite_lastval");
                }
            }
            Ok(Materialised::empty())
        }
        StatementKind::Begin | StatementKind::TxnEnd | StatementKind::Release => {
            client
                .batch_execute(&rewritten.sql)
                .map_err(|e| EngineError::from_backend(&e))?;
            Ok(Materialised::empty())
        }
        StatementKind::Savepoint => {
            // An outermost bare savepoint opens a transaction, as it does
            // in SQLite; the backend rejects SAVEPOINT outside one.
            if !in_txn {
                client
                    .batch_execute("BEGIN")
                    .map_err(|e| EngineError::from_backend(&e))?;
            }
            match client.batch_execute(&rewritten.sql) {
                Ok(()) => Ok(Materialised::empty()),
                Err(e) => {
                    if !in_txn {
                        let _ = client.batch_execute("ROLLBACK");
                    }
                    Err(EngineError::from_backend(&e))
                }
            }
        }
    }
}

impl Engine {
    /// Classify, guard, rewrite and register one statement on a
    /// redirected database.
    pub fn prepare_redirected(
        &self,
        db: *mut abi::sqlite3,
        db_record: &Arc<DbRecord>,
        sql: &str,
    ) -> Result<Arc<StatementRecord>, EngineError> {
        let _depth = guard::enter_prepare(self.config.recursion_limit)?;
        let remaining = guard::remaining_stack();

        let lower = sql.to_ascii_lowercase();
        let on_deck = self
            .config
            .on_deck_markers
            .iter()
            .any(|m| lower.contains(m.as_str()));
        if on_deck && guard::on_deck_needs_empty_result(&self.config, remaining) {
            tracing::warn!(
                "statement: serving empty result for on-deck query under stack pressure ({} KB left)",
                remaining.map(|r| r / 1024).unwrap_or(0)
            );
            let rewritten = Arc::new(Rewritten {
                sql: String::new(),
                flags: RewriteFlags {
                    contains_on_deck_query: true,
                    ..RewriteFlags::default()
                },
                kind: StatementKind::Query,
                param_count: 0,
                is_backend_only: true,
            });
            return self.install_record(db, db_record, sql, rewritten, Some(Materialised::empty()));
        }

        let band = guard::classify(&self.config, remaining);
        if band == guard::StackBand::Critical {
            let remaining_kb = remaining.map(|r| r / 1024).unwrap_or(0);
            tracing::error!("statement: refusing prepare, stack critical at {remaining_kb} KB");
            return Err(EngineError::StackCritical { remaining_kb });
        }
        if band == guard::StackBand::Degraded {
            tracing::warn!(
                "statement: degraded rewrite, {} KB of stack left",
                remaining.map(|r| r / 1024).unwrap_or(0)
            );
        }

        let rewritten = self.rewriter.rewrite(
            &self.config,
            sql,
            band == guard::StackBand::Degraded,
        );
        self.install_record(db, db_record, sql, rewritten, None)
    }

    fn install_record(
        &self,
        db: *mut abi::sqlite3,
        db_record: &Arc<DbRecord>,
        sql: &str,
        rewritten: Arc<Rewritten>,
        premade: Option<Materialised>,
    ) -> Result<Arc<StatementRecord>, EngineError> {
        let shadow = match self.api {
            Some(api) => unsafe {
                // Shadow-resident statements get their real text; everything
                // else gets the no-op carrier.
                let result = if rewritten.is_backend_only {
                    shadow::prepare_noop(api, db)
                } else {
                    shadow::prepare(api, db, sql)
                };
                result.map_err(|e| EngineError::InternalInvariant {
                    message: e.to_string(),
                })?
            },
            None => std::ptr::null_mut(),
        };
        let record = StatementRecord::new(
            shadow,
            db,
            Arc::clone(db_record),
            sql,
            rewritten,
            self.api,
            premade,
        );
        let handle = record.handle();
        self.registry.register(handle, &record);
        self.registry.cache(handle, &record);
        tracing::debug!(
            "statement: prepared {:#x} on {}: {}",
            handle,
            db_record.db_id,
            record.rewritten.sql
        );
        Ok(record)
    }

    /// Store one parameter, 1-indexed. Rebinding after a result exists
    /// invalidates it so the next step re-executes with the new values.
    pub fn bind_value(&self, record: &StatementRecord, index: c_int, value: SqlValue) -> c_int {
        let mut inner = record.inner.lock();
        if inner.state == StmtState::Finalized {
            return abi::SQLITE_MISUSE;
        }
        if index < 1 || index as usize > inner.params.len() {
            return abi::SQLITE_RANGE;
        }
        if inner.result.is_some() && !record.rewritten.sql.is_empty() {
            inner.result = None;
            inner.cursor = -1;
            inner.values_out.clear();
        }
        let idx = index as usize - 1;
        inner.params[idx] = value;
        inner.state = StmtState::Bound;
        abi::SQLITE_OK
    }

    fn execute_locked(
        &self,
        record: &StatementRecord,
        inner: &mut StmtInner,
    ) -> Result<(), EngineError> {
        let db = &record.db_record;
        inner.state = StmtState::Executing;
        let taken = take_pin(&db.db_id);
        let pinned = taken.is_some();
        let mut guard = match taken {
            Some(g) => g,
            None => match self.pool.claim(&db.db_id) {
                Ok(g) => g,
                Err(err) => {
                    inner.state = StmtState::Prepared;
                    return Err(err);
                }
            },
        };

        let mut outcome =
            run_on_conn(guard.conn_mut(), &record.rewritten, &inner.params, db, pinned);
        if let Err(err) = &outcome {
            if err.is_connection_loss() && !pinned {
                tracing::warn!("statement: retrying once on a fresh connection: {err}");
                guard.discard();
                let mut fresh = match self.pool.claim(&db.db_id) {
                    Ok(g) => g,
                    Err(err) => {
                        inner.state = StmtState::Prepared;
                        return Err(err);
                    }
                };
                outcome =
                    run_on_conn(fresh.conn_mut(), &record.rewritten, &inner.params, db, false);
                guard = fresh;
            }
        }

        let keep_pin = match (&outcome, record.rewritten.kind) {
            (Ok(_), StatementKind::Begin | StatementKind::Savepoint) => true,
            (_, StatementKind::TxnEnd) => false,
            _ => pinned,
        };
        if keep_pin {
            put_pin(db.db_id.clone(), guard);
        } else {
            guard.release();
        }

        match outcome {
            Ok(result) => {
                inner.result = Some(result);
                inner.cursor = -1;
                inner.state = StmtState::Rows;
                Ok(())
            }
            Err(err) => {
                inner.state = StmtState::Prepared;
                Err(err)
            }
        }
    }

    /// Advance the cursor, executing on first call.
    pub fn step(&self, record: &StatementRecord) -> c_int {
        let mut inner = record.inner.lock();
        if inner.state == StmtState::Finalized {
            return abi::SQLITE_MISUSE;
        }
        if inner.result.is_none() {
            if let Err(err) = self.execute_locked(record, &mut inner) {
                let code = err.code();
                record.db_record.set_error(code, &err.to_string());
                tracing::debug!("statement: step failed on {:#x}: {err}", record.handle());
                return code;
            }
        }
        inner.values_out.clear();
        let rows = inner.result.as_ref().map(|r| r.rows.len()).unwrap_or(0) as isize;
        if inner.cursor + 1 < rows {
            inner.cursor += 1;
            inner.state = StmtState::Rows;
            abi::SQLITE_ROW
        } else {
            inner.cursor = rows;
            inner.state = StmtState::Done;
            abi::SQLITE_DONE
        }
    }

    /// Execute on demand so column metadata is available before the first
    /// step, leaving the cursor untouched at −1.
    pub fn ensure_metadata(&self, record: &StatementRecord) -> Result<(), EngineError> {
        let mut inner = record.inner.lock();
        if inner.result.is_some() || inner.state == StmtState::Finalized {
            return Ok(());
        }
        self.execute_locked(record, &mut inner).map_err(|err| {
            record.db_record.set_error(err.code(), &err.to_string());
            err
        })
    }

    /// Cursor back before the first row; the materialised result and the
    /// bindings stay.
    pub fn reset(&self, record: &StatementRecord) -> c_int {
        let mut inner = record.inner.lock();
        match inner.state {
            StmtState::Fresh | StmtState::Finalized => {}
            _ => {
                inner.cursor = -1;
                inner.values_out.clear();
                inner.state = StmtState::Prepared;
            }
        }
        abi::SQLITE_OK
    }

    pub fn clear_bindings(&self, record: &StatementRecord) -> c_int {
        let mut inner = record.inner.lock();
        for p in inner.params.iter_mut() {
            *p = SqlValue::Null;
        }
        abi::SQLITE_OK
    }

    /// The finalize protocol of the registry, plus shadow teardown at
    /// refcount zero. Unknown handles are a no-op.
    pub fn finalize_stmt(&self, handle: usize) -> c_int {
        self.registry.finalize(handle);
        abi::SQLITE_OK
    }

    pub fn column_count(&self, record: &StatementRecord) -> c_int {
        if self.ensure_metadata(record).is_err() {
            return 0;
        }
        let inner = record.inner.lock();
        inner
            .result
            .as_ref()
            .map(|r| r.columns.len() as c_int)
            .unwrap_or(0)
    }

    pub fn data_count(&self, record: &StatementRecord) -> c_int {
        let inner = record.inner.lock();
        match &inner.result {
            Some(r) if inner.cursor >= 0 && (inner.cursor as usize) < r.rows.len() => {
                r.columns.len() as c_int
            }
            _ => 0,
        }
    }

    pub fn column_name_ptr(&self, record: &StatementRecord, index: c_int) -> *const c_char {
        if self.ensure_metadata(record).is_err() {
            return std::ptr::null();
        }
        let inner = record.inner.lock();
        inner
            .result
            .as_ref()
            .and_then(|r| r.columns.get(index as usize))
            .map(|c| c.as_ptr())
            .unwrap_or(std::ptr::null())
    }

    fn with_cell<R>(
        &self,
        record: &StatementRecord,
        index: c_int,
        f: impl FnOnce(&SqlValue) -> R,
        default: R,
    ) -> R {
        if index < 0 {
            return default;
        }
        let inner = record.inner.lock();
        let Some(result) = &inner.result else {
            return default;
        };
        if inner.cursor < 0 || inner.cursor as usize >= result.rows.len() {
            return default;
        }
        match result.rows[inner.cursor as usize].get(index as usize) {
            Some(cell) => f(cell),
            None => default,
        }
    }

    pub fn column_type(&self, record: &StatementRecord, index: c_int) -> c_int {
        self.with_cell(record, index, |c| c.type_code(), abi::SQLITE_NULL)
    }

    pub fn column_int64(&self, record: &StatementRecord, index: c_int) -> i64 {
        self.with_cell(record, index, |c| c.as_int(), 0)
    }

    pub fn column_double(&self, record: &StatementRecord, index: c_int) -> f64 {
        self.with_cell(record, index, |c| c.as_double(), 0.0)
    }

    pub fn column_bytes(&self, record: &StatementRecord, index: c_int) -> c_int {
        self.with_cell(record, index, |c| c.byte_len() as c_int, 0)
    }

    /// Text pointer per the ring's stability contract; oversized values
    /// are parked on the record until finalize.
    pub fn column_text_ptr(&self, record: &StatementRecord, index: c_int) -> *const c_uchar {
        self.with_cell(
            record,
            index,
            |cell| match cell.render_text() {
                None => crate::colbuf::null_text() as *const c_uchar,
                Some(bytes) => match self.colbuf.claim(&bytes) {
                    Some(p) => p as *const c_uchar,
                    None => record.park_oob(&bytes),
                },
            },
            crate::colbuf::null_text() as *const c_uchar,
        )
    }

    pub fn column_blob_ptr(&self, record: &StatementRecord, index: c_int) -> *const c_void {
        if index < 0 {
            return std::ptr::null();
        }
        let inner = record.inner.lock();
        let Some(result) = &inner.result else {
            return std::ptr::null();
        };
        if inner.cursor < 0 || inner.cursor as usize >= result.rows.len() {
            return std::ptr::null();
        }
        match result.rows[inner.cursor as usize].get(index as usize) {
            // Pointers into the materialised row stay valid until the
            // result is replaced or the record dies.
            Some(cell) => match cell.blob_bytes() {
                Some(b) => b.as_ptr() as *const c_void,
                None => std::ptr::null(),
            },
            None => std::ptr::null(),
        }
    }

    pub fn column_value_ptr(
        &self,
        record: &StatementRecord,
        index: c_int,
    ) -> *mut abi::sqlite3_value {
        if index < 0 {
            return std::ptr::null_mut();
        }
        let mut inner = record.inner.lock();
        let Some(result) = &inner.result else {
            return std::ptr::null_mut();
        };
        if inner.cursor < 0 || inner.cursor as usize >= result.rows.len() {
            return std::ptr::null_mut();
        }
        let Some(cell) = result.rows[inner.cursor as usize]
            .get(index as usize)
            .cloned()
        else {
            return std::ptr::null_mut();
        };
        let mut boxed = TaggedValue::boxed(cell);
        let ptr = boxed.as_abi();
        inner.values_out.push(boxed);
        ptr
    }

    /// Rewritten text with the current bindings inlined as literals, in
    /// memory from the original allocator so the host's free works on it.
    pub fn expanded_sql_ptr(&self, record: &StatementRecord) -> *mut c_char {
        let Some(api) = self.api else {
            return std::ptr::null_mut();
        };
        let inner = record.inner.lock();
        let expanded = expand_sql(&record.rewritten.sql, &inner.params);
        drop(inner);
        unsafe { shadow::strdup(api, expanded.as_bytes()).unwrap_or(std::ptr::null_mut()) }
    }

    pub fn stmt_busy(&self, record: &StatementRecord) -> c_int {
        let inner = record.inner.lock();
        let live = inner.state == StmtState::Rows && inner.cursor >= 0;
        c_int::from(live)
    }

    pub fn stmt_readonly(&self, record: &StatementRecord) -> c_int {
        c_int::from(record.rewritten.kind == StatementKind::Query)
    }
}

/// Render `$n` placeholders as SQL literals.
fn expand_sql(sql: &str, params: &[SqlValue]) -> String {
    let mut out = String::with_capacity(sql.len() + 16 * params.len());
    let bytes = sql.as_bytes();
    let mut i = 0;
    let mut in_str = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_str {
            out.push(c);
            if c == '\'' {
                in_str = false;
            }
            i += 1;
            continue;
        }
        match c {
            '\'' => {
                in_str = true;
                out.push(c);
                i += 1;
            }
            '$' if i + 1 < bytes.len() && bytes[i + 1].is_ascii_digit() => {
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                let n: usize = sql[i + 1..j].parse().unwrap_or(0);
                match n.checked_sub(1).and_then(|k| params.get(k)) {
                    Some(SqlValue::Null) | None => out.push_str("NULL"),
                    Some(SqlValue::Int(v)) => out.push_str(&v.to_string()),
                    Some(SqlValue::Float(v)) => out.push_str(&crate::value::render_float(*v)),
                    Some(SqlValue::Text(s)) => {
                        out.push('\'');
                        out.push_str(&s.replace('\'', "''"));
                        out.push('\'');
                    }
                    Some(SqlValue::Blob(b)) => {
                        out.push_str("X'");
                        for byte in b {
                            out.push_str(&format!("{byte:02x}"));
                        }
                        out.push('\'');
                    }
                }
                i = j;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Helpers for tests that need records without a live backend or a real
/// shadow statement.
#[doc(hidden)]
pub mod test_support {
    use super::*;

    pub fn offline_record(sql: &str) -> Arc<StatementRecord> {
        let cfg = crate::config::Config::from_env();
        let rewritten = Arc::new(rewrite::rewrite_uncached(&cfg, sql, false));
        StatementRecord::new(
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            DbRecord::new("/tmp/pgqlite-test.db"),
            sql,
            rewritten,
            None,
            None,
        )
    }

    pub fn inject_result(record: &StatementRecord, columns: &[&str], rows: Vec<Vec<SqlValue>>) {
        let mut inner = record.inner.lock();
        inner.result = Some(Materialised {
            columns: columns
                .iter()
                .map(|c| CString::new(*c).unwrap())
                .collect(),
            rows,
        });
        inner.cursor = -1;
        inner.state = StmtState::Rows;
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use std::ffi::CStr;

    fn engine() -> Engine {
        Engine::inert_for_tests()
    }

    fn two_row_record() -> Arc<StatementRecord> {
        let rec = offline_record("SELECT id, title FROM metadata_items");
        inject_result(
            &rec,
            &["id", "title"],
            vec![
                vec![SqlValue::Int(42), SqlValue::Text("Alien".into())],
                vec![SqlValue::Int(43), SqlValue::Null],
            ],
        );
        rec
    }

    #[test]
    fn cursor_walks_rows_then_sticks_on_done() {
        let eng = engine();
        let rec = two_row_record();
        assert_eq!(eng.step(&rec), abi::SQLITE_ROW);
        assert_eq!(eng.column_int64(&rec, 0), 42);
        assert_eq!(eng.step(&rec), abi::SQLITE_ROW);
        assert_eq!(eng.step(&rec), abi::SQLITE_DONE);
        // Exhausted cursor: repeatable, no side effects.
        assert_eq!(eng.step(&rec), abi::SQLITE_DONE);
        assert_eq!(eng.step(&rec), abi::SQLITE_DONE);
    }

    #[test]
    fn reset_rewinds_without_reexecuting() {
        let eng = engine();
        let rec = two_row_record();
        assert_eq!(eng.step(&rec), abi::SQLITE_ROW);
        assert_eq!(eng.reset(&rec), abi::SQLITE_OK);
        assert_eq!(eng.step(&rec), abi::SQLITE_ROW);
        assert_eq!(eng.column_int64(&rec, 0), 42);
    }

    #[test]
    fn reset_on_fresh_record_is_a_noop() {
        let eng = engine();
        let rec = offline_record("SELECT 1");
        {
            let mut inner = rec.inner.lock();
            inner.state = StmtState::Fresh;
        }
        assert_eq!(eng.reset(&rec), abi::SQLITE_OK);
        assert_eq!(rec.inner.lock().state, StmtState::Fresh);
    }

    #[test]
    fn column_accessors_read_the_current_row() {
        let eng = engine();
        let rec = two_row_record();
        eng.step(&rec);
        assert_eq!(eng.column_count(&rec), 2);
        assert_eq!(eng.data_count(&rec), 2);
        assert_eq!(eng.column_type(&rec, 0), abi::SQLITE_INTEGER);
        assert_eq!(eng.column_type(&rec, 1), abi::SQLITE_TEXT);
        let name = unsafe { CStr::from_ptr(eng.column_name_ptr(&rec, 1)) };
        assert_eq!(name.to_str().unwrap(), "title");
        let text = unsafe { CStr::from_ptr(eng.column_text_ptr(&rec, 1) as *const c_char) };
        assert_eq!(text.to_str().unwrap(), "Alien");
        assert_eq!(eng.column_bytes(&rec, 1), 5);
        assert_eq!(eng.column_double(&rec, 0), 42.0);
    }

    #[test]
    fn null_columns_have_stable_empty_text_and_null_type() {
        let eng = engine();
        let rec = two_row_record();
        eng.step(&rec);
        eng.step(&rec);
        assert_eq!(eng.column_type(&rec, 1), abi::SQLITE_NULL);
        let p = eng.column_text_ptr(&rec, 1);
        assert_eq!(p, crate::colbuf::null_text() as *const c_uchar);
        assert!(eng.column_blob_ptr(&rec, 1).is_null());
        assert_eq!(eng.column_bytes(&rec, 1), 0);
    }

    #[test]
    fn out_of_range_columns_are_harmless() {
        let eng = engine();
        let rec = two_row_record();
        eng.step(&rec);
        assert_eq!(eng.column_type(&rec, 7), abi::SQLITE_NULL);
        assert_eq!(eng.column_int64(&rec, 7), 0);
        assert!(eng.column_name_ptr(&rec, 7).is_null());
        assert_eq!(eng.column_type(&rec, -1), abi::SQLITE_NULL);
    }

    #[test]
    fn bind_range_checks() {
        let eng = engine();
        let rec = offline_record("SELECT * FROM plugins WHERE id = ? AND name = ?");
        assert_eq!(rec.rewritten.param_count, 2);
        assert_eq!(eng.bind_value(&rec, 0, SqlValue::Int(1)), abi::SQLITE_RANGE);
        assert_eq!(eng.bind_value(&rec, 3, SqlValue::Int(1)), abi::SQLITE_RANGE);
        assert_eq!(eng.bind_value(&rec, 1, SqlValue::Int(1)), abi::SQLITE_OK);
        assert_eq!(
            eng.bind_value(&rec, 2, SqlValue::Text("x".into())),
            abi::SQLITE_OK
        );
        assert_eq!(rec.inner.lock().state, StmtState::Bound);
    }

    #[test]
    fn rebind_after_result_invalidates_it() {
        let eng = engine();
        let rec = offline_record("SELECT * FROM plugins WHERE id = ?");
        inject_result(&rec, &["id"], vec![vec![SqlValue::Int(1)]]);
        assert_eq!(eng.step(&rec), abi::SQLITE_ROW);
        eng.reset(&rec);
        assert_eq!(eng.bind_value(&rec, 1, SqlValue::Int(2)), abi::SQLITE_OK);
        assert!(rec.inner.lock().result.is_none());
    }

    #[test]
    fn clear_bindings_nulls_all_parameters() {
        let eng = engine();
        let rec = offline_record("SELECT * FROM plugins WHERE id = ? AND name = ?");
        eng.bind_value(&rec, 1, SqlValue::Int(5));
        eng.clear_bindings(&rec);
        let inner = rec.inner.lock();
        assert!(inner.params.iter().all(|p| *p == SqlValue::Null));
    }

    #[test]
    fn metadata_before_step_leaves_cursor_before_first_row() {
        let eng = engine();
        let rec = two_row_record();
        // Result already materialised: metadata must not move the cursor.
        assert_eq!(eng.column_count(&rec), 2);
        assert_eq!(eng.step(&rec), abi::SQLITE_ROW);
        assert_eq!(eng.column_int64(&rec, 0), 42);
    }

    #[test]
    fn column_value_carries_the_tag() {
        let eng = engine();
        let rec = two_row_record();
        eng.step(&rec);
        let p = eng.column_value_ptr(&rec, 0);
        let tv = unsafe { TaggedValue::from_abi(p) }.unwrap();
        assert_eq!(tv.value.as_int(), 42);
    }

    #[test]
    fn step_without_backend_reports_cantopen() {
        let eng = engine();
        let rec = offline_record("SELECT * FROM plugins");
        // No PostgreSQL behind the inert engine: the claim-time connect
        // fails and surfaces as cannot-open.
        let code = eng.step(&rec);
        assert_eq!(code, abi::SQLITE_CANTOPEN);
        assert_eq!(rec.db_record.error_code(), abi::SQLITE_CANTOPEN);
    }

    #[test]
    fn empty_premade_result_steps_straight_to_done() {
        let eng = engine();
        let rec = offline_record("SELECT 1");
        inject_result(&rec, &[], Vec::new());
        assert_eq!(eng.step(&rec), abi::SQLITE_DONE);
    }

    #[test]
    fn expanded_sql_inlines_bindings() {
        let expanded = expand_sql(
            "SELECT * FROM t WHERE a = $1 AND b = $2 AND c = $3 AND d = $4",
            &[
                SqlValue::Int(7),
                SqlValue::Text("it's".into()),
                SqlValue::Null,
                SqlValue::Blob(vec![0xde, 0xad]),
            ],
        );
        assert_eq!(
            expanded,
            "SELECT * FROM t WHERE a = 7 AND b = 'it''s' AND c = NULL AND d = X'dead'"
        );
    }

    #[test]
    fn expand_leaves_dollar_in_strings_alone() {
        let expanded = expand_sql("SELECT '$1' WHERE a = $1", &[SqlValue::Int(3)]);
        assert_eq!(expanded, "SELECT '$1' WHERE a = 3");
    }

    #[test]
    fn backend_only_flag_follows_the_rewriter() {
        assert!(two_row_record().is_backend_only);
        let catalog = offline_record("SELECT name FROM sqlite_master");
        assert!(!catalog.is_backend_only);
    }

    #[test]
    fn stmt_flags() {
        let eng = engine();
        let rec = two_row_record();
        assert_eq!(eng.stmt_readonly(&rec), 1);
        assert_eq!(eng.stmt_busy(&rec), 0);
        eng.step(&rec);
        assert_eq!(eng.stmt_busy(&rec), 1);
        eng.step(&rec);
        eng.step(&rec);
        assert_eq!(eng.stmt_busy(&rec), 0);

        let w = offline_record("UPDATE plugins SET name = 'x'");
        assert_eq!(eng.stmt_readonly(&w), 0);
    }

    #[test]
    fn destroy_is_idempotent() {
        let rec = offline_record("SELECT 1");
        rec.destroy();
        assert!(rec.is_destroyed());
        rec.destroy();
        assert_eq!(rec.inner.lock().state, StmtState::Finalized);
    }
}
