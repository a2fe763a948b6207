//! Per-database records behind the host's connection handles.
//!
//! The host keeps talking to a real `sqlite3*` (the shadow database); the
//! engine keeps one record per handle with the redirect decision, the
//! per-connection error surface, and the write counters `changes` and
//! `last_insert_rowid` are served from.

use std::ffi::CString;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use libc::{c_char, c_int};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use sqlite_interpose::abi;

pub struct DbRecord {
    pub path: String,
    /// Logical identifier keying the connection pool.
    pub db_id: String,
    /// Whether statements on this handle go to the backend at all.
    pub redirect: bool,
    last_error: Mutex<(c_int, CString)>,
    pub changes: AtomicI64,
    pub last_rowid: AtomicI64,
}

impl DbRecord {
    pub fn new(path: &str) -> Arc<DbRecord> {
        Arc::new(DbRecord {
            path: path.to_string(),
            db_id: path.to_string(),
            redirect: should_redirect(path),
            last_error: Mutex::new((abi::SQLITE_OK, CString::default())),
            changes: AtomicI64::new(0),
            last_rowid: AtomicI64::new(0),
        })
    }

    pub fn set_error(&self, code: c_int, message: &str) {
        let msg = CString::new(message.replace('\0', " ")).unwrap_or_default();
        *self.last_error.lock() = (code, msg);
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = (abi::SQLITE_OK, CString::default());
    }

    pub fn error_code(&self) -> c_int {
        self.last_error.lock().0
    }

    /// Pointer to the most recent message. Valid until the next error on
    /// this database, which matches what the host expects from `errmsg`.
    pub fn error_message_ptr(&self) -> *const c_char {
        self.last_error.lock().1.as_ptr()
    }
}

/// Memory-backed and temporary databases stay with the original SQLite
/// wholesale; file-backed ones are redirected.
pub fn should_redirect(path: &str) -> bool {
    let trimmed = path.trim();
    !(trimmed.is_empty()
        || trimmed == ":memory:"
        || trimmed.starts_with("file::memory:")
        || trimmed.contains("mode=memory"))
}

#[derive(Default)]
pub struct DbRegistry {
    map: RwLock<FxHashMap<usize, Arc<DbRecord>>>,
}

impl DbRegistry {
    pub fn register(&self, handle: usize, record: Arc<DbRecord>) {
        self.map.write().insert(handle, record);
    }

    pub fn lookup(&self, handle: usize) -> Option<Arc<DbRecord>> {
        self.map.read().get(&handle).cloned()
    }

    pub fn remove(&self, handle: usize) -> Option<Arc<DbRecord>> {
        self.map.write().remove(&handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_decision() {
        assert!(should_redirect("/data/com.plexapp.plugins.library.db"));
        assert!(!should_redirect(":memory:"));
        assert!(!should_redirect(""));
        assert!(!should_redirect("   "));
        assert!(!should_redirect("file::memory:?cache=shared"));
        assert!(!should_redirect("file:x.db?mode=memory"));
    }

    #[test]
    fn error_surface_roundtrip() {
        let db = DbRecord::new("/tmp/x.db");
        assert_eq!(db.error_code(), abi::SQLITE_OK);
        db.set_error(abi::SQLITE_CONSTRAINT, "duplicate key value");
        assert_eq!(db.error_code(), abi::SQLITE_CONSTRAINT);
        let msg = unsafe { std::ffi::CStr::from_ptr(db.error_message_ptr()) };
        assert_eq!(msg.to_str().unwrap(), "duplicate key value");
        db.clear_error();
        assert_eq!(db.error_code(), abi::SQLITE_OK);
    }

    #[test]
    fn registry_tracks_handles() {
        let reg = DbRegistry::default();
        let rec = DbRecord::new("/tmp/x.db");
        reg.register(0x10, Arc::clone(&rec));
        assert!(reg.lookup(0x10).is_some());
        assert!(reg.lookup(0x20).is_none());
        assert!(reg.remove(0x10).is_some());
        assert!(reg.lookup(0x10).is_none());
    }
}
