//! Drive the host's own SQLite through the resolved entry points.
//!
//! The engine keeps one real prepared statement per intercepted handle so
//! the pointer the host holds stays a valid statement of the original
//! library for its whole ABI lifetime. The statement text is a no-op query;
//! nothing is ever stepped through it unless the engine explicitly forwards.

use std::ffi::CString;

use libc::{c_char, c_void};

use crate::abi::{sqlite3, sqlite3_stmt, SQLITE_OK};
use crate::binder::SqliteApi;
use crate::error::Error;

/// Statement text behind every shadow handle. Valid in every SQLite the
/// host could ship, prepares in microseconds, and steps straight to done if
/// anything ever does step it.
pub const SHADOW_SQL: &str = "SELECT 1 WHERE 0";

/// Prepare `sql` on `db` through the original library. Used for the no-op
/// shadow text and for statements that must stay resident in the shadow.
///
/// # Safety
/// `db` must be a live connection handle of the original library.
pub unsafe fn prepare(
    api: &SqliteApi,
    db: *mut sqlite3,
    sql: &str,
) -> Result<*mut sqlite3_stmt, Error> {
    let sql = CString::new(sql).map_err(|_| Error::InteriorNul)?;
    let mut stmt: *mut sqlite3_stmt = std::ptr::null_mut();
    let rc = (api.real().prepare_v2)(
        db,
        sql.as_ptr(),
        -1,
        &mut stmt,
        std::ptr::null_mut(),
    );
    if rc != SQLITE_OK || stmt.is_null() {
        log::error!("shadow prepare failed rc={rc}");
        return Err(Error::ShadowPrepare { code: rc });
    }
    Ok(stmt)
}

/// Prepare the no-op shadow statement on `db`.
///
/// # Safety
/// `db` must be a live connection handle of the original library.
pub unsafe fn prepare_noop(
    api: &SqliteApi,
    db: *mut sqlite3,
) -> Result<*mut sqlite3_stmt, Error> {
    prepare(api, db, SHADOW_SQL)
}

/// Finalize a shadow statement, ignoring the result code. Called on the
/// refcount-zero path where there is nobody left to report to.
///
/// # Safety
/// `stmt` must be a statement of the original library, or null.
pub unsafe fn finalize(api: &SqliteApi, stmt: *mut sqlite3_stmt) {
    if !stmt.is_null() {
        let rc = (api.real().finalize)(stmt);
        if rc != SQLITE_OK {
            log::debug!("shadow finalize rc={rc}");
        }
    }
}

/// Copy `text` into a NUL-terminated buffer from the original allocator,
/// so the host's `sqlite3_free` owns it afterwards.
///
/// # Safety
/// `api` must hold resolved pointers.
pub unsafe fn strdup(api: &SqliteApi, text: &[u8]) -> Result<*mut c_char, Error> {
    let len = text.len() + 1;
    let buf = (api.real().malloc)(len as libc::c_int) as *mut u8;
    if buf.is_null() {
        return Err(Error::ShadowAlloc { bytes: len });
    }
    std::ptr::copy_nonoverlapping(text.as_ptr(), buf, text.len());
    *buf.add(text.len()) = 0;
    Ok(buf as *mut c_char)
}

/// Free a buffer previously handed to the host, with the original free.
///
/// # Safety
/// `ptr` must come from the original allocator, or be null.
pub unsafe fn free(api: &SqliteApi, ptr: *mut c_void) {
    if !ptr.is_null() {
        (api.real().free)(ptr);
    }
}
