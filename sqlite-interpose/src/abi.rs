//! The slice of the SQLite 3 C ABI the shim speaks.
//!
//! Nothing here links against a real SQLite. A shim that exports the
//! `sqlite3_*` symbols itself cannot also link a library defining them, so
//! the handle types are declared as opaque structs and every constant is
//! spelled out locally. Calls into the original library always go through
//! the function pointers resolved by [`crate::binder`].

#![allow(non_camel_case_types)]

use libc::{c_char, c_int, c_uchar, c_void};

/// Opaque database connection handle, as seen by the host.
#[repr(C)]
pub struct sqlite3 {
    _private: [u8; 0],
}

/// Opaque prepared statement handle, as seen by the host.
#[repr(C)]
pub struct sqlite3_stmt {
    _private: [u8; 0],
}

/// Opaque value handle, as seen by the host.
#[repr(C)]
pub struct sqlite3_value {
    _private: [u8; 0],
}

pub type sqlite3_int64 = i64;
pub type sqlite3_uint64 = u64;

// Result codes consumed by the host.
pub const SQLITE_OK: c_int = 0;
pub const SQLITE_ERROR: c_int = 1;
pub const SQLITE_ABORT: c_int = 4;
pub const SQLITE_BUSY: c_int = 5;
pub const SQLITE_LOCKED: c_int = 6;
pub const SQLITE_NOMEM: c_int = 7;
pub const SQLITE_IOERR: c_int = 10;
pub const SQLITE_CANTOPEN: c_int = 14;
pub const SQLITE_CONSTRAINT: c_int = 19;
pub const SQLITE_MISMATCH: c_int = 20;
pub const SQLITE_MISUSE: c_int = 21;
pub const SQLITE_RANGE: c_int = 25;
pub const SQLITE_ROW: c_int = 100;
pub const SQLITE_DONE: c_int = 101;

// Fundamental datatype codes.
pub const SQLITE_INTEGER: c_int = 1;
pub const SQLITE_FLOAT: c_int = 2;
pub const SQLITE_TEXT: c_int = 3;
pub const SQLITE_BLOB: c_int = 4;
pub const SQLITE_NULL: c_int = 5;

/// Text encoding argument of `bind_text64` / `create_collation`.
pub const SQLITE_UTF8: c_int = 1;

/// Bind destructor argument. The ABI passes either a function pointer, the
/// sentinel `SQLITE_STATIC` (0) or `SQLITE_TRANSIENT` (-1); receiving it as
/// a raw pointer keeps the sentinel comparison trivial.
pub type bind_destructor = *mut c_void;

pub const SQLITE_STATIC: isize = 0;
pub const SQLITE_TRANSIENT: isize = -1;

/// Invoke a bind destructor if it is a real function pointer.
///
/// # Safety
/// `dtor` must be either one of the sentinels or a callable
/// `void (*)(void *)`, per the SQLite bind contract.
pub unsafe fn run_bind_destructor(dtor: bind_destructor, data: *mut c_void) {
    let raw = dtor as isize;
    if raw != SQLITE_STATIC && raw != SQLITE_TRANSIENT && !data.is_null() {
        let f: unsafe extern "C" fn(*mut c_void) = std::mem::transmute(dtor);
        f(data);
    }
}

/// Row callback of `sqlite3_exec`.
pub type exec_callback = Option<
    unsafe extern "C" fn(*mut c_void, c_int, *mut *mut c_char, *mut *mut c_char) -> c_int,
>;

/// Comparator registered through `create_collation`.
pub type collation_compare = Option<
    unsafe extern "C" fn(*mut c_void, c_int, *const c_void, c_int, *const c_void) -> c_int,
>;

/// Destructor of a collation's user data (`create_collation_v2`).
pub type collation_destroy = Option<unsafe extern "C" fn(*mut c_void)>;

// Typed signatures of every original entry point the binder resolves.
pub type fn_open = unsafe extern "C" fn(*const c_char, *mut *mut sqlite3) -> c_int;
pub type fn_open_v2 =
    unsafe extern "C" fn(*const c_char, *mut *mut sqlite3, c_int, *const c_char) -> c_int;
pub type fn_close = unsafe extern "C" fn(*mut sqlite3) -> c_int;
pub type fn_exec = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    exec_callback,
    *mut c_void,
    *mut *mut c_char,
) -> c_int;
pub type fn_prepare = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    *mut *mut sqlite3_stmt,
    *mut *const c_char,
) -> c_int;
pub type fn_prepare_v3 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    libc::c_uint,
    *mut *mut sqlite3_stmt,
    *mut *const c_char,
) -> c_int;
pub type fn_stmt_arg = unsafe extern "C" fn(*mut sqlite3_stmt) -> c_int;
pub type fn_bind_int = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, c_int) -> c_int;
pub type fn_bind_int64 = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, sqlite3_int64) -> c_int;
pub type fn_bind_double = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, f64) -> c_int;
pub type fn_bind_text = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_char,
    c_int,
    bind_destructor,
) -> c_int;
pub type fn_bind_text64 = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_char,
    sqlite3_uint64,
    bind_destructor,
    c_uchar,
) -> c_int;
pub type fn_bind_blob = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_void,
    c_int,
    bind_destructor,
) -> c_int;
pub type fn_bind_blob64 = unsafe extern "C" fn(
    *mut sqlite3_stmt,
    c_int,
    *const c_void,
    sqlite3_uint64,
    bind_destructor,
) -> c_int;
pub type fn_bind_value =
    unsafe extern "C" fn(*mut sqlite3_stmt, c_int, *const sqlite3_value) -> c_int;
pub type fn_bind_null = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
pub type fn_bind_parameter_name =
    unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_char;
pub type fn_column_int = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
pub type fn_column_int64 = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> sqlite3_int64;
pub type fn_column_double = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> f64;
pub type fn_column_text = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_uchar;
pub type fn_column_blob = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_void;
pub type fn_column_arg = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> c_int;
pub type fn_column_name = unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *const c_char;
pub type fn_column_value =
    unsafe extern "C" fn(*mut sqlite3_stmt, c_int) -> *mut sqlite3_value;
pub type fn_value_type = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
pub type fn_value_int = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
pub type fn_value_int64 = unsafe extern "C" fn(*mut sqlite3_value) -> sqlite3_int64;
pub type fn_value_double = unsafe extern "C" fn(*mut sqlite3_value) -> f64;
pub type fn_value_text = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_uchar;
pub type fn_value_blob = unsafe extern "C" fn(*mut sqlite3_value) -> *const c_void;
pub type fn_value_bytes = unsafe extern "C" fn(*mut sqlite3_value) -> c_int;
pub type fn_create_collation = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    *mut c_void,
    collation_compare,
) -> c_int;
pub type fn_create_collation_v2 = unsafe extern "C" fn(
    *mut sqlite3,
    *const c_char,
    c_int,
    *mut c_void,
    collation_compare,
    collation_destroy,
) -> c_int;
pub type fn_free = unsafe extern "C" fn(*mut c_void);
pub type fn_malloc = unsafe extern "C" fn(c_int) -> *mut c_void;
pub type fn_db_handle = unsafe extern "C" fn(*mut sqlite3_stmt) -> *mut sqlite3;
pub type fn_sql = unsafe extern "C" fn(*mut sqlite3_stmt) -> *const c_char;
pub type fn_expanded_sql = unsafe extern "C" fn(*mut sqlite3_stmt) -> *mut c_char;
pub type fn_stmt_status = unsafe extern "C" fn(*mut sqlite3_stmt, c_int, c_int) -> c_int;
pub type fn_db_arg = unsafe extern "C" fn(*mut sqlite3) -> c_int;
pub type fn_changes64 = unsafe extern "C" fn(*mut sqlite3) -> sqlite3_int64;
pub type fn_last_insert_rowid = unsafe extern "C" fn(*mut sqlite3) -> sqlite3_int64;
pub type fn_errmsg = unsafe extern "C" fn(*mut sqlite3) -> *const c_char;
