//! The intercepted entry points.
//!
//! Every export is ABI-identical to the SQLite symbol it shadows. Dispatch
//! is uniform: a handle the registry knows belongs to the engine; anything
//! else forwards blindly to the original library, so statements the engine
//! never took over (PRAGMA and friends, non-redirected databases) keep
//! their stock behaviour. Panics never unwind across the boundary.

#![allow(clippy::missing_safety_doc)]
#![allow(unused_unsafe)]

use std::ffi::CStr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use libc::{c_char, c_int, c_uchar, c_uint, c_void};
use sqlite_interpose::abi::{self, bind_destructor, collation_compare, collation_destroy, exec_callback, run_bind_destructor, sqlite3, sqlite3_int64, sqlite3_stmt, sqlite3_uint64, sqlite3_value};
use sqlite_interpose::{shadow, SqliteApi};

use crate::db::DbRecord;
use crate::engine;
use crate::statement::StatementRecord;
use crate::value::{SqlValue, TaggedValue};

fn fenced<T>(default: T, f: impl FnOnce() -> T) -> T {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => v,
        Err(_) => {
            tracing::error!("api: panic fenced at the FFI boundary");
            default
        }
    }
}

unsafe fn text_arg<'a>(ptr: *const c_char) -> &'a str {
    if ptr.is_null() {
        return "";
    }
    CStr::from_ptr(ptr).to_str().unwrap_or("")
}

fn stmt_record(stmt: *mut sqlite3_stmt) -> Option<Arc<StatementRecord>> {
    if stmt.is_null() {
        return None;
    }
    let record = engine().registry.lookup_cached(stmt as usize)?;
    // Shadow-resident statements carry their real SQL in the shadow handle;
    // every call on them falls through to the original library.
    record.is_backend_only.then_some(record)
}

fn redirected_db(db: *mut sqlite3) -> Option<Arc<DbRecord>> {
    if db.is_null() {
        return None;
    }
    engine().databases.lookup(db as usize).filter(|r| r.redirect)
}

fn api_or(default: c_int) -> Result<&'static SqliteApi, c_int> {
    engine().api.ok_or(default)
}

// ---------------------------------------------------------------------------
// Connections

unsafe fn open_common(
    filename: *const c_char,
    out_db: *mut *mut sqlite3,
    rc: c_int,
) -> c_int {
    if rc == abi::SQLITE_OK && !out_db.is_null() && !(*out_db).is_null() {
        let path = text_arg(filename);
        let record = DbRecord::new(path);
        tracing::info!("api: open {:?} redirect={}", record.path, record.redirect);
        engine().databases.register(*out_db as usize, record);
    }
    rc
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_open(
    filename: *const c_char,
    out_db: *mut *mut sqlite3,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        let api = match api_or(abi::SQLITE_ERROR) {
            Ok(a) => a,
            Err(rc) => return rc,
        };
        let rc = (api.orig().open)(filename, out_db);
        open_common(filename, out_db, rc)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_open_v2(
    filename: *const c_char,
    out_db: *mut *mut sqlite3,
    flags: c_int,
    vfs: *const c_char,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        let api = match api_or(abi::SQLITE_ERROR) {
            Ok(a) => a,
            Err(rc) => return rc,
        };
        let rc = (api.orig().open_v2)(filename, out_db, flags, vfs);
        open_common(filename, out_db, rc)
    })
}

unsafe fn close_common(db: *mut sqlite3, v2: bool) -> c_int {
    let api = match api_or(abi::SQLITE_OK) {
        Ok(a) => a,
        Err(rc) => return rc,
    };
    if let Some(record) = engine().databases.remove(db as usize) {
        tracing::info!(
            "api: close {:?} ({} live statements)",
            record.path,
            engine().registry.live()
        );
    }
    if v2 {
        (api.orig().close_v2)(db)
    } else {
        (api.orig().close)(db)
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_close(db: *mut sqlite3) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe { close_common(db, false) })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_close_v2(db: *mut sqlite3) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe { close_common(db, true) })
}

// ---------------------------------------------------------------------------
// Prepare

unsafe fn prepare_engine(
    db: *mut sqlite3,
    record: &Arc<DbRecord>,
    zsql: *const c_char,
    nbyte: c_int,
    out_stmt: *mut *mut sqlite3_stmt,
    out_tail: *mut *const c_char,
) -> Option<c_int> {
    let raw: &[u8] = if zsql.is_null() {
        &[]
    } else if nbyte < 0 {
        CStr::from_ptr(zsql).to_bytes()
    } else {
        let full = std::slice::from_raw_parts(zsql as *const u8, nbyte as usize);
        match full.iter().position(|b| *b == 0) {
            Some(end) => &full[..end],
            None => full,
        }
    };
    let sql = match std::str::from_utf8(raw) {
        Ok(s) => s,
        Err(_) => {
            record.set_error(abi::SQLITE_ERROR, "statement text is not valid utf-8");
            if !out_stmt.is_null() {
                *out_stmt = std::ptr::null_mut();
            }
            return Some(abi::SQLITE_ERROR);
        }
    };

    let end = crate::rewrite::statement_end(sql);
    let stmt_text = &sql[..end];
    if !out_tail.is_null() {
        *out_tail = zsql.add(end);
    }
    if stmt_text.trim().is_empty() {
        record.set_error(abi::SQLITE_ERROR, "empty statement");
        if !out_stmt.is_null() {
            *out_stmt = std::ptr::null_mut();
        }
        return Some(abi::SQLITE_ERROR);
    }
    if crate::rewrite::is_passthrough(stmt_text) {
        return None;
    }

    match engine().prepare_redirected(db, record, stmt_text) {
        Ok(stmt) => {
            if !out_stmt.is_null() {
                *out_stmt = stmt.handle() as *mut sqlite3_stmt;
            }
            record.clear_error();
            Some(abi::SQLITE_OK)
        }
        Err(err) => {
            let code = err.code();
            record.set_error(code, &err.to_string());
            if !out_stmt.is_null() {
                *out_stmt = std::ptr::null_mut();
            }
            Some(code)
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_prepare(
    db: *mut sqlite3,
    zsql: *const c_char,
    nbyte: c_int,
    out_stmt: *mut *mut sqlite3_stmt,
    out_tail: *mut *const c_char,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        let api = match api_or(abi::SQLITE_ERROR) {
            Ok(a) => a,
            Err(rc) => return rc,
        };
        if let Some(record) = redirected_db(db) {
            if let Some(rc) = prepare_engine(db, &record, zsql, nbyte, out_stmt, out_tail) {
                return rc;
            }
        }
        (api.orig().prepare)(db, zsql, nbyte, out_stmt, out_tail)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_prepare_v2(
    db: *mut sqlite3,
    zsql: *const c_char,
    nbyte: c_int,
    out_stmt: *mut *mut sqlite3_stmt,
    out_tail: *mut *const c_char,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        let api = match api_or(abi::SQLITE_ERROR) {
            Ok(a) => a,
            Err(rc) => return rc,
        };
        if let Some(record) = redirected_db(db) {
            if let Some(rc) = prepare_engine(db, &record, zsql, nbyte, out_stmt, out_tail) {
                return rc;
            }
        }
        (api.orig().prepare_v2)(db, zsql, nbyte, out_stmt, out_tail)
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_prepare_v3(
    db: *mut sqlite3,
    zsql: *const c_char,
    nbyte: c_int,
    flags: c_uint,
    out_stmt: *mut *mut sqlite3_stmt,
    out_tail: *mut *const c_char,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        let api = match api_or(abi::SQLITE_ERROR) {
            Ok(a) => a,
            Err(rc) => return rc,
        };
        if let Some(record) = redirected_db(db) {
            if let Some(rc) = prepare_engine(db, &record, zsql, nbyte, out_stmt, out_tail) {
                return rc;
            }
        }
        (api.orig().prepare_v3)(db, zsql, nbyte, flags, out_stmt, out_tail)
    })
}

// ---------------------------------------------------------------------------
// Bind

macro_rules! bind_simple {
    ($name:ident, $orig:ident, $ty:ty, $conv:expr) => {
        #[no_mangle]
        pub unsafe extern "C" fn $name(
            stmt: *mut sqlite3_stmt,
            index: c_int,
            value: $ty,
        ) -> c_int {
            fenced(abi::SQLITE_ERROR, || unsafe {
                if let Some(record) = stmt_record(stmt) {
                    #[allow(clippy::redundant_closure_call)]
                    return engine().bind_value(&record, index, ($conv)(value));
                }
                match api_or(abi::SQLITE_MISUSE) {
                    Ok(api) => (api.orig().$orig)(stmt, index, value),
                    Err(rc) => rc,
                }
            })
        }
    };
}

bind_simple!(sqlite3_bind_int, bind_int, c_int, |v: c_int| SqlValue::Int(v as i64));
bind_simple!(sqlite3_bind_int64, bind_int64, sqlite3_int64, SqlValue::Int);
bind_simple!(sqlite3_bind_double, bind_double, f64, SqlValue::Float);

#[no_mangle]
pub unsafe extern "C" fn sqlite3_bind_null(stmt: *mut sqlite3_stmt, index: c_int) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().bind_value(&record, index, SqlValue::Null);
        }
        match api_or(abi::SQLITE_MISUSE) {
            Ok(api) => (api.orig().bind_null)(stmt, index),
            Err(rc) => rc,
        }
    })
}

unsafe fn bind_text_engine(
    record: &Arc<StatementRecord>,
    index: c_int,
    data: *const c_char,
    len: i64,
    dtor: bind_destructor,
) -> c_int {
    let value = if data.is_null() {
        SqlValue::Null
    } else {
        let bytes: &[u8] = if len < 0 {
            CStr::from_ptr(data).to_bytes()
        } else {
            std::slice::from_raw_parts(data as *const u8, len as usize)
        };
        SqlValue::Text(String::from_utf8_lossy(bytes).into_owned())
    };
    let rc = engine().bind_value(record, index, value);
    run_bind_destructor(dtor, data as *mut c_void);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_bind_text(
    stmt: *mut sqlite3_stmt,
    index: c_int,
    data: *const c_char,
    len: c_int,
    dtor: bind_destructor,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return bind_text_engine(&record, index, data, len as i64, dtor);
        }
        match api_or(abi::SQLITE_MISUSE) {
            Ok(api) => (api.orig().bind_text)(stmt, index, data, len, dtor),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_bind_text64(
    stmt: *mut sqlite3_stmt,
    index: c_int,
    data: *const c_char,
    len: sqlite3_uint64,
    dtor: bind_destructor,
    encoding: c_uchar,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            if encoding != abi::SQLITE_UTF8 as c_uchar {
                tracing::debug!("api: bind_text64 with non-utf8 encoding {encoding}");
            }
            return bind_text_engine(&record, index, data, len as i64, dtor);
        }
        match api_or(abi::SQLITE_MISUSE) {
            Ok(api) => (api.orig().bind_text64)(stmt, index, data, len, dtor, encoding),
            Err(rc) => rc,
        }
    })
}

unsafe fn bind_blob_engine(
    record: &Arc<StatementRecord>,
    index: c_int,
    data: *const c_void,
    len: i64,
    dtor: bind_destructor,
) -> c_int {
    let value = if data.is_null() {
        SqlValue::Null
    } else {
        let bytes = std::slice::from_raw_parts(data as *const u8, len.max(0) as usize);
        SqlValue::Blob(bytes.to_vec())
    };
    let rc = engine().bind_value(record, index, value);
    run_bind_destructor(dtor, data as *mut c_void);
    rc
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_bind_blob(
    stmt: *mut sqlite3_stmt,
    index: c_int,
    data: *const c_void,
    len: c_int,
    dtor: bind_destructor,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return bind_blob_engine(&record, index, data, len as i64, dtor);
        }
        match api_or(abi::SQLITE_MISUSE) {
            Ok(api) => (api.orig().bind_blob)(stmt, index, data, len, dtor),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_bind_blob64(
    stmt: *mut sqlite3_stmt,
    index: c_int,
    data: *const c_void,
    len: sqlite3_uint64,
    dtor: bind_destructor,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return bind_blob_engine(&record, index, data, len as i64, dtor);
        }
        match api_or(abi::SQLITE_MISUSE) {
            Ok(api) => (api.orig().bind_blob64)(stmt, index, data, len, dtor),
            Err(rc) => rc,
        }
    })
}

/// Read a foreign (original-library) value object into the engine's value
/// space through the original accessors.
unsafe fn foreign_value(api: &'static SqliteApi, value: *mut sqlite3_value) -> SqlValue {
    match (api.real().value_type)(value) {
        abi::SQLITE_INTEGER => SqlValue::Int((api.real().value_int64)(value)),
        abi::SQLITE_FLOAT => SqlValue::Float((api.real().value_double)(value)),
        abi::SQLITE_TEXT => {
            let p = (api.real().value_text)(value);
            if p.is_null() {
                SqlValue::Null
            } else {
                SqlValue::Text(
                    CStr::from_ptr(p as *const c_char)
                        .to_string_lossy()
                        .into_owned(),
                )
            }
        }
        abi::SQLITE_BLOB => {
            let len = (api.real().value_bytes)(value).max(0) as usize;
            let p = (api.real().value_blob)(value);
            if p.is_null() {
                SqlValue::Blob(Vec::new())
            } else {
                SqlValue::Blob(std::slice::from_raw_parts(p as *const u8, len).to_vec())
            }
        }
        _ => SqlValue::Null,
    }
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_bind_value(
    stmt: *mut sqlite3_stmt,
    index: c_int,
    value: *const sqlite3_value,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            let v = match TaggedValue::from_abi(value as *mut sqlite3_value) {
                Some(tagged) => tagged.value.clone(),
                None => match engine().api {
                    Some(api) if !value.is_null() => {
                        foreign_value(api, value as *mut sqlite3_value)
                    }
                    _ => SqlValue::Null,
                },
            };
            return engine().bind_value(&record, index, v);
        }
        match api_or(abi::SQLITE_MISUSE) {
            Ok(api) => (api.orig().bind_value)(stmt, index, value),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_bind_parameter_count(stmt: *mut sqlite3_stmt) -> c_int {
    fenced(0, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return record.rewritten.param_count as c_int;
        }
        match api_or(0) {
            Ok(api) => (api.orig().bind_parameter_count)(stmt),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_bind_parameter_name(
    stmt: *mut sqlite3_stmt,
    index: c_int,
) -> *const c_char {
    fenced(std::ptr::null(), || unsafe {
        if stmt_record(stmt).is_some() {
            // Engine statements use positional parameters only.
            return std::ptr::null();
        }
        match engine().api {
            Some(api) => (api.orig().bind_parameter_name)(stmt, index),
            None => std::ptr::null(),
        }
    })
}

// ---------------------------------------------------------------------------
// Step / reset / finalize

#[no_mangle]
pub unsafe extern "C" fn sqlite3_step(stmt: *mut sqlite3_stmt) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().step(&record);
        }
        match api_or(abi::SQLITE_MISUSE) {
            Ok(api) => (api.orig().step)(stmt),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_reset(stmt: *mut sqlite3_stmt) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().reset(&record);
        }
        match api_or(abi::SQLITE_OK) {
            Ok(api) => (api.orig().reset)(stmt),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_clear_bindings(stmt: *mut sqlite3_stmt) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().clear_bindings(&record);
        }
        match api_or(abi::SQLITE_OK) {
            Ok(api) => (api.orig().clear_bindings)(stmt),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_finalize(stmt: *mut sqlite3_stmt) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if stmt.is_null() {
            return abi::SQLITE_OK;
        }
        if engine().registry.lookup(stmt as usize).is_some() {
            return engine().finalize_stmt(stmt as usize);
        }
        match api_or(abi::SQLITE_OK) {
            Ok(api) => (api.orig().finalize)(stmt),
            Err(rc) => rc,
        }
    })
}

// ---------------------------------------------------------------------------
// Columns

#[no_mangle]
pub unsafe extern "C" fn sqlite3_column_count(stmt: *mut sqlite3_stmt) -> c_int {
    fenced(0, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().column_count(&record);
        }
        match api_or(0) {
            Ok(api) => (api.orig().column_count)(stmt),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_data_count(stmt: *mut sqlite3_stmt) -> c_int {
    fenced(0, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().data_count(&record);
        }
        match api_or(0) {
            Ok(api) => (api.orig().data_count)(stmt),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_column_type(stmt: *mut sqlite3_stmt, index: c_int) -> c_int {
    fenced(abi::SQLITE_NULL, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().column_type(&record, index);
        }
        match api_or(abi::SQLITE_NULL) {
            Ok(api) => (api.orig().column_type)(stmt, index),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_column_int(stmt: *mut sqlite3_stmt, index: c_int) -> c_int {
    fenced(0, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().column_int64(&record, index) as c_int;
        }
        match api_or(0) {
            Ok(api) => (api.orig().column_int)(stmt, index),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_column_int64(
    stmt: *mut sqlite3_stmt,
    index: c_int,
) -> sqlite3_int64 {
    fenced(0, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().column_int64(&record, index);
        }
        match engine().api {
            Some(api) => (api.orig().column_int64)(stmt, index),
            None => 0,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_column_double(stmt: *mut sqlite3_stmt, index: c_int) -> f64 {
    fenced(0.0, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().column_double(&record, index);
        }
        match engine().api {
            Some(api) => (api.orig().column_double)(stmt, index),
            None => 0.0,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_column_text(
    stmt: *mut sqlite3_stmt,
    index: c_int,
) -> *const c_uchar {
    fenced(std::ptr::null(), || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().column_text_ptr(&record, index);
        }
        match engine().api {
            Some(api) => (api.orig().column_text)(stmt, index),
            None => std::ptr::null(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_column_blob(
    stmt: *mut sqlite3_stmt,
    index: c_int,
) -> *const c_void {
    fenced(std::ptr::null(), || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().column_blob_ptr(&record, index);
        }
        match engine().api {
            Some(api) => (api.orig().column_blob)(stmt, index),
            None => std::ptr::null(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_column_bytes(stmt: *mut sqlite3_stmt, index: c_int) -> c_int {
    fenced(0, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().column_bytes(&record, index);
        }
        match api_or(0) {
            Ok(api) => (api.orig().column_bytes)(stmt, index),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_column_name(
    stmt: *mut sqlite3_stmt,
    index: c_int,
) -> *const c_char {
    fenced(std::ptr::null(), || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().column_name_ptr(&record, index);
        }
        match engine().api {
            Some(api) => (api.orig().column_name)(stmt, index),
            None => std::ptr::null(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_column_value(
    stmt: *mut sqlite3_stmt,
    index: c_int,
) -> *mut sqlite3_value {
    fenced(std::ptr::null_mut(), || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().column_value_ptr(&record, index);
        }
        match engine().api {
            Some(api) => (api.orig().column_value)(stmt, index),
            None => std::ptr::null_mut(),
        }
    })
}

// ---------------------------------------------------------------------------
// Values

#[no_mangle]
pub unsafe extern "C" fn sqlite3_value_type(value: *mut sqlite3_value) -> c_int {
    fenced(abi::SQLITE_NULL, || unsafe {
        if let Some(tagged) = TaggedValue::from_abi(value) {
            return tagged.value.type_code();
        }
        match engine().api {
            Some(api) => (api.orig().value_type)(value),
            None => abi::SQLITE_NULL,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_value_int(value: *mut sqlite3_value) -> c_int {
    fenced(0, || unsafe {
        if let Some(tagged) = TaggedValue::from_abi(value) {
            return tagged.value.as_int() as c_int;
        }
        match engine().api {
            Some(api) => (api.orig().value_int)(value),
            None => 0,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_value_int64(value: *mut sqlite3_value) -> sqlite3_int64 {
    fenced(0, || unsafe {
        if let Some(tagged) = TaggedValue::from_abi(value) {
            return tagged.value.as_int();
        }
        match engine().api {
            Some(api) => (api.orig().value_int64)(value),
            None => 0,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_value_double(value: *mut sqlite3_value) -> f64 {
    fenced(0.0, || unsafe {
        if let Some(tagged) = TaggedValue::from_abi(value) {
            return tagged.value.as_double();
        }
        match engine().api {
            Some(api) => (api.orig().value_double)(value),
            None => 0.0,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_value_text(value: *mut sqlite3_value) -> *const c_uchar {
    fenced(std::ptr::null(), || unsafe {
        if let Some(tagged) = TaggedValue::from_abi(value) {
            return tagged.text_ptr();
        }
        match engine().api {
            Some(api) => (api.orig().value_text)(value),
            None => std::ptr::null(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_value_blob(value: *mut sqlite3_value) -> *const c_void {
    fenced(std::ptr::null(), || unsafe {
        if let Some(tagged) = TaggedValue::from_abi(value) {
            return match tagged.value.blob_bytes() {
                Some(b) => b.as_ptr() as *const c_void,
                None => std::ptr::null(),
            };
        }
        match engine().api {
            Some(api) => (api.orig().value_blob)(value),
            None => std::ptr::null(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_value_bytes(value: *mut sqlite3_value) -> c_int {
    fenced(0, || unsafe {
        if let Some(tagged) = TaggedValue::from_abi(value) {
            return tagged.value.byte_len() as c_int;
        }
        match api_or(0) {
            Ok(api) => (api.orig().value_bytes)(value),
            Err(rc) => rc,
        }
    })
}

// ---------------------------------------------------------------------------
// Exec

#[no_mangle]
pub unsafe extern "C" fn sqlite3_exec(
    db: *mut sqlite3,
    sql: *const c_char,
    callback: exec_callback,
    user_data: *mut c_void,
    errmsg: *mut *mut c_char,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        let api = match api_or(abi::SQLITE_ERROR) {
            Ok(a) => a,
            Err(rc) => return rc,
        };
        if !errmsg.is_null() {
            *errmsg = std::ptr::null_mut();
        }
        let Some(record) = redirected_db(db) else {
            return (api.orig().exec)(db, sql, callback, user_data, errmsg);
        };
        run_exec(api, db, &record, text_arg(sql), callback, user_data, errmsg)
    })
}

unsafe fn run_exec(
    api: &'static SqliteApi,
    db: *mut sqlite3,
    db_record: &Arc<DbRecord>,
    sql: &str,
    callback: exec_callback,
    user_data: *mut c_void,
    errmsg: *mut *mut c_char,
) -> c_int {
    let eng = engine();
    let mut rest = sql;
    while !rest.trim().is_empty() {
        let end = crate::rewrite::statement_end(rest);
        let piece = &rest[..end];
        rest = &rest[end..];
        if piece.trim_matches([' ', '\t', '\r', '\n', ';']).is_empty() {
            continue;
        }
        if crate::rewrite::is_passthrough(piece) || crate::rewrite::is_shadow_resident(piece) {
            let c_piece = match std::ffi::CString::new(piece) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let rc = (api.orig().exec)(db, c_piece.as_ptr(), callback, user_data, errmsg);
            if rc != abi::SQLITE_OK {
                return rc;
            }
            continue;
        }

        let stmt = match eng.prepare_redirected(db, db_record, piece) {
            Ok(stmt) => stmt,
            Err(err) => {
                let code = err.code();
                db_record.set_error(code, &err.to_string());
                set_exec_errmsg(api, errmsg, &err.to_string());
                return code;
            }
        };
        let rc = drive_exec_rows(&stmt, callback, user_data);
        eng.finalize_stmt(stmt.handle());
        match rc {
            abi::SQLITE_DONE | abi::SQLITE_OK => {}
            abi::SQLITE_ABORT => {
                set_exec_errmsg(api, errmsg, "query aborted by callback");
                return abi::SQLITE_ABORT;
            }
            code => {
                set_exec_errmsg(api, errmsg, &db_error_text(db_record));
                return code;
            }
        }
    }
    abi::SQLITE_OK
}

fn db_error_text(db_record: &DbRecord) -> String {
    unsafe {
        CStr::from_ptr(db_record.error_message_ptr())
            .to_string_lossy()
            .into_owned()
    }
}

unsafe fn set_exec_errmsg(api: &'static SqliteApi, errmsg: *mut *mut c_char, message: &str) {
    if errmsg.is_null() {
        return;
    }
    *errmsg = shadow::strdup(api, message.as_bytes()).unwrap_or(std::ptr::null_mut());
}

unsafe fn drive_exec_rows(
    stmt: &Arc<StatementRecord>,
    callback: exec_callback,
    user_data: *mut c_void,
) -> c_int {
    let eng = engine();
    loop {
        match eng.step(stmt) {
            abi::SQLITE_ROW => {
                let Some(cb) = callback else { continue };
                let ncols = eng.column_count(stmt);
                let mut names: Vec<*mut c_char> = Vec::with_capacity(ncols as usize);
                let mut vals: Vec<*mut c_char> = Vec::with_capacity(ncols as usize);
                for i in 0..ncols {
                    names.push(eng.column_name_ptr(stmt, i) as *mut c_char);
                    if eng.column_type(stmt, i) == abi::SQLITE_NULL {
                        vals.push(std::ptr::null_mut());
                    } else {
                        vals.push(eng.column_text_ptr(stmt, i) as *mut c_char);
                    }
                }
                if cb(user_data, ncols, vals.as_mut_ptr(), names.as_mut_ptr()) != 0 {
                    return abi::SQLITE_ABORT;
                }
            }
            abi::SQLITE_DONE => return abi::SQLITE_DONE,
            code => return code,
        }
    }
}

// ---------------------------------------------------------------------------
// Statement metadata and per-database accessors

#[no_mangle]
pub unsafe extern "C" fn sqlite3_db_handle(stmt: *mut sqlite3_stmt) -> *mut sqlite3 {
    fenced(std::ptr::null_mut(), || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return record.db_ptr();
        }
        match engine().api {
            Some(api) => (api.orig().db_handle)(stmt),
            None => std::ptr::null_mut(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_sql(stmt: *mut sqlite3_stmt) -> *const c_char {
    fenced(std::ptr::null(), || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return record.original_sql.as_ptr();
        }
        match engine().api {
            Some(api) => (api.orig().sql)(stmt),
            None => std::ptr::null(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_expanded_sql(stmt: *mut sqlite3_stmt) -> *mut c_char {
    fenced(std::ptr::null_mut(), || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().expanded_sql_ptr(&record);
        }
        match engine().api {
            Some(api) => (api.orig().expanded_sql)(stmt),
            None => std::ptr::null_mut(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_stmt_readonly(stmt: *mut sqlite3_stmt) -> c_int {
    fenced(0, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().stmt_readonly(&record);
        }
        match api_or(0) {
            Ok(api) => (api.orig().stmt_readonly)(stmt),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_stmt_busy(stmt: *mut sqlite3_stmt) -> c_int {
    fenced(0, || unsafe {
        if let Some(record) = stmt_record(stmt) {
            return engine().stmt_busy(&record);
        }
        match api_or(0) {
            Ok(api) => (api.orig().stmt_busy)(stmt),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_stmt_status(
    stmt: *mut sqlite3_stmt,
    op: c_int,
    reset: c_int,
) -> c_int {
    fenced(0, || unsafe {
        if stmt_record(stmt).is_some() {
            // Shadow statements never run the VDBE; every counter is zero.
            return 0;
        }
        match api_or(0) {
            Ok(api) => (api.orig().stmt_status)(stmt, op, reset),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_changes(db: *mut sqlite3) -> c_int {
    fenced(0, || unsafe {
        if let Some(record) = redirected_db(db) {
            return record.changes.load(std::sync::atomic::Ordering::Relaxed) as c_int;
        }
        match api_or(0) {
            Ok(api) => (api.orig().changes)(db),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_changes64(db: *mut sqlite3) -> sqlite3_int64 {
    fenced(0, || unsafe {
        if let Some(record) = redirected_db(db) {
            return record.changes.load(std::sync::atomic::Ordering::Relaxed);
        }
        match engine().api {
            Some(api) => (api.orig().changes64)(db),
            None => 0,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_last_insert_rowid(db: *mut sqlite3) -> sqlite3_int64 {
    fenced(0, || unsafe {
        if let Some(record) = redirected_db(db) {
            return record.last_rowid.load(std::sync::atomic::Ordering::Relaxed);
        }
        match engine().api {
            Some(api) => (api.orig().last_insert_rowid)(db),
            None => 0,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_errmsg(db: *mut sqlite3) -> *const c_char {
    fenced(std::ptr::null(), || unsafe {
        if let Some(record) = redirected_db(db) {
            if record.error_code() != abi::SQLITE_OK {
                return record.error_message_ptr();
            }
        }
        match engine().api {
            Some(api) => (api.orig().errmsg)(db),
            None => std::ptr::null(),
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_errcode(db: *mut sqlite3) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = redirected_db(db) {
            if record.error_code() != abi::SQLITE_OK {
                return record.error_code();
            }
        }
        match api_or(abi::SQLITE_OK) {
            Ok(api) => (api.orig().errcode)(db),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_extended_errcode(db: *mut sqlite3) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        if let Some(record) = redirected_db(db) {
            if record.error_code() != abi::SQLITE_OK {
                return record.error_code();
            }
        }
        match api_or(abi::SQLITE_OK) {
            Ok(api) => (api.orig().extended_errcode)(db),
            Err(rc) => rc,
        }
    })
}

// ---------------------------------------------------------------------------
// Collations and memory

#[no_mangle]
pub unsafe extern "C" fn sqlite3_create_collation(
    db: *mut sqlite3,
    name: *const c_char,
    encoding: c_int,
    user_data: *mut c_void,
    compare: collation_compare,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        // The backend cannot run the host's comparator; the shadow SQLite
        // keeps the registration so ORDER BY on forwarded statements works.
        tracing::debug!("api: create_collation {:?}", text_arg(name));
        match api_or(abi::SQLITE_ERROR) {
            Ok(api) => (api.orig().create_collation)(db, name, encoding, user_data, compare),
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_create_collation_v2(
    db: *mut sqlite3,
    name: *const c_char,
    encoding: c_int,
    user_data: *mut c_void,
    compare: collation_compare,
    destroy: collation_destroy,
) -> c_int {
    fenced(abi::SQLITE_ERROR, || unsafe {
        tracing::debug!("api: create_collation_v2 {:?}", text_arg(name));
        match api_or(abi::SQLITE_ERROR) {
            Ok(api) => {
                (api.orig().create_collation_v2)(db, name, encoding, user_data, compare, destroy)
            }
            Err(rc) => rc,
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_free(ptr: *mut c_void) {
    fenced((), || unsafe {
        if let Some(api) = engine().api {
            (api.orig().free)(ptr);
        }
    })
}

#[no_mangle]
pub unsafe extern "C" fn sqlite3_malloc(size: c_int) -> *mut c_void {
    fenced(std::ptr::null_mut(), || unsafe {
        match engine().api {
            Some(api) => (api.orig().malloc)(size),
            None => std::ptr::null_mut(),
        }
    })
}
