//! Resolution of the original SQLite entry points.
//!
//! At boot the shim asks the dynamic linker for every `sqlite3_*` symbol in
//! "next" order (`RTLD_NEXT`), i.e. the definition the host would have
//! reached had the shim not been interposed. The contract is
//! verify-every-pointer-or-abort: a table with even one null slot is worse
//! than no table at all, because the host would die with `SIGILL`/`SIGSEGV`
//! deep inside its own call sites instead of with a diagnostic naming the
//! missing symbol.

use std::ffi::CString;

use libc::c_void;
use snafu::Snafu;

use crate::abi::*;

#[derive(Debug, Snafu)]
pub enum BindError {
    /// A SQLite library is present after the shim, but one of its entry
    /// points is missing. This is fatal for the caller.
    #[snafu(display("sqlite3_{symbol} did not resolve in next-object order"))]
    Unresolved { symbol: &'static str },

    /// No SQLite library is loaded after the shim at all. There is nothing
    /// to interpose; the engine stays inert.
    #[snafu(display("no SQLite library follows the shim in resolution order"))]
    NoSqlite,
}

unsafe fn next_symbol(name: &str) -> *mut c_void {
    let cname = match CString::new(name) {
        Ok(c) => c,
        Err(_) => return std::ptr::null_mut(),
    };
    libc::dlsym(libc::RTLD_NEXT, cname.as_ptr())
}

macro_rules! sqlite_api {
    ($($field:ident : $ty:ty),* $(,)?) => {
        /// The resolved original entry points, one field per symbol.
        ///
        /// Two views exist over the same pointers: [`SqliteApi::orig`] for
        /// forwarding statements the engine does not manage to the shadow
        /// SQLite, and [`SqliteApi::real`] for the engine's own internal
        /// calls. Both resolve first-next; the split in names exists so a
        /// reader can tell a forwarding call site from an internal one.
        pub struct SqliteApi {
            $(pub $field: $ty,)*
        }

        impl SqliteApi {
            /// Resolve every entry point or report the first missing one.
            pub fn resolve() -> Result<&'static SqliteApi, BindError> {
                unsafe {
                    if next_symbol("sqlite3_open").is_null() {
                        return Err(BindError::NoSqlite);
                    }
                    let api = SqliteApi {
                        $($field: {
                            let ptr = next_symbol(concat!("sqlite3_", stringify!($field)));
                            if ptr.is_null() {
                                return Err(BindError::Unresolved {
                                    symbol: stringify!($field),
                                });
                            }
                            log::trace!("bound sqlite3_{}", stringify!($field));
                            std::mem::transmute::<*mut c_void, $ty>(ptr)
                        },)*
                    };
                    Ok(Box::leak(Box::new(api)))
                }
            }
        }
    };
}

sqlite_api! {
    open: fn_open,
    open_v2: fn_open_v2,
    close: fn_close,
    close_v2: fn_close,
    exec: fn_exec,
    prepare: fn_prepare,
    prepare_v2: fn_prepare,
    prepare_v3: fn_prepare_v3,
    step: fn_stmt_arg,
    reset: fn_stmt_arg,
    finalize: fn_stmt_arg,
    clear_bindings: fn_stmt_arg,
    bind_int: fn_bind_int,
    bind_int64: fn_bind_int64,
    bind_double: fn_bind_double,
    bind_text: fn_bind_text,
    bind_text64: fn_bind_text64,
    bind_blob: fn_bind_blob,
    bind_blob64: fn_bind_blob64,
    bind_value: fn_bind_value,
    bind_null: fn_bind_null,
    bind_parameter_count: fn_stmt_arg,
    bind_parameter_name: fn_bind_parameter_name,
    column_count: fn_stmt_arg,
    data_count: fn_stmt_arg,
    column_type: fn_column_arg,
    column_int: fn_column_int,
    column_int64: fn_column_int64,
    column_double: fn_column_double,
    column_text: fn_column_text,
    column_blob: fn_column_blob,
    column_bytes: fn_column_arg,
    column_name: fn_column_name,
    column_value: fn_column_value,
    value_type: fn_value_type,
    value_int: fn_value_int,
    value_int64: fn_value_int64,
    value_double: fn_value_double,
    value_text: fn_value_text,
    value_blob: fn_value_blob,
    value_bytes: fn_value_bytes,
    create_collation: fn_create_collation,
    create_collation_v2: fn_create_collation_v2,
    free: fn_free,
    malloc: fn_malloc,
    db_handle: fn_db_handle,
    sql: fn_sql,
    expanded_sql: fn_expanded_sql,
    stmt_readonly: fn_stmt_arg,
    stmt_busy: fn_stmt_arg,
    stmt_status: fn_stmt_status,
    changes: fn_db_arg,
    changes64: fn_changes64,
    last_insert_rowid: fn_last_insert_rowid,
    errmsg: fn_errmsg,
    errcode: fn_db_arg,
    extended_errcode: fn_db_arg,
}

impl SqliteApi {
    /// First-next pointers for forwarding unmanaged statements.
    pub fn orig(&self) -> &SqliteApi {
        self
    }

    /// The same pointers, for internal calls that must not re-enter the
    /// shim's own interposers.
    pub fn real(&self) -> &SqliteApi {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The test binary links no SQLite, so next-order resolution has nothing
    // to find and the binder must report that instead of handing out a
    // partial table.
    #[test]
    fn resolve_without_sqlite_reports_no_sqlite() {
        match SqliteApi::resolve() {
            Err(BindError::NoSqlite) => {}
            Err(other) => panic!("unexpected bind error: {other}"),
            Ok(_) => panic!("resolved a SQLite api in a binary without SQLite"),
        }
    }
}
