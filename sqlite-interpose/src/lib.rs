//! Interpose the SQLite 3 C API.
//!
//! Building blocks for a shim that exports the `sqlite3_*` symbols itself:
//! the raw [ABI surface](abi) (codes, opaque handles, signatures), the
//! [symbol binder](binder) that captures the original entry points in
//! next-object order, and [shadow-statement plumbing](shadow) for keeping
//! the host's opaque handles backed by real statements of the original
//! library.

pub mod abi;
pub mod binder;
pub mod error;
pub mod shadow;

pub use binder::{BindError, SqliteApi};
pub use error::Error;
