//! pgqlite, a binary-compatibility shim that exports the SQLite 3 C API
//! and redirects a host's database traffic to PostgreSQL.
//!
//! The host keeps its opaque `sqlite3*`/`sqlite3_stmt*` handles: each one
//! is backed by a real object of the original SQLite (the "shadow"), while
//! query execution happens on pooled backend connections against rewritten
//! SQL. Built as a cdylib for `LD_PRELOAD`; the rlib exists for the test
//! suite.

pub mod api;
pub mod boot;
pub mod colbuf;
pub mod config;
pub mod db;
pub mod error;
pub mod fork;
pub mod guard;
pub mod pool;
pub mod registry;
pub mod rewrite;
pub mod statement;
pub mod value;

use once_cell::sync::OnceCell;
use sqlite_interpose::{BindError, SqliteApi};

use crate::colbuf::ColumnRing;
use crate::config::Config;
use crate::db::DbRegistry;
use crate::pool::{PgBackend, Pool};
use crate::registry::Registry;
use crate::rewrite::Rewriter;

pub struct Engine {
    pub config: Config,
    /// Resolved original entry points; `None` when no SQLite follows the
    /// shim in resolution order (the engine is then inert).
    pub api: Option<&'static SqliteApi>,
    pub pool: Pool<PgBackend>,
    pub rewriter: Rewriter,
    pub registry: Registry,
    pub colbuf: ColumnRing,
    pub databases: DbRegistry,
}

static ENGINE: OnceCell<Engine> = OnceCell::new();

/// The process-wide engine, built exactly once. Teardown is intentionally
/// skipped on host exit; the host's shutdown is not cooperative.
pub fn engine() -> &'static Engine {
    ENGINE.get_or_init(Engine::from_environment)
}

/// The engine if boot already ran; used by the fork handler, which must
/// never trigger initialisation itself.
pub fn try_engine() -> Option<&'static Engine> {
    ENGINE.get()
}

impl Engine {
    fn from_environment() -> Engine {
        let config = Config::from_env();
        let api = match SqliteApi::resolve() {
            Ok(api) => Some(api),
            Err(BindError::NoSqlite) => {
                tracing::info!("boot: no SQLite follows the shim; engine is inert");
                None
            }
            Err(err) => {
                // A half-bound table would crash the host somewhere deep
                // inside its own call sites; dying here with a name beats
                // that every time.
                eprintln!("pgqlite: fatal: {err}");
                tracing::error!("boot: {err}");
                unsafe { libc::abort() }
            }
        };
        Engine::build(config, api)
    }

    fn build(config: Config, api: Option<&'static SqliteApi>) -> Engine {
        Engine {
            pool: Pool::new(
                PgBackend::new(config.conninfo()),
                config.pool_max,
                config.claim_timeout,
            ),
            rewriter: Rewriter::new(config.rewriter_cache_cap, config.rewriter_cache_max_sql),
            registry: Registry::new(),
            colbuf: ColumnRing::new(config.colbuf_slots, config.colbuf_slot_bytes),
            databases: DbRegistry::default(),
            config,
            api,
        }
    }

    /// An engine with no resolved SQLite and a backend address nothing
    /// listens on, so tests exercise the state machines offline.
    #[doc(hidden)]
    pub fn inert_for_tests() -> Engine {
        let config = Config::from_env();
        Engine {
            pool: Pool::new(
                PgBackend::new(
                    "host=127.0.0.1 port=1 user=pgqlite dbname=pgqlite connect_timeout=1"
                        .to_string(),
                ),
                4,
                std::time::Duration::from_millis(200),
            ),
            rewriter: Rewriter::new(config.rewriter_cache_cap, config.rewriter_cache_max_sql),
            registry: Registry::new(),
            colbuf: ColumnRing::new(64, 8192),
            databases: DbRegistry::default(),
            config,
            api: None,
        }
    }
}
